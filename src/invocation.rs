use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, JobError, Result};

/// Argument prefix marking a launch argument as a base64 invocation
/// descriptor when running a job as an external process.
pub const LAUNCH_ARG_PREFIX: &str = "taskmill.base64:";

/// One serialized argument of an invocation: a name, a caller-supplied
/// type tag, and the JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub name: String,
    pub type_tag: String,
    pub value: serde_json::Value,
}

/// An explicit, serializable description of a unit of work.
///
/// For [`JobKind::Thread`](crate::model::JobKind) jobs the target is a
/// handler name resolved in a [`JobRegistry`]; for
/// [`JobKind::Microservice`](crate::model::JobKind) jobs it is the program
/// to launch, which receives the whole descriptor base64-encoded behind
/// [`LAUNCH_ARG_PREFIX`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub target: String,
    pub arguments: Vec<Argument>,
    /// Whether the unit of work observes a cancellation context; when
    /// false, a stop request terminates it immediately instead of waiting
    /// for cooperative shutdown.
    #[serde(default)]
    pub cancellable: bool,
    /// Queue override; when absent the job kind's default queue is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

impl Invocation {
    pub fn builder(target: impl Into<String>) -> InvocationBuilder {
        InvocationBuilder {
            target: target.into(),
            arguments: Vec::new(),
            cancellable: false,
            queue: None,
        }
    }

    /// The arguments as a JSON object keyed by argument name, the shape
    /// handler argument structs deserialize from.
    pub fn argument_object(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .arguments
            .iter()
            .map(|a| (a.name.clone(), a.value.clone()))
            .collect();
        serde_json::Value::Object(map)
    }

    pub fn to_launch_arg(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(format!("{LAUNCH_ARG_PREFIX}{}", BASE64.encode(json)))
    }

    /// Recovers an invocation from a process launch argument, returning
    /// `None` for arguments that do not carry the prefix.
    pub fn from_launch_arg(arg: &str) -> Result<Option<Self>> {
        let Some(encoded) = arg.strip_prefix(LAUNCH_ARG_PREFIX) else {
            return Ok(None);
        };
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| Error::InvalidJob(format!("malformed launch argument: {e}")))?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

pub struct InvocationBuilder {
    target: String,
    arguments: Vec<Argument>,
    cancellable: bool,
    queue: Option<String>,
}

impl InvocationBuilder {
    /// Adds a named argument; the type tag is derived from the Rust type.
    pub fn arg<T: Serialize>(mut self, name: impl Into<String>, value: &T) -> Result<Self> {
        self.arguments.push(Argument {
            name: name.into(),
            type_tag: std::any::type_name::<T>().to_string(),
            value: serde_json::to_value(value)?,
        });
        Ok(self)
    }

    /// Declares that the target observes the cancellation context.
    pub fn cancellable(mut self) -> Self {
        self.cancellable = true;
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn build(self) -> Result<Invocation> {
        if self.target.trim().is_empty() {
            return Err(Error::InvalidJob("invocation target must not be empty".into()));
        }
        Ok(Invocation {
            target: self.target,
            arguments: self.arguments,
            cancellable: self.cancellable,
            queue: self.queue,
        })
    }
}

/// Execution context handed to a job handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub background_job_id: Uuid,
    cancellation: CancellationToken,
}

impl JobContext {
    pub fn new(background_job_id: Uuid, cancellation: CancellationToken) -> Self {
        Self {
            background_job_id,
            cancellation,
        }
    }

    /// True once a stop has been requested for this background job.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Completes when a stop is requested; intended for use in
    /// `tokio::select!` inside cooperative handlers.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }
}

/// A unit of work executable in-process.
///
/// Implementations are registered in a [`JobRegistry`] under their
/// [`name`](JobHandler::name) and receive their arguments deserialized
/// from the invocation's argument object.
pub trait JobHandler: Send + Sync {
    type Arguments: DeserializeOwned + Send;

    fn name() -> &'static str;

    fn execute(
        ctx: JobContext,
        arguments: Self::Arguments,
    ) -> impl Future<Output = std::result::Result<(), JobError>> + Send;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type Executor = Arc<
    dyn Fn(JobContext, serde_json::Value) -> BoxFuture<'static, std::result::Result<(), JobError>>
        + Send
        + Sync,
>;

/// Maps invocation targets to executable handlers for Thread jobs.
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: HashMap<&'static str, Executor>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: JobHandler + 'static>(&mut self) {
        self.handlers.insert(
            H::name(),
            Arc::new(|ctx: JobContext, args: serde_json::Value| {
                Box::pin(async move {
                    let arguments: H::Arguments = serde_json::from_value(args).map_err(|e| {
                        JobError::new(format!("failed to parse job arguments: {e}"))
                    })?;
                    H::execute(ctx, arguments).await
                })
            }),
        );
    }

    pub fn contains(&self, target: &str) -> bool {
        self.handlers.contains_key(target)
    }

    pub fn targets(&self) -> impl Iterator<Item = &&'static str> {
        self.handlers.keys()
    }

    /// Runs the handler registered for `target`. An unregistered target
    /// is a configuration error and fails permanently.
    pub async fn execute(
        &self,
        target: &str,
        ctx: JobContext,
        arguments: serde_json::Value,
    ) -> std::result::Result<(), JobError> {
        match self.handlers.get(target) {
            Some(executor) => executor(ctx, arguments).await,
            None => Err(JobError::new(format!(
                "no handler registered for target '{target}'"
            ))),
        }
    }
}
