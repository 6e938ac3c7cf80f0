//! Runs one claimed background job and monitors it to a terminal status.
//!
//! Thread jobs execute in-process on a spawned task; Microservice jobs
//! run as an external process carrying the base64-encoded invocation.
//! Either way a monitor heartbeats the record under its distributed lock,
//! observes external stop requests, and guarantees that every failure
//! path writes a terminal status for exactly this background job.

use chrono::Utc;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{Error, JobError, Result};
use crate::invocation::JobContext;
use crate::lock::DistributedLock;
use crate::model::{Job, JobKind, JobLog, JobStatus};
use crate::server::worker::WorkerSlot;
use crate::server::ServerContext;

/// How one execution attempt ended from the worker's point of view.
enum Outcome {
    /// The work ran to completion; the error, if any, decides
    /// Processed vs Failed and the retry policy.
    Completed {
        error: Option<JobError>,
        retriable: bool,
    },
    /// The monitor terminated the work and already wrote Interrupted.
    Interrupted,
}

/// Entry point of the task spawned per dequeued background job. Never
/// lets a failure escape; the slot is freed when this returns.
pub(crate) async fn process(
    context: Arc<ServerContext>,
    queue: QueueConfig,
    background_job_id: Uuid,
    _slot: WorkerSlot,
) {
    if let Err(storage_error) = run(context, queue, background_job_id).await {
        error!(
            background_job_id = %background_job_id,
            error = %storage_error,
            "background job processing aborted by storage fault"
        );
    }
}

async fn run(
    context: Arc<ServerContext>,
    queue: QueueConfig,
    background_job_id: Uuid,
) -> Result<()> {
    let storage = &context.storage;
    let Some(mut background_job) = storage.get_background_job(background_job_id).await? else {
        return Ok(());
    };
    // A stop may have arrived while the id sat in the queue.
    if background_job.status != JobStatus::Enqueued {
        debug!(
            background_job_id = %background_job_id,
            status = %background_job.status,
            "skipping dequeued job that is no longer enqueued"
        );
        return Ok(());
    }
    let Some(mut job) = storage.get_job(background_job.job_id).await? else {
        background_job.error = Some(JobError::new("job definition not found"));
        background_job.complete();
        storage.save_background_job(&background_job).await?;
        return Ok(());
    };

    job.tries += 1;
    storage.save_job(&job, true).await?;

    let now = Utc::now();
    background_job.status = JobStatus::Processing;
    background_job.processed_by = Some(context.server.id);
    background_job.server_hostname = Some(context.server.hostname.clone());
    background_job.started_at = Some(now);
    background_job.last_activity = Some(now);
    storage.save_background_job(&background_job).await?;
    debug!(
        background_job_id = %background_job_id,
        target = job.invocation.target,
        tries = job.tries,
        "background job started"
    );

    let outcome = match job.kind {
        JobKind::Thread => run_thread(&context, &job, background_job_id).await?,
        JobKind::Microservice => run_process(&context, &job, background_job_id).await?,
    };

    match outcome {
        Outcome::Completed { error, retriable } => {
            complete(&context, &queue, job, background_job_id, error, retriable).await
        }
        Outcome::Interrupted => Ok(()),
    }
}

/// Runs a Thread job on a spawned task and monitors it.
async fn run_thread(
    context: &Arc<ServerContext>,
    job: &Job,
    background_job_id: Uuid,
) -> Result<Outcome> {
    let cancellation = CancellationToken::new();
    let job_context = JobContext::new(background_job_id, cancellation.clone());
    let registry = context.registry.clone();
    let target = job.invocation.target.clone();
    let arguments = job.invocation.argument_object();
    let unknown_target = !registry.contains(&target);
    let mut handle: JoinHandle<std::result::Result<(), JobError>> =
        tokio::spawn(async move { registry.execute(&target, job_context, arguments).await });

    let interval = context.config.job_heartbeat_interval();
    loop {
        tokio::select! {
            result = &mut handle => {
                let error = match result {
                    Ok(Ok(())) => None,
                    Ok(Err(job_error)) => Some(job_error),
                    Err(join_error) => {
                        Some(JobError::new(format!("job task panicked: {join_error}")))
                    }
                };
                // An unregistered target is a configuration error, not a
                // transient failure; it must not burn the retry budget.
                return Ok(Outcome::Completed { error, retriable: !unknown_target });
            }
            _ = context.shutdown.cancelled() => {
                terminate_thread(context, job, background_job_id, &cancellation, &mut handle)
                    .await?;
                return Ok(Outcome::Interrupted);
            }
            _ = tokio::time::sleep(interval) => {}
        }

        match heartbeat(context, background_job_id).await? {
            Heartbeat::Alive | Heartbeat::LockBusy => {}
            Heartbeat::StopRequested => {
                terminate_thread(context, job, background_job_id, &cancellation, &mut handle)
                    .await?;
                return Ok(Outcome::Interrupted);
            }
        }
    }
}

/// Cooperative cancel with a hard abort fallback, then Interrupted.
async fn terminate_thread(
    context: &Arc<ServerContext>,
    job: &Job,
    background_job_id: Uuid,
    cancellation: &CancellationToken,
    handle: &mut JoinHandle<std::result::Result<(), JobError>>,
) -> Result<()> {
    cancellation.cancel();
    if job.invocation.cancellable {
        let grace = context.config.inactive_job_timeout();
        tokio::select! {
            _ = &mut *handle => {}
            _ = tokio::time::sleep(grace) => {
                warn!(
                    background_job_id = %background_job_id,
                    "job ignored cancellation, aborting"
                );
                handle.abort();
            }
        }
    } else {
        handle.abort();
    }
    mark_interrupted(context, background_job_id).await
}

/// Runs a Microservice job as an external process, sampling its resource
/// usage at heartbeat cadence.
async fn run_process(
    context: &Arc<ServerContext>,
    job: &Job,
    background_job_id: Uuid,
) -> Result<Outcome> {
    let launch_arg = job.invocation.to_launch_arg()?;
    let spawned = tokio::process::Command::new(&job.invocation.target)
        .arg(launch_arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(io_error) => {
            // Launch failures are configuration errors.
            let error = Error::ProcessLaunch(job.invocation.target.clone(), io_error);
            return Ok(Outcome::Completed {
                error: Some(JobError::new(error.to_string())),
                retriable: false,
            });
        }
    };

    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut captured = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut captured).await;
        }
        captured
    });

    let mut sampler = UsageSampler::new(child.id());
    let interval = context.config.job_heartbeat_interval();
    let exit = loop {
        tokio::select! {
            exit = child.wait() => break exit,
            _ = context.shutdown.cancelled() => {
                kill_process(context, background_job_id, &mut child).await?;
                return Ok(Outcome::Interrupted);
            }
            _ = tokio::time::sleep(interval) => {}
        }

        if let Some(log) = sampler.sample() {
            // Best effort; a lost sample never fails the job.
            if let Err(log_error) = context.storage.append_log(background_job_id, &log).await {
                warn!(background_job_id = %background_job_id, error = %log_error, "failed to append usage sample");
            }
        }

        match heartbeat(context, background_job_id).await? {
            Heartbeat::Alive | Heartbeat::LockBusy => {}
            Heartbeat::StopRequested => {
                kill_process(context, background_job_id, &mut child).await?;
                return Ok(Outcome::Interrupted);
            }
        }
    };

    if !sampler.sampled_once() {
        // Short-lived processes still get one (empty) usage entry.
        let log = JobLog {
            time: Utc::now(),
            cpu_usage: 0.0,
            memory_usage: 0.0,
            cpu_time: 0.0,
        };
        if let Err(log_error) = context.storage.append_log(background_job_id, &log).await {
            warn!(background_job_id = %background_job_id, error = %log_error, "failed to append usage sample");
        }
    }

    let captured = stderr_task.await.unwrap_or_default();
    let error = match exit {
        Ok(status) if status.success() => None,
        Ok(_) => Some(JobError::from_stderr(&captured)),
        Err(wait_error) => Some(JobError::new(format!(
            "failed to wait for process: {wait_error}"
        ))),
    };
    Ok(Outcome::Completed { error, retriable: true })
}

/// Always a hard kill for external processes, then Interrupted.
async fn kill_process(
    context: &Arc<ServerContext>,
    background_job_id: Uuid,
    child: &mut tokio::process::Child,
) -> Result<()> {
    if let Err(kill_error) = child.start_kill() {
        warn!(background_job_id = %background_job_id, error = %kill_error, "failed to kill job process");
    }
    let _ = child.wait().await;
    mark_interrupted(context, background_job_id).await
}

enum Heartbeat {
    Alive,
    /// Another process holds the record's lock; skip this cycle.
    LockBusy,
    /// The record is gone, terminal, or Canceled: terminate the work.
    StopRequested,
}

/// One monitor cycle under the background job's distributed lock:
/// refresh `last_activity` while the record still says Processing.
async fn heartbeat(context: &Arc<ServerContext>, background_job_id: Uuid) -> Result<Heartbeat> {
    let Some(guard) = DistributedLock::try_acquire(
        context.storage.clone(),
        &context.config,
        &background_job_id.to_string(),
        std::time::Duration::ZERO,
    )
    .await?
    else {
        return Ok(Heartbeat::LockBusy);
    };
    let outcome = match context.storage.get_background_job(background_job_id).await? {
        Some(mut current) if current.status == JobStatus::Processing => {
            current.last_activity = Some(Utc::now());
            context.storage.save_background_job(&current).await?;
            Heartbeat::Alive
        }
        _ => Heartbeat::StopRequested,
    };
    guard.release().await?;
    Ok(outcome)
}

/// Writes the Interrupted terminal status, if the record still exists.
async fn mark_interrupted(context: &Arc<ServerContext>, background_job_id: Uuid) -> Result<()> {
    let guard = DistributedLock::acquire(
        context.storage.clone(),
        &context.config,
        &background_job_id.to_string(),
    )
    .await?;
    let result: Result<()> = async {
        let Some(mut current) = context.storage.get_background_job(background_job_id).await?
        else {
            return Ok(());
        };
        current.status = JobStatus::Interrupted;
        current.completed_at = Some(Utc::now());
        context.storage.save_background_job(&current).await?;
        info!(background_job_id = %background_job_id, "background job interrupted");
        Ok(())
    }
    .await;
    guard.release().await?;
    result
}

/// Terminal status write plus the queue's retry policy, under the
/// record's distributed lock.
async fn complete(
    context: &Arc<ServerContext>,
    queue: &QueueConfig,
    mut job: Job,
    background_job_id: Uuid,
    error: Option<JobError>,
    retriable: bool,
) -> Result<()> {
    let guard = DistributedLock::acquire(
        context.storage.clone(),
        &context.config,
        &background_job_id.to_string(),
    )
    .await?;
    let result: Result<()> = async {
        let Some(mut current) = context.storage.get_background_job(background_job_id).await?
        else {
            return Ok(());
        };
        // Only the Processing record is ours to finish; anything else was
        // already terminated externally.
        if current.status != JobStatus::Processing {
            return Ok(());
        }
        if let Some(job_error) = &error {
            error!(
                background_job_id = %background_job_id,
                target = job.invocation.target,
                error = %job_error,
                "background job failed"
            );
        }
        current.error = error;
        current.complete();
        context.storage.save_background_job(&current).await?;
        debug!(
            background_job_id = %background_job_id,
            status = %current.status,
            "background job finished"
        );

        if current.status == JobStatus::Failed && retriable && queue.retries >= job.tries {
            job.active = true;
            job.start_at =
                Some(Utc::now() + chrono::Duration::seconds(queue.retry_interval as i64));
            context.storage.save_job(&job, true).await?;
            info!(
                job_id = %job.id,
                tries = job.tries,
                retries = queue.retries,
                "retry scheduled"
            );
        }
        Ok(())
    }
    .await;
    guard.release().await?;
    result
}

/// CPU%/memory sampler with delta compression: only changed samples are
/// reported.
struct UsageSampler {
    system: sysinfo::System,
    pid: Option<sysinfo::Pid>,
    cores: f64,
    last: Option<JobLog>,
    /// Processor seconds integrated from the per-interval CPU readings.
    cpu_seconds: f64,
    last_sample_at: Option<std::time::Instant>,
}

impl UsageSampler {
    fn new(pid: Option<u32>) -> Self {
        Self {
            system: sysinfo::System::new(),
            pid: pid.map(sysinfo::Pid::from_u32),
            cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1) as f64,
            last: Some(JobLog {
                time: Utc::now(),
                cpu_usage: 0.0,
                memory_usage: 0.0,
                cpu_time: 0.0,
            }),
            cpu_seconds: 0.0,
            last_sample_at: None,
        }
    }

    fn sampled_once(&self) -> bool {
        // The seed sample does not count; it only primes the comparison.
        self.last
            .as_ref()
            .is_none_or(|l| l.cpu_usage != 0.0 || l.memory_usage != 0.0)
    }

    /// Takes a sample; `None` when it matches the previous one.
    fn sample(&mut self) -> Option<JobLog> {
        let pid = self.pid?;
        if !self.system.refresh_process(pid) {
            return None;
        }
        let process = self.system.process(pid)?;
        let now = std::time::Instant::now();
        // cpu_usage is percent of one core; integrating it over the time
        // since the previous reading approximates total processor seconds.
        if let Some(previous) = self.last_sample_at {
            let elapsed = now.duration_since(previous).as_secs_f64();
            self.cpu_seconds += process.cpu_usage() as f64 / 100.0 * elapsed;
        }
        self.last_sample_at = Some(now);
        let cpu_usage = round2(process.cpu_usage() as f64 / self.cores);
        let memory_usage = round2(process.memory() as f64 / (1024.0 * 1024.0));
        let log = JobLog {
            time: Utc::now(),
            cpu_usage,
            memory_usage,
            cpu_time: round2(self.cpu_seconds),
        };
        if self.last.as_ref().is_some_and(|last| last.same_usage(&log)) {
            return None;
        }
        self.last = Some(log.clone());
        Some(log)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
