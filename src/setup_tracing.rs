use time::format_description::parse;
use tracing_subscriber::fmt::time::OffsetTime;

/// Initializes the global tracing subscriber for an embedding process.
///
/// `default_level` applies when `RUST_LOG` is unset; pass "info" for
/// server processes (operational visibility) and "warn" for short-lived
/// client tools.
pub fn setup_tracing(default_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false) // Remove module paths for cleaner output
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_ansi(true)
        .with_timer(OffsetTime::new(
            time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC),
            parse("[hour]:[minute]:[second].[subsecond digits:2]")
                .unwrap_or_default(),
        ))
        .compact()
        .init();
}
