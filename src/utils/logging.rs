//! Tracing bootstrap shared by the server and client commands.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingSettings;

/// Installs the fmt subscriber. `RUST_LOG` takes precedence over
/// `settings.level`, which may be a bare level (`debug`) or a directive
/// list (`info,streamhub::broker=trace`).
pub fn init(settings: &LoggingSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_for(&settings.level));
    // try_init: tests and the binary may both install a subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Parses `directives`, falling back to `info` when they are invalid.
pub fn filter_for(directives: &str) -> EnvFilter {
    EnvFilter::try_new(directives).unwrap_or_else(|e| {
        eprintln!("invalid log filter {directives:?} ({e}), falling back to info");
        EnvFilter::new("info")
    })
}
