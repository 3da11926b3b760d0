//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `streamhub` crate.
//!
//! It centralizes the error taxonomy shared by the engine, the transport and
//! the client, and the logging bootstrap used by the binary and the tests.

pub mod backoff;
pub mod error;
pub mod logging;

#[cfg(test)]
mod tests {
    use super::logging;
    use crate::config::LoggingSettings;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        for level in ["info", "debug", "warn,streamhub::broker=trace"] {
            logging::init(&LoggingSettings {
                level: level.to_string(),
            });
        }
    }

    #[test]
    fn logging_filter_falls_back_to_info() {
        assert_eq!(logging::filter_for("debug").to_string(), "debug");
        assert_eq!(logging::filter_for("streamhub=loudest").to_string(), "info");
    }
}
