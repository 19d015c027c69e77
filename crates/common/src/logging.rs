//! Logging setup
//!
//! Completion processing happens on one worker thread per pipe, named
//! `pipe-<endpoint>` (for example `pipe-0x81`), and the loopback device runs
//! on `loopback-transport`. The fmt layer prints thread names so events from
//! different pipes can be told apart.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Build the filter: `RUST_LOG` first, then `default_level`
pub fn log_filter(default_level: &str) -> crate::Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::LogFilter {
            filter: default_level.to_string(),
            reason: e.to_string(),
        })
}

/// Install the global tracing subscriber
///
/// Fails if a subscriber is already installed.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    tracing_subscriber::registry()
        .with(log_filter(default_level)?)
        .with(fmt::layer().with_thread_names(true).with_target(false))
        .try_init()
        .map_err(|e| crate::Error::LoggingInstalled(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_accepts_levels() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            assert!(log_filter(level).is_ok());
        }
    }

    #[test]
    fn test_second_setup_is_rejected() {
        let _ = setup_logging("info");
        assert!(matches!(
            setup_logging("debug"),
            Err(crate::Error::LoggingInstalled(_))
        ));
    }
}
