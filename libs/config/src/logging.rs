//! Logging bootstrap
//!
//! Installs a global `tracing` subscriber. `RUST_LOG` wins over the
//! configured level so a single run can be made more verbose without
//! touching the config file.

use crate::runtime_config::LoggingConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber once
///
/// Returns `false` if a subscriber was already installed (by an earlier call
/// or by the embedding application); that is not an error.
pub fn init(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry.with(fmt::layer().json().with_thread_names(true)).try_init()
    } else {
        registry.with(fmt::layer().with_thread_names(true)).try_init()
    };
    result.is_ok()
}

/// Subscriber for tests: output captured by the test harness
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        init(&config);
        assert!(!init(&config));
        init_for_tests();
        tracing::info!(component = "logging", "subscriber installed");
    }
}
