//! Tracing subscriber setup
//!
//! Embedders call [`init`] once at startup. `RUST_LOG` overrides the
//! configured default directive.

use tracing_subscriber::EnvFilter;

use crate::core::config::LoggingConfig;

/// Install the global fmt subscriber.
///
/// Returns `false` when a subscriber was already installed (e.g. by the host
/// application or a previous call); that is not an error.
pub fn init(config: &LoggingConfig) -> bool {
    let filter = build_filter(config);

    if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .is_ok()
    }
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        let config = LoggingConfig::default();
        let _ = init(&config);
        assert!(!init(&config));
    }

    #[test]
    fn test_bad_directive_falls_back() {
        let config = LoggingConfig {
            filter: "[[[".to_string(),
            json: false,
        };
        // Must not panic
        let _ = build_filter(&config);
    }
}
