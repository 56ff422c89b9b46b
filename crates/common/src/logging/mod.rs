//! Tracing subscriber setup shared by the PetPal binaries

use crate::config::ObservabilityConfig;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    // A second init (tests, embedded use) keeps the first subscriber.
    let result = if config.json_logging {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if result.is_ok() {
        tracing::debug!(service = %config.service_name, "Tracing initialized");
    }
}
