use tracing_subscriber::EnvFilter;

use crate::config::{BridgeConfig, LOG_ENV};

const DEFAULT_FILTER: &str = "warn";

/// Installs a global fmt subscriber. The filter comes from `TVM_BRIDGE_LOG`,
/// then `config.log_filter`, then `warn`. Returns false when a subscriber was
/// already installed.
pub fn init(config: &BridgeConfig) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| match &config.log_filter {
            Some(directive) => EnvFilter::try_new(directive),
            None => EnvFilter::try_new(DEFAULT_FILTER),
        })
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
