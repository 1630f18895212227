//! Tracing setup for embedders.
//!
//! The bridge only emits `tracing` events; installing a subscriber is left
//! to the embedder. [`init_tracing`] is the convenience used by hosts that
//! do not bring their own.

use crate::error::{BridgeError, BridgeResult};
use anyhow::Context;
use tracing_subscriber::EnvFilter;

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `filter` is used, typically
/// [`EnvConfig::log_filter`](crate::config::EnvConfig::log_filter).
/// Fails if a global subscriber is already installed.
pub fn init_tracing(filter: &str) -> BridgeResult<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => EnvFilter::try_new(filter)
            .with_context(|| format!("invalid log filter {:?}", filter))
            .map_err(BridgeError::Logging)?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .map_err(|e| BridgeError::Logging(anyhow::anyhow!("failed to install subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_LOG_FILTER;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn test_second_init_fails() {
        let _ = init_tracing(DEFAULT_LOG_FILTER);
        let err = init_tracing(DEFAULT_LOG_FILTER).unwrap_err();
        assert!(matches!(err, BridgeError::Logging(_)));
        assert!(err.to_string().starts_with("Logging setup failed"));
    }
}
