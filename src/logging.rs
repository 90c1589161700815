//! Tracing infrastructure.
//!
//! Structured, async-aware logging via `tracing` and `tracing-subscriber`.
//! The filter honors `RUST_LOG` when present, otherwise falls back to the
//! configured level.

use tracing_subscriber::EnvFilter;

use crate::config::FrogConfig;
use crate::error::{FrogError, FrogResult};

/// Initialize the global subscriber from the application config.
pub fn init_from_config(config: &FrogConfig) -> FrogResult<()> {
    init_with_level(&config.application.log_level)
}

/// Initialize the global subscriber at an explicit level.
pub fn init_with_level(level: &str) -> FrogResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|err| FrogError::Configuration(format!("invalid log filter: {err}")))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|err| FrogError::Configuration(format!("tracing init failed: {err}")))?;
    Ok(())
}
