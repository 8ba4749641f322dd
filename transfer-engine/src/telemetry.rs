//! Tracing setup for binaries and tests embedding the engine

use crate::{config::LoggingConfig, Error, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber
///
/// `RUST_LOG` wins over `config.level`. Fails if a subscriber is already set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::Config(format!("invalid log filter {:?}: {}", config.level, e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };

    installed.map_err(|e| Error::Config(format!("tracing already initialized: {}", e)))
}
