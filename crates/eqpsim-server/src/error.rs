//! Top-level server error type.

use thiserror::Error;

use crate::config::ConfigError;
use crate::registry::RegistryError;

/// Errors that abort the simulator.
///
/// Per-connection faults (resets, framing overflows, timeouts) are handled
/// where they happen and never surface here; this type covers startup and
/// transport setup only.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configuration file could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The configuration did not validate into a runtime registry.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// A listen socket could not be opened.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}
