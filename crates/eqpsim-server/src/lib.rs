//! EQP simulator production runtime.
//!
//! Ties the Sans-IO engine to real sockets:
//!
//! ```text
//! eqpsim-server
//!   ├─ SimConfig           (declarative YAML tree)
//!   ├─ Registry            (validated runtime view + identity pools)
//!   ├─ listener/connector  (accept-side and initiate-side TCP transport)
//!   ├─ connection          (per-connection handshake + scenario driver)
//!   ├─ CompletionTracker   (coordinated shutdown)
//!   └─ SystemEnv           (production Environment impl)
//! ```

pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod listener;
pub mod registry;
pub mod system_env;
pub mod tracker;

use std::path::Path;
use std::sync::Arc;

pub use config::{ConfigError, SimConfig};
pub use error::ServerError;
pub use registry::{Registry, RegistryError};
pub use system_env::SystemEnv;
pub use tracker::CompletionTracker;
use tracing::{info, warn};

/// A fully validated simulation, ready to run.
pub struct Simulator {
    env: SystemEnv,
    registry: Arc<Registry>,
    tracker: Arc<CompletionTracker>,
}

impl Simulator {
    /// Loads, validates, and compiles everything a configuration file
    /// references.
    pub fn from_config_file(path: &Path) -> Result<Self, ServerError> {
        let config = SimConfig::load(path)?;
        Self::new(&config)
    }

    /// Validates an already deserialized configuration.
    pub fn new(config: &SimConfig) -> Result<Self, ServerError> {
        let registry = Arc::new(Registry::build(config)?);
        let tracker =
            Arc::new(CompletionTracker::new(registry.eqp_ids().map(ToString::to_string)));
        Ok(Self { env: SystemEnv::new(), registry, tracker })
    }

    /// Runs the simulation: binds every listen endpoint, starts every active
    /// equipment, and returns once all scenarios have completed and no
    /// accept-side connection remains open.
    pub async fn run(self) -> Result<(), ServerError> {
        if self.registry.eqp_ids().next().is_none() {
            warn!("no equipment configured, the simulator will not exit on its own");
        }

        for spec in self.registry.listeners() {
            let listener = listener::bind(spec).await?;
            tokio::spawn(listener::accept_loop(
                listener,
                spec.clone(),
                self.env.clone(),
                Arc::clone(&self.registry),
                Arc::clone(&self.tracker),
            ));
        }

        for eqp in self.registry.active_eqps() {
            tokio::spawn(connector::connect_loop(
                Arc::clone(eqp),
                self.registry.backoff().clone(),
                self.env.clone(),
                Arc::clone(&self.tracker),
            ));
        }

        self.tracker.wait_for_shutdown().await;
        info!("all scenarios completed, shutting down");
        Ok(())
    }
}
