//! Production `Environment` implementation using system time and RNG.

use std::time::Duration;

use eqpsim_core::env::Environment;

/// Production environment backed by `Instant::now`, `tokio::time::sleep`,
/// and `getrandom`.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    fn now(&self) -> std::time::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).unwrap_or_else(|e| {
            // Should never fail on supported platforms. Zero-fill keeps the
            // process alive; jitter and fault decisions degrade but work.
            tracing::error!("getrandom failed: {}", e);
            buffer.fill(0);
        });
    }
}
