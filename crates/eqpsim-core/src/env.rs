//! Environment abstraction for deterministic testing.
//!
//! The `Environment` trait decouples the scenario engine from system
//! resources (time, randomness, async sleeping). The production runtime
//! plugs in system time and OS randomness; tests plug in a seeded RNG and a
//! manually advanced clock so every jitter, drop decision, and fault scope
//! expiry is reproducible.
//!
//! # Invariants
//!
//! - Monotonicity: `env.now()` must never go backwards
//! - Determinism: test implementations with the same seed produce the same
//!   random sequence
//! - Isolation: implementations must not share global state

use std::time::{Duration, Instant};

/// Abstract environment providing time and randomness.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Returns the current time. Must be monotonic within one execution
    /// context.
    fn now(&self) -> Instant;

    /// Sleeps for the specified duration. Only driver code awaits this; the
    /// engine itself never blocks.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Uniform value in `[0, 1)`, used for drop/corrupt rate decisions.
    fn random_unit(&self) -> f64 {
        // 53 high bits give a uniform double in [0, 1).
        (self.random_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform integer in `[lo, hi]` (inclusive). Returns `lo` when the
    /// range is empty or inverted.
    fn random_range(&self, lo: u64, hi: u64) -> u64 {
        if hi <= lo {
            return lo;
        }
        let span = hi - lo + 1;
        lo + self.random_u64() % span
    }

    /// Uniform jitter in `[0, jitter]`, zero when `jitter` is zero.
    fn random_jitter(&self, jitter: Duration) -> Duration {
        let ms = jitter.as_millis().min(u128::from(u64::MAX)) as u64;
        Duration::from_millis(self.random_range(0, ms))
    }
}
