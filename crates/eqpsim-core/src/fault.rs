//! Per-connection fault injection state.
//!
//! Four independently scoped effects (delay, drop, corrupt, fragment) mutate
//! the outbound path. Application order on every send is fixed: delay first,
//! then drop, corrupt, fragment. Delay must resolve before the probabilistic
//! stages run, otherwise a delayed frame could never be dropped because the
//! drop scope would already be spent when the delay fires.
//!
//! The engine schedules delays itself, so application is split in two:
//! [`FaultState::begin_send`] resolves only the delay stage and returns the
//! hold time, and [`FaultState::finish_send`] runs the remaining stages at
//! actual send time, returning the physical chunks to write (or `None` for a
//! dropped frame).

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::env::Environment;
use crate::scenario::{FaultKind, FaultScopeSpec};

/// XOR mask applied to the corrupted byte.
const CORRUPT_MASK: u8 = 0x5A;

/// Bound under which an installed effect stays active.
#[derive(Debug)]
pub enum FaultScope {
    /// Active while `now < expires_at`. Consumption is a pure gate.
    Duration {
        /// Expiry timestamp.
        expires_at: Instant,
    },
    /// Active for the next `remaining` applications.
    NextN {
        /// Applications left. Atomic so a shared model stays safe, though in
        /// this design each state is owned by exactly one connection.
        remaining: AtomicU32,
    },
}

impl FaultScope {
    fn from_spec(spec: FaultScopeSpec, now: Instant) -> Self {
        match spec {
            FaultScopeSpec::Duration(d) => Self::Duration { expires_at: now + d },
            FaultScopeSpec::NextN(n) => Self::NextN { remaining: AtomicU32::new(n) },
        }
    }

    /// Consumes one application. Duration scopes only gate on expiry;
    /// count scopes decrement-if-positive and turn inert at zero.
    pub fn try_consume(&self, now: Instant) -> bool {
        match self {
            Self::Duration { expires_at } => now < *expires_at,
            Self::NextN { remaining } => {
                let mut current = remaining.load(Ordering::Acquire);
                loop {
                    if current == 0 {
                        return false;
                    }
                    match remaining.compare_exchange_weak(
                        current,
                        current - 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return true,
                        Err(actual) => current = actual,
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
struct DelayEffect {
    delay: Duration,
    jitter: Duration,
    scope: FaultScope,
}

#[derive(Debug)]
struct FragmentEffect {
    min_parts: u32,
    max_parts: u32,
    scope: FaultScope,
}

#[derive(Debug)]
struct DropEffect {
    rate: f64,
    scope: FaultScope,
}

#[derive(Debug)]
struct CorruptEffect {
    rate: f64,
    protect_framing: bool,
    scope: FaultScope,
}

/// Mutable fault state, one per connection. Created with all effects absent,
/// mutated only by the owning connection's own fault steps.
#[derive(Debug, Default)]
pub struct FaultState {
    delay: Option<DelayEffect>,
    fragment: Option<FragmentEffect>,
    drop: Option<DropEffect>,
    corrupt: Option<CorruptEffect>,
}

impl FaultState {
    /// Creates a state with no active effects.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets all four effects to absent.
    pub fn clear(&mut self) {
        self.delay = None;
        self.fragment = None;
        self.drop = None;
        self.corrupt = None;
    }

    /// Installs the effect a fault step requests. Re-applying a kind replaces
    /// its previous effect and scope. `Disconnect` is connection lifecycle,
    /// not send-path state, and is handled by the engine instead.
    pub fn apply(&mut self, kind: &FaultKind, scope: FaultScopeSpec, now: Instant) {
        match kind {
            FaultKind::Delay { delay, jitter } => {
                self.delay = Some(DelayEffect {
                    delay: *delay,
                    jitter: *jitter,
                    scope: FaultScope::from_spec(scope, now),
                });
            }
            FaultKind::Fragment { min_parts, max_parts } => {
                self.fragment = Some(FragmentEffect {
                    min_parts: *min_parts,
                    max_parts: *max_parts,
                    scope: FaultScope::from_spec(scope, now),
                });
            }
            FaultKind::Drop { rate } => {
                self.drop =
                    Some(DropEffect { rate: *rate, scope: FaultScope::from_spec(scope, now) });
            }
            FaultKind::Corrupt { rate, protect_framing } => {
                self.corrupt = Some(CorruptEffect {
                    rate: *rate,
                    protect_framing: *protect_framing,
                    scope: FaultScope::from_spec(scope, now),
                });
            }
            FaultKind::Clear => self.clear(),
            FaultKind::Disconnect { .. } => {}
        }
    }

    /// Resolves the delay stage for one outbound frame. Returns the hold
    /// time when a delay applies; the caller schedules [`Self::finish_send`]
    /// after it. An exhausted delay scope means send now.
    pub fn begin_send<E: Environment>(&self, env: &E) -> Option<Duration> {
        let delay = self.delay.as_ref()?;
        if !delay.scope.try_consume(env.now()) {
            return None;
        }
        Some(delay.delay + env.random_jitter(delay.jitter))
    }

    /// Runs the drop, corrupt, and fragment stages at actual send time.
    /// Returns the chunks to write as separate physical sends, or `None`
    /// when the frame was dropped.
    pub fn finish_send<E: Environment>(
        &self,
        env: &E,
        frame: Bytes,
        overhead: (usize, usize),
    ) -> Option<Vec<Bytes>> {
        let now = env.now();

        if let Some(drop) = &self.drop {
            if drop.scope.try_consume(now) && env.random_unit() < drop.rate {
                return None;
            }
        }

        let mut frame = frame;
        if let Some(corrupt) = &self.corrupt {
            if corrupt.scope.try_consume(now) && env.random_unit() < corrupt.rate {
                frame = corrupt_frame(env, &frame, corrupt.protect_framing, overhead);
            }
        }

        if let Some(fragment) = &self.fragment {
            if fragment.scope.try_consume(now) {
                let parts = env
                    .random_range(u64::from(fragment.min_parts), u64::from(fragment.max_parts));
                return Some(split_frame(env, &frame, parts as usize));
            }
        }

        Some(vec![frame])
    }
}

/// Flips one byte at a random position. With framing protection the position
/// excludes the policy's prefix/suffix bytes; a frame with no unprotected
/// bytes is left untouched.
fn corrupt_frame<E: Environment>(
    env: &E,
    frame: &Bytes,
    protect_framing: bool,
    overhead: (usize, usize),
) -> Bytes {
    let (prefix, suffix) = if protect_framing { overhead } else { (0, 0) };
    let from = prefix.min(frame.len());
    let to = frame.len().saturating_sub(suffix).max(from);
    if to == from {
        return frame.clone();
    }

    let idx = env.random_range(from as u64, (to - 1) as u64) as usize;
    let mut bytes = frame.to_vec();
    bytes[idx] ^= CORRUPT_MASK;
    Bytes::from(bytes)
}

/// Splits a frame into `parts` contiguous near-equal chunks with adjacent
/// random size swaps. Framing bytes are included in the split.
fn split_frame<E: Environment>(env: &E, frame: &Bytes, parts: usize) -> Vec<Bytes> {
    let len = frame.len();
    if parts <= 1 || len <= 1 {
        return vec![frame.clone()];
    }

    // Every chunk gets at least one byte.
    let parts = parts.min(len);
    let base = len / parts;
    let rem = len % parts;
    let mut sizes: Vec<usize> =
        (0..parts).map(|i| base + usize::from(i < rem)).collect();
    for i in 0..sizes.len() - 1 {
        if env.random_u64() & 1 == 1 {
            sizes.swap(i, i + 1);
        }
    }

    let mut chunks = Vec::with_capacity(parts);
    let mut pos = 0;
    for size in sizes {
        chunks.push(frame.slice(pos..pos + size));
        pos += size;
    }
    chunks
}
