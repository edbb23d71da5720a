//! Scenario step variants.
//!
//! A closed set: the compiler produces exactly these, and the runner matches
//! exhaustively so a new variant can't silently fall through either side.

use std::time::Duration;

/// How an `Emit` step spaces its sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitMode {
    /// One send per period, period measured between consecutive sends.
    Interval,
    /// All sends at independent random offsets within one window.
    Window,
}

/// How many sends an `Emit` step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitCount {
    /// Exactly this many sends, then the plan advances. Always > 0.
    Fixed(u32),
    /// Never stops; the plan never advances past this step.
    Forever,
}

/// Bound under which a fault effect stays active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultScopeSpec {
    /// Active for this long after the fault step executes.
    Duration(Duration),
    /// Active for the next N applications.
    NextN(u32),
}

/// Fault effect requested by a `Fault` step.
#[derive(Debug, Clone, PartialEq)]
pub enum FaultKind {
    /// Hold each outbound frame for `delay` plus uniform jitter.
    Delay {
        /// Base hold time.
        delay: Duration,
        /// Upper bound of additional uniform jitter.
        jitter: Duration,
    },
    /// Split each outbound frame into several physical writes.
    Fragment {
        /// Minimum part count, > 0.
        min_parts: u32,
        /// Maximum part count, >= `min_parts`.
        max_parts: u32,
    },
    /// Discard outbound frames with this probability.
    Drop {
        /// Probability in `[0, 1]`.
        rate: f64,
    },
    /// Flip bits in outbound frames with this probability.
    Corrupt {
        /// Probability in `[0, 1]`.
        rate: f64,
        /// Keep the flip away from the framing prefix/suffix bytes.
        protect_framing: bool,
    },
    /// Close the connection after a delay. `down` is advisory only; the
    /// transport's reconnect policy may honor it, the engine does not.
    Disconnect {
        /// Delay before the close.
        after: Duration,
        /// Advisory downtime before reconnecting.
        down: Duration,
    },
    /// Reset all four effects to absent.
    Clear,
}

/// One step of a compiled scenario.
#[derive(Debug, Clone, PartialEq)]
pub enum ScenarioStep {
    /// Block until an inbound frame carries this command.
    Wait {
        /// Expected command, uppercased for case-insensitive matching.
        expected_cmd: String,
        /// Per-step timeout override; equipment default applies when absent.
        timeout_override: Option<Duration>,
    },
    /// Send one frame immediately.
    Send {
        /// Payload template with `{eqpid}` / `{var.*}` placeholders.
        payload: String,
    },
    /// Send repeatedly on a schedule.
    Emit {
        /// Interval or window scheduling.
        mode: EmitMode,
        /// The interval period or the window length.
        period: Duration,
        /// Fixed count or forever.
        count: EmitCount,
        /// Interval-mode jitter added to each period.
        jitter: Option<Duration>,
        /// Payload template.
        payload: String,
    },
    /// Pause the plan.
    Sleep {
        /// Pause length, may be zero.
        duration: Duration,
    },
    /// Jump target marker; a no-op at execution time.
    Label {
        /// Label name, unique within a plan.
        name: String,
    },
    /// Unconditional jump to another step.
    Goto {
        /// Step index of the target label, resolved at compile time.
        target: usize,
    },
    /// Bounded jump: loop back `count` times, then fall through.
    Loop {
        /// Iterations before falling through, > 0.
        count: u32,
        /// Step index of the target label, resolved at compile time.
        target: usize,
    },
    /// Mutate this connection's fault state (or schedule a disconnect).
    Fault {
        /// Which effect to install.
        kind: FaultKind,
        /// How long the effect stays active.
        scope: FaultScopeSpec,
    },
}
