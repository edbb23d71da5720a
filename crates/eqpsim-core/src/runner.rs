//! Scenario execution engine.
//!
//! One [`ScenarioRunner`] per connection walks a compiled plan as an
//! action-based state machine. The transport layer feeds it events (start,
//! decoded inbound frames, timer expirations, close) and executes the
//! actions it returns: transmit chunks, start or cancel a timer, close the
//! connection, report completion. The engine itself never touches a socket,
//! which keeps every scheduling and fault decision deterministic under a
//! seeded [`Environment`].
//!
//! Synchronous steps (send, label, goto, loop continuation, fault mutation)
//! run in a tight loop without yielding. Asynchronous steps (wait, emit,
//! sleep, fault disconnect) register a timer and return; the expiration
//! re-enters the loop. Timer ids are single-use: an id not found in the live
//! set fired after cancellation and is ignored, and no event produces
//! actions once the runner is closing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use eqpsim_proto::{FramingPolicy, extract_command};
use tracing::{debug, error, info, warn};

use crate::env::Environment;
use crate::fault::FaultState;
use crate::scenario::{EmitCount, EmitMode, FaultKind, ScenarioPlan, ScenarioStep};
use crate::template;

/// Wait timeout when neither the step nor the equipment configures one.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Delay between scenario completion and closing an initiating connection,
/// letting the final frames flush.
const CLOSE_GRACE: Duration = Duration::from_millis(100);

/// Opaque handle for a timer the engine asked the transport to arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Why the engine wants the connection closed. The transport's reconnect
/// policy keys off this: a completed scenario must not reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The plan ran to completion on an initiating connection.
    ScenarioCompleted,
    /// A wait step expired without a matching inbound command.
    WaitTimeout {
        /// The command that never arrived.
        expected: String,
    },
    /// A scheduled disconnect fault fired.
    FaultDisconnect {
        /// Advisory downtime before the transport reconnects.
        down: Duration,
    },
    /// The plan reached a step combination the compiler rejects.
    /// Unreachable through `compile`; kept for exhaustive handling.
    PlanError,
}

/// Instruction for the transport layer.
#[derive(Debug, PartialEq)]
pub enum RunnerAction {
    /// Write these chunks as separate physical sends, in order.
    Transmit {
        /// Framed (and possibly faulted) byte chunks.
        chunks: Vec<Bytes>,
    },
    /// Arm a timer; deliver `on_timer(id)` when it expires.
    StartTimer {
        /// Handle to report back.
        id: TimerId,
        /// Expiry delay.
        after: Duration,
    },
    /// Disarm a previously started timer.
    CancelTimer {
        /// Handle from the matching `StartTimer`.
        id: TimerId,
    },
    /// Close the connection.
    Close {
        /// Why, for logging and reconnect policy.
        reason: CloseReason,
    },
    /// The scenario ran to completion; report it to the completion tracker.
    Completed,
}

/// Per-connection equipment identity and configuration the engine needs.
#[derive(Debug, Clone)]
pub struct EqpContext {
    /// Assigned equipment identity, used for `{eqpid}` and logging.
    pub eqp_id: String,
    /// Template variables, keyed by lowercase name.
    pub vars: HashMap<String, String>,
    /// Equipment-level wait timeout; steps may override it per wait.
    pub wait_timeout: Option<Duration>,
    /// Whether this equipment initiates its connections. Initiators close
    /// after completion; accept-side equipment leaves the counterpart to
    /// close.
    pub active: bool,
}

#[derive(Debug)]
enum TimerKind {
    WaitTimeout,
    Sleep,
    EmitTick,
    WindowShot,
    DelayedSend { frame: Bytes },
    Disconnect { down: Duration },
    CloseGrace,
}

/// Step-execution state machine for one connection.
#[derive(Debug)]
pub struct ScenarioRunner<E: Environment> {
    env: E,
    plan: Arc<ScenarioPlan>,
    policy: FramingPolicy,
    ctx: EqpContext,
    fault: FaultState,

    step: usize,
    waiting_for: Option<(String, TimerId)>,
    loop_counters: HashMap<usize, u32>,
    emit_remaining: u32,
    window_total: u32,
    window_done: u32,

    timers: HashMap<TimerId, TimerKind>,
    next_timer: u64,

    started: bool,
    closing: bool,
    completed: bool,
    close_scheduled: bool,
}

impl<E: Environment> ScenarioRunner<E> {
    /// Creates a runner positioned at the first step. Nothing executes
    /// until [`Self::start`].
    pub fn new(env: E, plan: Arc<ScenarioPlan>, policy: FramingPolicy, ctx: EqpContext) -> Self {
        Self {
            env,
            plan,
            policy,
            ctx,
            fault: FaultState::new(),
            step: 0,
            waiting_for: None,
            loop_counters: HashMap::new(),
            emit_remaining: 0,
            window_total: 0,
            window_done: 0,
            timers: HashMap::new(),
            next_timer: 0,
            started: false,
            closing: false,
            completed: false,
            close_scheduled: false,
        }
    }

    /// Whether the plan has run to completion.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Whether the runner has requested (or observed) a close.
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Begins scenario execution. Idempotent.
    pub fn start(&mut self) -> Vec<RunnerAction> {
        let mut actions = Vec::new();
        if self.started || self.closing {
            return actions;
        }
        self.started = true;
        info!(
            eqp_id = %self.ctx.eqp_id,
            scenario = %self.plan.source(),
            steps = self.plan.len(),
            "scenario started"
        );
        self.drive(&mut actions);
        actions
    }

    /// Handles one decoded inbound frame. Matching the awaited command
    /// advances the plan; anything else is ignored and the wait continues.
    pub fn on_frame(&mut self, payload: &[u8]) -> Vec<RunnerAction> {
        let mut actions = Vec::new();
        if self.closing {
            return actions;
        }

        let text = String::from_utf8_lossy(payload);
        let cmd = extract_command(&text);

        let Some((expected, timer)) = &self.waiting_for else {
            debug!(
                eqp_id = %self.ctx.eqp_id,
                cmd = cmd.as_deref().unwrap_or(""),
                payload = %text,
                "rx while not waiting, ignored"
            );
            return actions;
        };

        if cmd.as_deref() != Some(expected.as_str()) {
            debug!(
                eqp_id = %self.ctx.eqp_id,
                cmd = cmd.as_deref().unwrap_or(""),
                expected = %expected,
                "rx did not match awaited command"
            );
            return actions;
        }

        info!(
            eqp_id = %self.ctx.eqp_id,
            step = self.step,
            cmd = %expected,
            "wait matched"
        );
        let timer = *timer;
        self.cancel_timer(timer, &mut actions);
        self.waiting_for = None;
        self.step += 1;
        self.drive(&mut actions);
        actions
    }

    /// Handles a timer expiration. Stale ids (cancelled or superseded) are
    /// ignored.
    pub fn on_timer(&mut self, id: TimerId) -> Vec<RunnerAction> {
        let mut actions = Vec::new();
        if self.closing {
            return actions;
        }
        let Some(kind) = self.timers.remove(&id) else {
            return actions;
        };

        match kind {
            TimerKind::WaitTimeout => {
                let expected =
                    self.waiting_for.take().map(|(cmd, _)| cmd).unwrap_or_default();
                warn!(
                    eqp_id = %self.ctx.eqp_id,
                    step = self.step,
                    expected = %expected,
                    "wait timed out"
                );
                self.close(CloseReason::WaitTimeout { expected }, &mut actions);
            }
            TimerKind::Sleep => {
                self.step += 1;
                self.drive(&mut actions);
            }
            TimerKind::EmitTick => self.emit_tick(&mut actions),
            TimerKind::WindowShot => self.window_shot(&mut actions),
            TimerKind::DelayedSend { frame } => self.transmit(frame, &mut actions),
            TimerKind::Disconnect { down } => {
                info!(
                    eqp_id = %self.ctx.eqp_id,
                    down_ms = down.as_millis(),
                    "disconnect fault executing"
                );
                self.close(CloseReason::FaultDisconnect { down }, &mut actions);
            }
            TimerKind::CloseGrace => {
                self.close(CloseReason::ScenarioCompleted, &mut actions);
            }
        }
        actions
    }

    /// Notes that the transport closed the connection. No further event
    /// produces actions.
    pub fn on_closed(&mut self) -> Vec<RunnerAction> {
        self.closing = true;
        self.waiting_for = None;
        self.timers.clear();
        Vec::new()
    }

    fn drive(&mut self, actions: &mut Vec<RunnerAction>) {
        loop {
            if self.closing {
                return;
            }
            let Some(step) = self.plan.steps().get(self.step).cloned() else {
                self.complete(actions);
                return;
            };

            match step {
                ScenarioStep::Label { .. } => self.step += 1,
                ScenarioStep::Goto { target } => self.step = target,
                ScenarioStep::Loop { count, target } => {
                    let done = self.loop_counters.get(&self.step).copied().unwrap_or(0);
                    if done < count {
                        self.loop_counters.insert(self.step, done + 1);
                        self.step = target;
                    } else {
                        // Clearing makes the loop re-enterable from a later
                        // goto.
                        self.loop_counters.remove(&self.step);
                        self.step += 1;
                    }
                }
                ScenarioStep::Send { payload } => {
                    self.send_payload(&payload, actions);
                    self.step += 1;
                }
                ScenarioStep::Sleep { duration } => {
                    self.start_timer(TimerKind::Sleep, duration, actions);
                    return;
                }
                ScenarioStep::Wait { expected_cmd, timeout_override } => {
                    let timeout = timeout_override
                        .or(self.ctx.wait_timeout)
                        .unwrap_or(DEFAULT_WAIT_TIMEOUT);
                    info!(
                        eqp_id = %self.ctx.eqp_id,
                        step = self.step,
                        expected = %expected_cmd,
                        timeout_ms = timeout.as_millis(),
                        "waiting for command"
                    );
                    let id = self.start_timer(TimerKind::WaitTimeout, timeout, actions);
                    self.waiting_for = Some((expected_cmd, id));
                    return;
                }
                ScenarioStep::Emit { mode, period, count, jitter, .. } => {
                    self.begin_emit(mode, period, count, jitter, actions);
                    return;
                }
                ScenarioStep::Fault { kind, scope } => {
                    if let FaultKind::Disconnect { after, down } = kind {
                        info!(
                            eqp_id = %self.ctx.eqp_id,
                            step = self.step,
                            after_ms = after.as_millis(),
                            down_ms = down.as_millis(),
                            "disconnect fault scheduled"
                        );
                        self.start_timer(TimerKind::Disconnect { down }, after, actions);
                        return;
                    }
                    info!(
                        eqp_id = %self.ctx.eqp_id,
                        step = self.step,
                        fault = ?kind,
                        "fault applied"
                    );
                    self.fault.apply(&kind, scope, self.env.now());
                    self.step += 1;
                }
            }
        }
    }

    fn begin_emit(
        &mut self,
        mode: EmitMode,
        period: Duration,
        count: EmitCount,
        jitter: Option<Duration>,
        actions: &mut Vec<RunnerAction>,
    ) {
        match (mode, count) {
            (EmitMode::Interval, count) => {
                if let EmitCount::Fixed(n) = count {
                    self.emit_remaining = n;
                }
                let first = period + self.env.random_jitter(jitter.unwrap_or_default());
                self.start_timer(TimerKind::EmitTick, first, actions);
            }
            (EmitMode::Window, EmitCount::Fixed(n)) => {
                self.window_total = n;
                self.window_done = 0;
                let window_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
                for _ in 0..n {
                    let offset = Duration::from_millis(self.env.random_range(0, window_ms));
                    self.start_timer(TimerKind::WindowShot, offset, actions);
                }
            }
            (EmitMode::Window, EmitCount::Forever) => {
                // The compiler rejects this combination.
                error!(eqp_id = %self.ctx.eqp_id, step = self.step, "window emit without count");
                self.close(CloseReason::PlanError, actions);
            }
        }
    }

    fn emit_tick(&mut self, actions: &mut Vec<RunnerAction>) {
        let Some(ScenarioStep::Emit { period, count, jitter, payload, .. }) =
            self.plan.steps().get(self.step).cloned()
        else {
            return;
        };

        self.send_payload(&payload, actions);

        match count {
            EmitCount::Forever => {
                let next = period + self.env.random_jitter(jitter.unwrap_or_default());
                self.start_timer(TimerKind::EmitTick, next, actions);
            }
            EmitCount::Fixed(total) => {
                self.emit_remaining = self.emit_remaining.saturating_sub(1);
                if self.emit_remaining == 0 {
                    info!(
                        eqp_id = %self.ctx.eqp_id,
                        step = self.step,
                        total,
                        "interval emit completed"
                    );
                    self.step += 1;
                    self.drive(actions);
                } else {
                    let next = period + self.env.random_jitter(jitter.unwrap_or_default());
                    self.start_timer(TimerKind::EmitTick, next, actions);
                }
            }
        }
    }

    fn window_shot(&mut self, actions: &mut Vec<RunnerAction>) {
        let Some(ScenarioStep::Emit { payload, .. }) = self.plan.steps().get(self.step).cloned()
        else {
            return;
        };

        self.send_payload(&payload, actions);
        self.window_done += 1;

        // Exactly the shot that reaches the total advances, once.
        if self.window_done == self.window_total {
            info!(
                eqp_id = %self.ctx.eqp_id,
                step = self.step,
                total = self.window_total,
                "window emit completed"
            );
            self.step += 1;
            self.drive(actions);
        }
    }

    fn send_payload(&mut self, payload: &str, actions: &mut Vec<RunnerAction>) {
        let resolved = template::resolve(payload, &self.ctx.eqp_id, &self.ctx.vars);
        debug!(
            eqp_id = %self.ctx.eqp_id,
            step = self.step,
            payload = %resolved,
            "tx"
        );
        let framed = self.policy.encode(resolved.as_bytes());
        if let Some(hold) = self.fault.begin_send(&self.env) {
            self.start_timer(TimerKind::DelayedSend { frame: framed }, hold, actions);
            return;
        }
        self.transmit(framed, actions);
    }

    fn transmit(&mut self, framed: Bytes, actions: &mut Vec<RunnerAction>) {
        match self.fault.finish_send(&self.env, framed, self.policy.overhead()) {
            Some(chunks) => actions.push(RunnerAction::Transmit { chunks }),
            None => {
                debug!(eqp_id = %self.ctx.eqp_id, "frame dropped by fault injection");
            }
        }
    }

    fn complete(&mut self, actions: &mut Vec<RunnerAction>) {
        if self.completed {
            return;
        }
        self.completed = true;
        info!(
            eqp_id = %self.ctx.eqp_id,
            scenario = %self.plan.source(),
            active = self.ctx.active,
            "scenario completed"
        );
        actions.push(RunnerAction::Completed);

        if self.ctx.active && !self.close_scheduled {
            self.close_scheduled = true;
            self.start_timer(TimerKind::CloseGrace, CLOSE_GRACE, actions);
        }
    }

    fn start_timer(
        &mut self,
        kind: TimerKind,
        after: Duration,
        actions: &mut Vec<RunnerAction>,
    ) -> TimerId {
        let id = TimerId(self.next_timer);
        self.next_timer += 1;
        self.timers.insert(id, kind);
        actions.push(RunnerAction::StartTimer { id, after });
        id
    }

    fn cancel_timer(&mut self, id: TimerId, actions: &mut Vec<RunnerAction>) {
        if self.timers.remove(&id).is_some() {
            actions.push(RunnerAction::CancelTimer { id });
        }
    }

    fn close(&mut self, reason: CloseReason, actions: &mut Vec<RunnerAction>) {
        if self.closing {
            return;
        }
        self.closing = true;
        self.waiting_for = None;
        for (id, _) in self.timers.drain() {
            actions.push(RunnerAction::CancelTimer { id });
        }
        actions.push(RunnerAction::Close { reason });
    }
}
