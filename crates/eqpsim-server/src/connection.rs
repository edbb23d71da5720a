//! Per-connection driver.
//!
//! Each connection, accepted or initiated, runs the same two phases. First
//! the handshake: the counterpart must send `CMD=INITIALIZE` within the
//! equipment's handshake timeout, and gets `CMD=INITIALIZE_REP EQPID=<id>`
//! back. Then the scenario: a [`ScenarioRunner`] owns all protocol decisions
//! and this driver only moves bytes, arms timers, and reports completion.
//!
//! Timers are spawned tasks sleeping on the environment clock and reporting
//! back over a channel; cancellation aborts the task. The runner tolerates
//! late expirations of cancelled timers, so the abort is best-effort.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use eqpsim_core::{CloseReason, EqpContext, Environment, RunnerAction, ScenarioRunner, TimerId};
use eqpsim_proto::{FrameDecoder, extract_command};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::registry::EqpRuntime;
use crate::tracker::CompletionTracker;

/// Command that opens every session.
const HANDSHAKE_CMD: &str = "INITIALIZE";

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique connection id for logging and tracking.
pub fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Runs one connection to completion. Returns the engine's close reason, or
/// `None` when the counterpart closed first (or the handshake never
/// finished).
pub async fn run_connection<E: Environment>(
    env: E,
    stream: TcpStream,
    eqp: Arc<EqpRuntime>,
    tracker: Arc<CompletionTracker>,
    conn_id: u64,
) -> Option<CloseReason> {
    let peer = stream.peer_addr().map_or_else(|_| "?".to_string(), |a| a.to_string());
    info!(conn_id, eqp_id = %eqp.eqp_id, peer = %peer, "connection opened");

    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = FrameDecoder::new(eqp.policy.clone());

    let handshake = handshake(&mut reader, &mut writer, &mut decoder, &eqp, conn_id);
    let pending = match tokio::time::timeout(eqp.handshake_timeout, handshake).await {
        Ok(Ok(Some(pending))) => pending,
        Ok(Ok(None)) => {
            info!(conn_id, eqp_id = %eqp.eqp_id, "closed before handshake completed");
            return None;
        }
        Ok(Err(e)) => {
            debug!(conn_id, eqp_id = %eqp.eqp_id, error = %e, "handshake i/o error");
            return None;
        }
        Err(_) => {
            warn!(
                conn_id,
                eqp_id = %eqp.eqp_id,
                timeout_ms = eqp.handshake_timeout.as_millis(),
                "handshake timed out"
            );
            return None;
        }
    };

    let ctx = EqpContext {
        eqp_id: eqp.eqp_id.clone(),
        vars: eqp.vars.clone(),
        wait_timeout: Some(eqp.wait_timeout),
        active: eqp.active,
    };
    let runner = ScenarioRunner::new(env.clone(), Arc::clone(&eqp.plan), eqp.policy.clone(), ctx);
    let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
    let mut driver = Driver {
        env,
        runner,
        writer,
        timer_tx,
        timers: HashMap::new(),
        tracker,
        eqp: Arc::clone(&eqp),
        conn_id,
        close_reason: None,
    };

    let actions = driver.runner.start();
    let mut running = driver.apply(actions).await;

    // Frames decoded in the same read as INITIALIZE belong to the scenario.
    for frame in pending {
        if !running {
            break;
        }
        let actions = driver.on_rx(&frame);
        running = driver.apply(actions).await;
    }

    let mut buf = vec![0u8; 8192];
    'conn: while running {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!(conn_id, eqp_id = %eqp.eqp_id, "counterpart closed");
                    driver.runner.on_closed();
                    break 'conn;
                }
                Ok(n) => {
                    let frames = match decoder.push(&buf[..n]) {
                        Ok(frames) => frames,
                        Err(e) => {
                            warn!(conn_id, eqp_id = %eqp.eqp_id, error = %e, "framing failure, closing");
                            driver.runner.on_closed();
                            break 'conn;
                        }
                    };
                    for frame in frames {
                        let actions = driver.on_rx(&frame);
                        if !driver.apply(actions).await {
                            break 'conn;
                        }
                    }
                }
                Err(e) => {
                    debug!(conn_id, eqp_id = %eqp.eqp_id, error = %e, "read error");
                    driver.runner.on_closed();
                    break 'conn;
                }
            },
            Some(id) = timer_rx.recv() => {
                let actions = driver.runner.on_timer(id);
                if !driver.apply(actions).await {
                    break 'conn;
                }
            }
        }
    }

    for (_, handle) in driver.timers.drain() {
        handle.abort();
    }
    let _ = driver.writer.shutdown().await;
    info!(conn_id, eqp_id = %eqp.eqp_id, reason = ?driver.close_reason, "connection closed");
    driver.close_reason
}

/// Reads until `CMD=INITIALIZE` arrives and answers it. Non-matching frames
/// keep the wait alive. Returns any frames decoded after the handshake one,
/// or `None` when the counterpart closed or framing failed.
async fn handshake(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    decoder: &mut FrameDecoder,
    eqp: &EqpRuntime,
    conn_id: u64,
) -> std::io::Result<Option<Vec<Bytes>>> {
    let mut buf = [0u8; 4096];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        let frames = match decoder.push(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(conn_id, eqp_id = %eqp.eqp_id, error = %e, "framing failure during handshake");
                return Ok(None);
            }
        };

        let mut frames = frames.into_iter();
        for frame in frames.by_ref() {
            let text = String::from_utf8_lossy(&frame);
            if extract_command(&text).as_deref() == Some(HANDSHAKE_CMD) {
                let reply = format!("CMD=INITIALIZE_REP EQPID={}", eqp.eqp_id);
                writer.write_all(&eqp.policy.encode(reply.as_bytes())).await?;
                info!(conn_id, eqp_id = %eqp.eqp_id, "handshake completed");
                return Ok(Some(frames.collect()));
            }
            debug!(
                conn_id,
                eqp_id = %eqp.eqp_id,
                payload = %text,
                "non-handshake frame before INITIALIZE, ignored"
            );
        }
    }
}

struct Driver<E: Environment> {
    env: E,
    runner: ScenarioRunner<E>,
    writer: OwnedWriteHalf,
    timer_tx: mpsc::UnboundedSender<TimerId>,
    timers: HashMap<TimerId, AbortHandle>,
    tracker: Arc<CompletionTracker>,
    eqp: Arc<EqpRuntime>,
    conn_id: u64,
    close_reason: Option<CloseReason>,
}

impl<E: Environment> Driver<E> {
    fn on_rx(&mut self, frame: &[u8]) -> Vec<RunnerAction> {
        debug!(
            conn_id = self.conn_id,
            eqp_id = %self.eqp.eqp_id,
            payload = %String::from_utf8_lossy(frame),
            "rx"
        );
        self.runner.on_frame(frame)
    }

    /// Executes engine actions. Returns `false` once the connection should
    /// stop (close requested or a write failed).
    async fn apply(&mut self, actions: Vec<RunnerAction>) -> bool {
        for action in actions {
            match action {
                RunnerAction::Transmit { chunks } => {
                    for chunk in chunks {
                        if let Err(e) = self.writer.write_all(&chunk).await {
                            debug!(
                                conn_id = self.conn_id,
                                eqp_id = %self.eqp.eqp_id,
                                error = %e,
                                "write failed"
                            );
                            self.runner.on_closed();
                            return false;
                        }
                    }
                }
                RunnerAction::StartTimer { id, after } => {
                    let tx = self.timer_tx.clone();
                    let env = self.env.clone();
                    let handle = tokio::spawn(async move {
                        env.sleep(after).await;
                        let _ = tx.send(id);
                    });
                    self.timers.insert(id, handle.abort_handle());
                }
                RunnerAction::CancelTimer { id } => {
                    if let Some(handle) = self.timers.remove(&id) {
                        handle.abort();
                    }
                }
                RunnerAction::Close { reason } => {
                    self.close_reason = Some(reason);
                    return false;
                }
                RunnerAction::Completed => {
                    self.tracker.scenario_completed(&self.eqp.eqp_id);
                }
            }
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use eqpsim_core::scenario::compile;
    use eqpsim_proto::{FramingPolicy, LineEnding};
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;
    use crate::system_env::SystemEnv;

    fn runtime(active: bool, script: &str) -> Arc<EqpRuntime> {
        Arc::new(EqpRuntime {
            eqp_id: "EQP1".to_string(),
            active,
            endpoint_id: "ep".to_string(),
            target: None,
            policy: FramingPolicy::LineEnd(LineEnding::Lf),
            plan: Arc::new(compile("test", script).unwrap()),
            wait_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            vars: HashMap::new(),
        })
    }

    async fn spawn_eqp(
        eqp: Arc<EqpRuntime>,
        tracker: Arc<CompletionTracker>,
    ) -> (TcpStream, tokio::task::JoinHandle<Option<CloseReason>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            run_connection(SystemEnv::new(), stream, eqp, tracker, next_conn_id()).await
        });
        (TcpStream::connect(addr).await.unwrap(), task)
    }

    #[tokio::test]
    async fn handshake_then_scenario_round_trip() {
        let eqp = runtime(false, "[TcToEqp] CMD=PING\n[EqpToTc] CMD=PONG EQPID={eqpid}");
        let tracker = Arc::new(CompletionTracker::new(["EQP1".to_string()]));
        let (tc, task) = spawn_eqp(eqp, Arc::clone(&tracker)).await;

        let (rx, mut tx) = tc.into_split();
        let mut lines = BufReader::new(rx).lines();

        tx.write_all(b"CMD=NOISE\n").await.unwrap();
        tx.write_all(b"CMD=INITIALIZE\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "CMD=INITIALIZE_REP EQPID=EQP1");

        tx.write_all(b"CMD=ping\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "CMD=PONG EQPID=EQP1");

        // Passive equipment keeps the connection open; the counterpart
        // closes.
        drop(tx);
        drop(lines);
        assert_eq!(task.await.unwrap(), None);
    }

    #[tokio::test]
    async fn active_equipment_closes_after_completion() {
        let eqp = runtime(true, "[EqpToTc] CMD=HELLO");
        let tracker = Arc::new(CompletionTracker::new(["EQP1".to_string()]));
        let (tc, task) = spawn_eqp(eqp, tracker).await;

        let (rx, mut tx) = tc.into_split();
        let mut lines = BufReader::new(rx).lines();

        tx.write_all(b"CMD=INITIALIZE\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "CMD=INITIALIZE_REP EQPID=EQP1");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "CMD=HELLO");

        assert_eq!(task.await.unwrap(), Some(CloseReason::ScenarioCompleted));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn handshake_timeout_closes() {
        let mut eqp = runtime(false, "[TcToEqp] CMD=PING");
        Arc::get_mut(&mut eqp).unwrap().handshake_timeout = Duration::from_millis(100);
        let tracker = Arc::new(CompletionTracker::new(["EQP1".to_string()]));
        let (tc, task) = spawn_eqp(eqp, tracker).await;

        // Never send INITIALIZE.
        assert_eq!(task.await.unwrap(), None);
        drop(tc);
    }

    #[tokio::test]
    async fn frames_behind_the_handshake_reach_the_scenario() {
        let eqp = runtime(false, "[TcToEqp] CMD=PING\n[EqpToTc] CMD=PONG");
        let tracker = Arc::new(CompletionTracker::new(["EQP1".to_string()]));
        let (tc, task) = spawn_eqp(eqp, tracker).await;

        let (rx, mut tx) = tc.into_split();
        let mut lines = BufReader::new(rx).lines();

        // One segment carrying the handshake and the first scenario frame.
        tx.write_all(b"CMD=INITIALIZE\nCMD=PING\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "CMD=INITIALIZE_REP EQPID=EQP1");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "CMD=PONG");

        drop(tx);
        drop(lines);
        assert_eq!(task.await.unwrap(), None);
    }
}
