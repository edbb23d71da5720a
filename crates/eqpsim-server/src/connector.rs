//! Initiate-side transport.
//!
//! Each active equipment owns one outbound connection to its counterpart and
//! keeps re-establishing it with exponential backoff. A close caused by
//! scenario completion ends the loop; anything else (refused connect, peer
//! reset, disconnect fault) schedules another attempt.

use std::sync::Arc;
use std::time::Duration;

use eqpsim_core::{CloseReason, Environment};
use tokio::net::TcpStream;
use tracing::{error, info, warn};

use crate::config::ConnectBackoffConfig;
use crate::connection::{next_conn_id, run_connection};
use crate::registry::EqpRuntime;
use crate::system_env::SystemEnv;
use crate::tracker::CompletionTracker;

/// Retry delay for the given attempt (1-based):
/// `ceil(initial * multiplier^(attempt-1))` seconds, clamped to `[1, max]`.
fn backoff_delay(backoff: &ConnectBackoffConfig, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX).min(63);
    let factor = backoff.multiplier.powi(exponent);
    let secs = (backoff.initial_sec as f64 * factor).ceil() as u64;
    Duration::from_secs(secs.clamp(1, backoff.max_sec.max(1)))
}

/// Runs one active equipment until its scenario completes.
pub async fn connect_loop(
    eqp: Arc<EqpRuntime>,
    backoff: ConnectBackoffConfig,
    env: SystemEnv,
    tracker: Arc<CompletionTracker>,
) {
    let Some(target) = eqp.target.clone() else {
        // The registry only marks equipment active when a connect endpoint
        // resolved.
        error!(eqp_id = %eqp.eqp_id, "active equipment without a target");
        return;
    };

    let mut attempt: u32 = 0;
    loop {
        match TcpStream::connect(&target).await {
            Ok(stream) => {
                attempt = 0;
                let conn_id = next_conn_id();
                let reason = run_connection(
                    env.clone(),
                    stream,
                    Arc::clone(&eqp),
                    Arc::clone(&tracker),
                    conn_id,
                )
                .await;
                match reason {
                    Some(CloseReason::ScenarioCompleted) => {
                        info!(eqp_id = %eqp.eqp_id, "scenario completed, not reconnecting");
                        return;
                    }
                    Some(CloseReason::FaultDisconnect { down }) if !down.is_zero() => {
                        info!(
                            eqp_id = %eqp.eqp_id,
                            down_ms = down.as_millis(),
                            "holding connection down"
                        );
                        env.sleep(down).await;
                    }
                    _ => {}
                }
            }
            Err(e) => {
                warn!(eqp_id = %eqp.eqp_id, target = %target, error = %e, "connect failed");
            }
        }

        attempt += 1;
        let delay = backoff_delay(&backoff, attempt);
        info!(
            eqp_id = %eqp.eqp_id,
            attempt,
            delay_sec = delay.as_secs(),
            "reconnecting"
        );
        env.sleep(delay).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use eqpsim_core::scenario::compile;
    use eqpsim_proto::{FramingPolicy, LineEnding};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;

    fn backoff(initial: u64, max: u64, multiplier: f64) -> ConnectBackoffConfig {
        ConnectBackoffConfig { initial_sec: initial, max_sec: max, multiplier }
    }

    #[test]
    fn delay_grows_geometrically_and_clamps() {
        let b = backoff(1, 30, 2.0);
        assert_eq!(backoff_delay(&b, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&b, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&b, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(&b, 6), Duration::from_secs(30));
        assert_eq!(backoff_delay(&b, 60), Duration::from_secs(30));
    }

    #[test]
    fn delay_rounds_up_and_never_drops_below_one_second() {
        let b = backoff(1, 10, 1.5);
        assert_eq!(backoff_delay(&b, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&b, 3), Duration::from_secs(3));
        let zero = backoff(0, 10, 2.0);
        assert_eq!(backoff_delay(&zero, 1), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn connector_stops_after_scenario_completion() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let eqp = Arc::new(EqpRuntime {
            eqp_id: "ACT1".to_string(),
            active: true,
            endpoint_id: "cp".to_string(),
            target: Some(addr.to_string()),
            policy: FramingPolicy::LineEnd(LineEnding::Lf),
            plan: Arc::new(compile("test", "[EqpToTc] CMD=DONE").unwrap()),
            wait_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            vars: HashMap::new(),
        });
        let tracker = Arc::new(CompletionTracker::new(["ACT1".to_string()]));

        let tc = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (rx, mut tx) = stream.into_split();
            let mut lines = BufReader::new(rx).lines();
            tx.write_all(b"CMD=INITIALIZE\n").await.unwrap();
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "CMD=INITIALIZE_REP EQPID=ACT1");
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "CMD=DONE");
            // Equipment closes after its grace period.
            assert_eq!(lines.next_line().await.unwrap(), None);
        });

        connect_loop(eqp, backoff(1, 2, 2.0), SystemEnv::new(), tracker).await;
        tc.await.unwrap();
    }
}
