//! Accept-side transport.
//!
//! One listener per configured listen endpoint. Each accepted connection
//! reserves a passive equipment identity from the endpoint's pool for its
//! lifetime; connections beyond the endpoint's ceiling, or arriving with the
//! pool exhausted, are closed immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::connection::{next_conn_id, run_connection};
use crate::registry::{ListenSpec, Registry};
use crate::system_env::SystemEnv;
use crate::tracker::CompletionTracker;

/// Opens the listen socket for one endpoint. The returned listener is bound;
/// feed it to [`accept_loop`].
pub async fn bind(spec: &ListenSpec) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(&spec.bind).await?;
    info!(
        endpoint = %spec.endpoint_id,
        addr = %listener.local_addr()?,
        max_conn = spec.max_conn,
        "listening"
    );
    Ok(listener)
}

/// Accepts connections for one endpoint until the process shuts down.
pub async fn accept_loop(
    listener: TcpListener,
    spec: ListenSpec,
    env: SystemEnv,
    registry: Arc<Registry>,
    tracker: Arc<CompletionTracker>,
) {
    let open = Arc::new(AtomicUsize::new(0));

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(endpoint = %spec.endpoint_id, error = %e, "accept failed");
                continue;
            }
        };

        let current = open.load(Ordering::Acquire);
        if current >= spec.max_conn {
            warn!(
                endpoint = %spec.endpoint_id,
                peer = %peer,
                open = current,
                max_conn = spec.max_conn,
                "connection limit reached, closing"
            );
            drop(stream);
            continue;
        }

        let Some(eqp) = registry.reserve(&spec.endpoint_id) else {
            warn!(
                endpoint = %spec.endpoint_id,
                peer = %peer,
                "no passive identity available, closing"
            );
            drop(stream);
            continue;
        };

        open.fetch_add(1, Ordering::AcqRel);
        let conn_id = next_conn_id();
        tracker.passive_opened(conn_id);

        let env = env.clone();
        let registry = Arc::clone(&registry);
        let tracker = Arc::clone(&tracker);
        let open = Arc::clone(&open);
        let endpoint_id = spec.endpoint_id.clone();
        tokio::spawn(async move {
            let eqp_id = eqp.eqp_id.clone();
            let reason = run_connection(env, stream, eqp, Arc::clone(&tracker), conn_id).await;
            debug!(conn_id, eqp_id = %eqp_id, reason = ?reason, "passive connection finished");
            tracker.passive_closed(conn_id);
            registry.release(&endpoint_id, &eqp_id);
            open.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    use super::*;
    use crate::config::SimConfig;

    fn registry_with_one_passive() -> (Arc<Registry>, tempfile::NamedTempFile) {
        let mut scenario = tempfile::NamedTempFile::new().unwrap();
        writeln!(scenario, "[TcToEqp] CMD=PING").unwrap();
        let yaml = format!(
            r"
socket-types:
  LINE_LF: {{ kind: LINE_END, line-ending: LF }}
endpoints:
  listen:
    lp: {{ bind: '127.0.0.1:0', max-conn: 1 }}
profiles:
  p1: {{ type: SCENARIO, scenario-file: {} }}
eqps:
  SOLO: {{ mode: PASSIVE, endpoint: lp, socket-type: LINE_LF, profile: p1 }}
",
            scenario.path().display()
        );
        let config: SimConfig = serde_yaml::from_str(&yaml).unwrap();
        (Arc::new(Registry::build(&config).unwrap()), scenario)
    }

    #[tokio::test]
    async fn second_connection_is_rejected_while_first_is_open() {
        let (registry, _scenario) = registry_with_one_passive();
        let spec = registry.listeners()[0].clone();
        let listener = bind(&spec).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tracker = Arc::new(CompletionTracker::new(["SOLO".to_string()]));

        tokio::spawn(accept_loop(
            listener,
            spec,
            SystemEnv::new(),
            Arc::clone(&registry),
            tracker,
        ));

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"CMD=INITIALIZE\n").await.unwrap();
        let mut lines = BufReader::new(&mut first).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "CMD=INITIALIZE_REP EQPID=SOLO");

        // Pool of one and max-conn of one: the second connection is dropped.
        let second = TcpStream::connect(addr).await.unwrap();
        let mut probe = BufReader::new(second).lines();
        assert_eq!(probe.next_line().await.unwrap(), None);

        drop(lines);
        drop(first);

        // The identity returns to the pool once the first connection closes.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let mut retry = TcpStream::connect(addr).await.unwrap();
                retry.write_all(b"CMD=INITIALIZE\n").await.unwrap();
                let mut lines = BufReader::new(&mut retry).lines();
                if let Ok(Some(line)) = lines.next_line().await {
                    assert_eq!(line, "CMD=INITIALIZE_REP EQPID=SOLO");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }
}
