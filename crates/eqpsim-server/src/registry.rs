//! Runtime registry built from the declarative configuration.
//!
//! Building the registry is the validation step: every socket-type, profile,
//! and endpoint reference is resolved, framing descriptors are turned into
//! [`FramingPolicy`] values, and every referenced scenario file is compiled.
//! Any failure aborts startup; an equipment must never run a partial plan.
//!
//! The registry also owns the passive identity pools. A passive listen
//! endpoint serves a fixed set of equipment ids; each accepted connection
//! reserves one id for its lifetime and returns it on close.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use eqpsim_core::scenario::compile_file;
use eqpsim_core::{CompileError, ScenarioPlan};
use eqpsim_proto::{FramingError, FramingPolicy, LineEnding, parse_hex_sequence};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{
    ConnectBackoffConfig, EqpMode, LineEndingConfig, ProfileKind, SimConfig, SocketKind,
    SocketTypeConfig,
};

/// Configuration validation failures. All of these abort startup.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// An equipment names a socket type that is not defined.
    #[error("eqp {eqp} references unknown socket type {socket_type}")]
    UnknownSocketType {
        /// Equipment id.
        eqp: String,
        /// The dangling reference.
        socket_type: String,
    },
    /// An equipment names a profile that is not defined.
    #[error("eqp {eqp} references unknown profile {profile}")]
    UnknownProfile {
        /// Equipment id.
        eqp: String,
        /// The dangling reference.
        profile: String,
    },
    /// A passive equipment names a listen endpoint that is not defined.
    #[error("passive eqp {eqp} references unknown listen endpoint {endpoint}")]
    UnknownListenEndpoint {
        /// Equipment id.
        eqp: String,
        /// The dangling reference.
        endpoint: String,
    },
    /// An active equipment names a connect endpoint that is not defined.
    #[error("active eqp {eqp} references unknown connect endpoint {endpoint}")]
    UnknownConnectEndpoint {
        /// Equipment id.
        eqp: String,
        /// The dangling reference.
        endpoint: String,
    },
    /// A socket type omits a field its kind requires.
    #[error("socket type {id} is missing {field}")]
    IncompleteSocketType {
        /// Socket-type id.
        id: String,
        /// The missing field.
        field: &'static str,
    },
    /// A socket-type descriptor does not produce a valid framing policy.
    #[error("socket type {id}: {source}")]
    Framing {
        /// Socket-type id.
        id: String,
        /// Underlying framing error.
        #[source]
        source: FramingError,
    },
    /// A referenced profile uses the reserved RATE kind.
    #[error("profile {id}: RATE profiles are not supported")]
    UnsupportedProfile {
        /// Profile id.
        id: String,
    },
    /// A SCENARIO profile omits its scenario file.
    #[error("profile {id} is missing scenario-file")]
    MissingScenarioFile {
        /// Profile id.
        id: String,
    },
    /// A referenced scenario file failed to compile.
    #[error("profile {id}: {source}")]
    Compile {
        /// Profile id.
        id: String,
        /// Underlying compile error.
        #[source]
        source: CompileError,
    },
}

/// One accept-side socket the transport must open.
#[derive(Debug, Clone)]
pub struct ListenSpec {
    /// Endpoint id, used for pool lookups and logging.
    pub endpoint_id: String,
    /// Bind address, `host:port`.
    pub bind: String,
    /// Concurrent connection ceiling.
    pub max_conn: usize,
}

/// Fully resolved per-equipment runtime data.
#[derive(Debug)]
pub struct EqpRuntime {
    /// Equipment id.
    pub eqp_id: String,
    /// Whether this equipment initiates its connection.
    pub active: bool,
    /// Endpoint id this equipment is attached to.
    pub endpoint_id: String,
    /// Connect target, `host:port`. Present for active equipment only.
    pub target: Option<String>,
    /// Framing policy for both directions of the connection.
    pub policy: FramingPolicy,
    /// Compiled scenario plan.
    pub plan: Arc<ScenarioPlan>,
    /// Resolved wait-step timeout.
    pub wait_timeout: Duration,
    /// Resolved handshake timeout.
    pub handshake_timeout: Duration,
    /// Template variables, keys lowercased.
    pub vars: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct PassivePool {
    available: VecDeque<String>,
    reserved: HashSet<String>,
}

/// Validated runtime view of the configuration.
#[derive(Debug)]
pub struct Registry {
    eqps: HashMap<String, Arc<EqpRuntime>>,
    listeners: Vec<ListenSpec>,
    active: Vec<Arc<EqpRuntime>>,
    backoff: ConnectBackoffConfig,
    pools: HashMap<String, Mutex<PassivePool>>,
}

impl Registry {
    /// Validates the configuration and compiles every referenced scenario.
    pub fn build(config: &SimConfig) -> Result<Self, RegistryError> {
        let mut policies = HashMap::new();
        for (id, socket_type) in &config.socket_types {
            policies.insert(id.clone(), build_policy(id, socket_type)?);
        }

        let mut plans: HashMap<String, Arc<ScenarioPlan>> = HashMap::new();
        let mut eqps = HashMap::new();
        let mut active = Vec::new();
        let mut pools: HashMap<String, Mutex<PassivePool>> = HashMap::new();
        let mut active_refs: HashMap<String, u32> = HashMap::new();

        for (eqp_id, eqp) in &config.eqps {
            let policy = policies.get(&eqp.socket_type).ok_or_else(|| {
                RegistryError::UnknownSocketType {
                    eqp: eqp_id.clone(),
                    socket_type: eqp.socket_type.clone(),
                }
            })?;

            let plan = match plans.get(&eqp.profile) {
                Some(plan) => Arc::clone(plan),
                None => {
                    let profile = config.profiles.get(&eqp.profile).ok_or_else(|| {
                        RegistryError::UnknownProfile {
                            eqp: eqp_id.clone(),
                            profile: eqp.profile.clone(),
                        }
                    })?;
                    let plan = compile_profile(&eqp.profile, profile.kind, profile.scenario_file.as_deref())?;
                    plans.insert(eqp.profile.clone(), Arc::clone(&plan));
                    plan
                }
            };

            let target = match eqp.mode {
                EqpMode::Passive => {
                    if !config.endpoints.listen.contains_key(&eqp.endpoint) {
                        return Err(RegistryError::UnknownListenEndpoint {
                            eqp: eqp_id.clone(),
                            endpoint: eqp.endpoint.clone(),
                        });
                    }
                    pools
                        .entry(eqp.endpoint.clone())
                        .or_default()
                        .get_mut()
                        .unwrap_or_else(PoisonError::into_inner)
                        .available
                        .push_back(eqp_id.clone());
                    None
                }
                EqpMode::Active => {
                    let endpoint =
                        config.endpoints.connect.get(&eqp.endpoint).ok_or_else(|| {
                            RegistryError::UnknownConnectEndpoint {
                                eqp: eqp_id.clone(),
                                endpoint: eqp.endpoint.clone(),
                            }
                        })?;
                    *active_refs.entry(eqp.endpoint.clone()).or_default() += 1;
                    Some(endpoint.target.clone())
                }
            };

            let runtime = Arc::new(EqpRuntime {
                eqp_id: eqp_id.clone(),
                active: eqp.mode == EqpMode::Active,
                endpoint_id: eqp.endpoint.clone(),
                target,
                policy: policy.clone(),
                plan,
                wait_timeout: resolve_timeout(
                    eqp.wait_timeout_sec,
                    config.defaults.default_wait_timeout_sec,
                ),
                handshake_timeout: resolve_timeout(
                    eqp.handshake_timeout_sec,
                    config.defaults.default_handshake_timeout_sec,
                ),
                vars: eqp
                    .vars
                    .iter()
                    .map(|(k, v)| (k.to_lowercase(), v.clone()))
                    .collect(),
            });

            if runtime.active {
                active.push(Arc::clone(&runtime));
            }
            eqps.insert(eqp_id.clone(), runtime);
        }

        for (endpoint_id, endpoint) in &config.endpoints.connect {
            let referenced = active_refs.get(endpoint_id).copied().unwrap_or(0);
            if endpoint.conn_count > 0 && endpoint.conn_count != referenced {
                warn!(
                    endpoint = %endpoint_id,
                    configured = endpoint.conn_count,
                    referenced,
                    "connect endpoint conn-count does not match its active eqps"
                );
            }
        }

        let listeners = config
            .endpoints
            .listen
            .iter()
            .map(|(id, endpoint)| ListenSpec {
                endpoint_id: id.clone(),
                bind: endpoint.bind.clone(),
                max_conn: endpoint.max_conn,
            })
            .collect::<Vec<_>>();

        info!(
            eqps = eqps.len(),
            listen_endpoints = listeners.len(),
            active_eqps = active.len(),
            "registry ready"
        );

        Ok(Self {
            eqps,
            listeners,
            active,
            backoff: config.endpoints.connect_backoff.clone(),
            pools,
        })
    }

    /// Accept-side sockets to open.
    pub fn listeners(&self) -> &[ListenSpec] {
        &self.listeners
    }

    /// Equipment that initiates its own connections.
    pub fn active_eqps(&self) -> &[Arc<EqpRuntime>] {
        &self.active
    }

    /// Reconnect backoff parameters.
    pub fn backoff(&self) -> &ConnectBackoffConfig {
        &self.backoff
    }

    /// All equipment ids, for completion tracking.
    pub fn eqp_ids(&self) -> impl Iterator<Item = &str> {
        self.eqps.keys().map(String::as_str)
    }

    /// Reserves a passive identity for a new connection on the given listen
    /// endpoint. Returns `None` when the pool is exhausted (or the endpoint
    /// has no passive equipment at all).
    pub fn reserve(&self, endpoint_id: &str) -> Option<Arc<EqpRuntime>> {
        let pool = self.pools.get(endpoint_id)?;
        let mut pool = pool.lock().unwrap_or_else(PoisonError::into_inner);
        let eqp_id = pool.available.pop_front()?;
        pool.reserved.insert(eqp_id.clone());
        drop(pool);
        info!(endpoint = %endpoint_id, eqp_id = %eqp_id, "passive identity reserved");
        self.eqps.get(&eqp_id).map(Arc::clone)
    }

    /// Returns a passive identity to its pool. An id that is not currently
    /// reserved is refused; returning it would let the pool hand the same
    /// identity to two connections.
    pub fn release(&self, endpoint_id: &str, eqp_id: &str) {
        let Some(pool) = self.pools.get(endpoint_id) else {
            warn!(endpoint = %endpoint_id, eqp_id = %eqp_id, "release for unknown endpoint refused");
            return;
        };
        let mut pool = pool.lock().unwrap_or_else(PoisonError::into_inner);
        if pool.reserved.remove(eqp_id) {
            pool.available.push_back(eqp_id.to_string());
            drop(pool);
            info!(endpoint = %endpoint_id, eqp_id = %eqp_id, "passive identity released");
        } else {
            drop(pool);
            warn!(
                endpoint = %endpoint_id,
                eqp_id = %eqp_id,
                "release of unreserved identity refused"
            );
        }
    }
}

fn resolve_timeout(configured_sec: u64, default_sec: u64) -> Duration {
    if configured_sec > 0 {
        Duration::from_secs(configured_sec)
    } else {
        Duration::from_secs(default_sec)
    }
}

fn build_policy(id: &str, socket_type: &SocketTypeConfig) -> Result<FramingPolicy, RegistryError> {
    match socket_type.kind {
        SocketKind::LineEnd => {
            let ending = socket_type.line_ending.ok_or(RegistryError::IncompleteSocketType {
                id: id.to_string(),
                field: "line-ending",
            })?;
            Ok(FramingPolicy::LineEnd(match ending {
                LineEndingConfig::Lf => LineEnding::Lf,
                LineEndingConfig::Cr => LineEnding::Cr,
                LineEndingConfig::Crlf => LineEnding::Crlf,
            }))
        }
        SocketKind::StartEnd => {
            let start_hex = socket_type.start_hex.as_deref().ok_or(
                RegistryError::IncompleteSocketType { id: id.to_string(), field: "start-hex" },
            )?;
            let end_hex = socket_type.end_hex.as_deref().ok_or(
                RegistryError::IncompleteSocketType { id: id.to_string(), field: "end-hex" },
            )?;
            let start = parse_hex_sequence(start_hex)
                .map_err(|source| RegistryError::Framing { id: id.to_string(), source })?;
            let end = parse_hex_sequence(end_hex)
                .map_err(|source| RegistryError::Framing { id: id.to_string(), source })?;
            FramingPolicy::start_end(start, end)
                .map_err(|source| RegistryError::Framing { id: id.to_string(), source })
        }
        SocketKind::Regex => {
            let pattern = socket_type.regex_pattern.as_deref().ok_or(
                RegistryError::IncompleteSocketType { id: id.to_string(), field: "regex-pattern" },
            )?;
            FramingPolicy::pattern(pattern)
                .map_err(|source| RegistryError::Framing { id: id.to_string(), source })
        }
    }
}

fn compile_profile(
    id: &str,
    kind: ProfileKind,
    scenario_file: Option<&str>,
) -> Result<Arc<ScenarioPlan>, RegistryError> {
    if kind == ProfileKind::Rate {
        return Err(RegistryError::UnsupportedProfile { id: id.to_string() });
    }
    let file = scenario_file.ok_or(RegistryError::MissingScenarioFile { id: id.to_string() })?;
    let plan = compile_file(Path::new(file))
        .map_err(|source| RegistryError::Compile { id: id.to_string(), source })?;
    info!(profile = %id, scenario = %file, steps = plan.len(), "scenario compiled");
    Ok(Arc::new(plan))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use super::*;

    fn scenario_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[EqpToTc] CMD=PING").unwrap();
        file
    }

    fn config(yaml: &str) -> SimConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn base_yaml(scenario_path: &str) -> String {
        format!(
            r"
socket-types:
  LINE_LF:
    kind: LINE_END
    line-ending: LF
endpoints:
  listen:
    lp:
      bind: 127.0.0.1:0
      max-conn: 3
  connect:
    cp:
      target: 127.0.0.1:9009
      conn-count: 1
profiles:
  p1:
    type: SCENARIO
    scenario-file: {scenario_path}
eqps:
  EQA:
    mode: PASSIVE
    endpoint: lp
    socket-type: LINE_LF
    profile: p1
  EQB:
    mode: PASSIVE
    endpoint: lp
    socket-type: LINE_LF
    profile: p1
    wait-timeout-sec: 7
  EQC:
    mode: ACTIVE
    endpoint: cp
    socket-type: LINE_LF
    profile: p1
"
        )
    }

    #[test]
    fn build_resolves_references_and_timeouts() {
        let scenario = scenario_file();
        let registry =
            Registry::build(&config(&base_yaml(&scenario.path().display().to_string()))).unwrap();

        assert_eq!(registry.listeners().len(), 1);
        assert_eq!(registry.active_eqps().len(), 1);
        assert_eq!(registry.active_eqps()[0].eqp_id, "EQC");
        assert_eq!(
            registry.active_eqps()[0].target.as_deref(),
            Some("127.0.0.1:9009")
        );

        let a = registry.reserve("lp").unwrap();
        assert_eq!(a.wait_timeout, Duration::from_secs(60));
        let b = registry.reserve("lp").unwrap();
        assert_eq!(b.eqp_id, "EQB");
        assert_eq!(b.wait_timeout, Duration::from_secs(7));
        assert_eq!(b.handshake_timeout, Duration::from_secs(60));
    }

    #[test]
    fn pool_exhaustion_and_release_cycle() {
        let scenario = scenario_file();
        let registry =
            Registry::build(&config(&base_yaml(&scenario.path().display().to_string()))).unwrap();

        let a = registry.reserve("lp").unwrap();
        let _b = registry.reserve("lp").unwrap();
        assert!(registry.reserve("lp").is_none());

        registry.release("lp", &a.eqp_id);
        let again = registry.reserve("lp").unwrap();
        assert_eq!(again.eqp_id, a.eqp_id);
    }

    #[test]
    fn double_release_is_refused() {
        let scenario = scenario_file();
        let registry =
            Registry::build(&config(&base_yaml(&scenario.path().display().to_string()))).unwrap();

        let a = registry.reserve("lp").unwrap();
        registry.release("lp", &a.eqp_id);
        registry.release("lp", &a.eqp_id);

        // One release, one slot: pool holds EQA (released) and EQB.
        assert!(registry.reserve("lp").is_some());
        assert!(registry.reserve("lp").is_some());
        assert!(registry.reserve("lp").is_none());
    }

    #[test]
    fn unknown_socket_type_fails_build() {
        let scenario = scenario_file();
        let yaml = base_yaml(&scenario.path().display().to_string())
            .replace("socket-type: LINE_LF", "socket-type: NOPE");
        let err = Registry::build(&config(&yaml)).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownSocketType { .. }));
    }

    #[test]
    fn rate_profile_is_rejected() {
        let scenario = scenario_file();
        let yaml = base_yaml(&scenario.path().display().to_string())
            .replace("type: SCENARIO", "type: RATE");
        let err = Registry::build(&config(&yaml)).unwrap_err();
        assert!(matches!(err, RegistryError::UnsupportedProfile { .. }));
    }

    #[test]
    fn broken_scenario_aborts_build() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[Sim] goto=missing").unwrap();
        let yaml = base_yaml(&file.path().display().to_string());
        let err = Registry::build(&config(&yaml)).unwrap_err();
        assert!(matches!(err, RegistryError::Compile { .. }));
    }

    #[test]
    fn start_end_descriptor_builds_policy() {
        let scenario = scenario_file();
        let yaml = base_yaml(&scenario.path().display().to_string()).replace(
            "    kind: LINE_END\n    line-ending: LF",
            "    kind: START_END\n    start-hex: '0x02'\n    end-hex: '03'",
        );
        let registry = Registry::build(&config(&yaml)).unwrap();
        let eqp = registry.reserve("lp").unwrap();
        assert!(matches!(eqp.policy, FramingPolicy::StartEnd { .. }));
    }
}
