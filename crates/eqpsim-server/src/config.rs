//! Declarative YAML configuration.
//!
//! One file describes the whole simulation: shared defaults, socket types
//! (framing descriptors), endpoints (listen and connect sides plus reconnect
//! backoff), scenario profiles, and the equipment instances that tie them
//! together by id. Deserialization is purely structural; reference integrity
//! is checked when the [`crate::registry::Registry`] is built.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("{path}: {source}")]
    Io {
        /// Path as given on the command line.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid YAML for the expected schema.
    #[error("{path}: {source}")]
    Parse {
        /// Path as given on the command line.
        path: String,
        /// Underlying deserialization error.
        #[source]
        source: serde_yaml::Error,
    },
}

/// Root of the simulation configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SimConfig {
    /// Shared timeout defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,
    /// Framing descriptors, keyed by socket-type id.
    #[serde(default)]
    pub socket_types: BTreeMap<String, SocketTypeConfig>,
    /// Listen/connect endpoint definitions.
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    /// Scenario profiles, keyed by profile id.
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileConfig>,
    /// Equipment instances, keyed by equipment id.
    #[serde(default)]
    pub eqps: BTreeMap<String, EqpConfig>,
}

impl SimConfig {
    /// Loads and deserializes a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Fallback timeouts used when an equipment leaves its own at zero.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DefaultsConfig {
    /// Default wait-step timeout in seconds.
    #[serde(default = "default_timeout_sec")]
    pub default_wait_timeout_sec: u64,
    /// Default handshake timeout in seconds.
    #[serde(default = "default_timeout_sec")]
    pub default_handshake_timeout_sec: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            default_wait_timeout_sec: default_timeout_sec(),
            default_handshake_timeout_sec: default_timeout_sec(),
        }
    }
}

fn default_timeout_sec() -> u64 {
    60
}

/// Which framing family a socket type uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SocketKind {
    /// Frames terminated by a line ending.
    LineEnd,
    /// Frames bracketed by start/end byte sequences.
    StartEnd,
    /// Frames located by a regex over the buffered bytes.
    Regex,
}

/// Line terminator selection for `LINE_END` socket types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LineEndingConfig {
    /// `\n`
    Lf,
    /// `\r`
    Cr,
    /// `\r\n`
    Crlf,
}

/// One framing descriptor. Only the fields for the chosen `kind` are read.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SocketTypeConfig {
    /// Framing family.
    pub kind: SocketKind,
    /// `LINE_END`: line terminator.
    #[serde(default)]
    pub line_ending: Option<LineEndingConfig>,
    /// `START_END`: opening marker as a hex byte sequence
    /// (`"02"`, `"0x02 0x03"`, `"02,03"`).
    #[serde(default)]
    pub start_hex: Option<String>,
    /// `START_END`: closing marker as a hex byte sequence.
    #[serde(default)]
    pub end_hex: Option<String>,
    /// `REGEX`: pattern matching exactly one frame.
    #[serde(default)]
    pub regex_pattern: Option<String>,
}

/// Listen and connect endpoint definitions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct EndpointsConfig {
    /// Accept-side endpoints, keyed by endpoint id.
    #[serde(default)]
    pub listen: BTreeMap<String, ListenEndpointConfig>,
    /// Initiate-side endpoints, keyed by endpoint id.
    #[serde(default)]
    pub connect: BTreeMap<String, ConnectEndpointConfig>,
    /// Reconnect backoff shared by all connect endpoints.
    #[serde(default)]
    pub connect_backoff: ConnectBackoffConfig,
}

/// One accept-side endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ListenEndpointConfig {
    /// Bind address, `host:port`.
    pub bind: String,
    /// Concurrent connection ceiling; excess connections are closed on
    /// accept.
    #[serde(default = "default_max_conn")]
    pub max_conn: usize,
}

fn default_max_conn() -> usize {
    20
}

/// One initiate-side endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConnectEndpointConfig {
    /// Target address, `host:port`.
    pub target: String,
    /// Advisory connection count; a mismatch against the equipment
    /// referencing this endpoint is logged at startup.
    #[serde(default = "default_conn_count")]
    pub conn_count: u32,
}

fn default_conn_count() -> u32 {
    20
}

/// Exponential reconnect backoff parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConnectBackoffConfig {
    /// First retry delay in seconds.
    #[serde(default = "default_backoff_initial")]
    pub initial_sec: u64,
    /// Retry delay ceiling in seconds.
    #[serde(default = "default_backoff_max")]
    pub max_sec: u64,
    /// Per-attempt growth factor.
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

impl Default for ConnectBackoffConfig {
    fn default() -> Self {
        Self {
            initial_sec: default_backoff_initial(),
            max_sec: default_backoff_max(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_backoff_initial() -> u64 {
    1
}

fn default_backoff_max() -> u64 {
    30
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Profile behavior family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfileKind {
    /// Scripted scenario from a file.
    Scenario,
    /// Reserved in the schema; rejected at registry build.
    Rate,
}

/// One scenario profile.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProfileConfig {
    /// Behavior family.
    #[serde(rename = "type")]
    pub kind: ProfileKind,
    /// `SCENARIO`: path to the scenario script.
    #[serde(default)]
    pub scenario_file: Option<String>,
}

/// Connection direction for one equipment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EqpMode {
    /// The simulator listens; the counterpart connects in.
    Passive,
    /// The simulator connects out to the counterpart.
    Active,
}

/// One simulated equipment instance. The map key is the equipment id used
/// for `{eqpid}` substitution and the handshake reply.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct EqpConfig {
    /// Connection direction.
    pub mode: EqpMode,
    /// Endpoint id; resolved against `endpoints.listen` for passive
    /// equipment and `endpoints.connect` for active equipment.
    pub endpoint: String,
    /// Socket-type id.
    pub socket_type: String,
    /// Profile id.
    pub profile: String,
    /// Wait-step timeout in seconds; zero falls back to the default.
    #[serde(default)]
    pub wait_timeout_sec: u64,
    /// Handshake timeout in seconds; zero falls back to the default.
    #[serde(default)]
    pub handshake_timeout_sec: u64,
    /// Template variables for `{var.<key>}` substitution.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const FULL: &str = r"
defaults:
  default-wait-timeout-sec: 30
  default-handshake-timeout-sec: 10
socket-types:
  LINE_LF:
    kind: LINE_END
    line-ending: LF
  STX_ETX:
    kind: START_END
    start-hex: '02'
    end-hex: '03'
  BRACKET:
    kind: REGEX
    regex-pattern: '\[[^\]]*\]'
endpoints:
  listen:
    lp1:
      bind: 127.0.0.1:9001
      max-conn: 5
  connect:
    cp1:
      target: 127.0.0.1:9002
      conn-count: 2
  connect-backoff:
    initial-sec: 1
    max-sec: 8
    multiplier: 2.0
profiles:
  case1:
    type: SCENARIO
    scenario-file: scenarios/case1.md
eqps:
  EQP001:
    mode: PASSIVE
    endpoint: lp1
    socket-type: LINE_LF
    profile: case1
    vars:
      LOTID: LOT42
  EQP002:
    mode: ACTIVE
    endpoint: cp1
    socket-type: STX_ETX
    profile: case1
    wait-timeout-sec: 5
";

    #[test]
    fn full_tree_deserializes() {
        let cfg: SimConfig = serde_yaml::from_str(FULL).unwrap();
        assert_eq!(cfg.defaults.default_wait_timeout_sec, 30);
        assert_eq!(cfg.defaults.default_handshake_timeout_sec, 10);
        assert_eq!(cfg.socket_types.len(), 3);
        assert_eq!(cfg.socket_types["LINE_LF"].kind, SocketKind::LineEnd);
        assert_eq!(
            cfg.socket_types["LINE_LF"].line_ending,
            Some(LineEndingConfig::Lf)
        );
        assert_eq!(cfg.socket_types["STX_ETX"].start_hex.as_deref(), Some("02"));
        assert_eq!(cfg.endpoints.listen["lp1"].max_conn, 5);
        assert_eq!(cfg.endpoints.connect["cp1"].conn_count, 2);
        assert_eq!(cfg.endpoints.connect_backoff.max_sec, 8);
        assert_eq!(cfg.profiles["case1"].kind, ProfileKind::Scenario);
        assert_eq!(cfg.eqps["EQP001"].mode, EqpMode::Passive);
        assert_eq!(cfg.eqps["EQP001"].vars["LOTID"], "LOT42");
        assert_eq!(cfg.eqps["EQP002"].wait_timeout_sec, 5);
        assert_eq!(cfg.eqps["EQP002"].handshake_timeout_sec, 0);
    }

    #[test]
    fn omitted_sections_default() {
        let cfg: SimConfig = serde_yaml::from_str("eqps: {}").unwrap();
        assert_eq!(cfg.defaults.default_wait_timeout_sec, 60);
        assert_eq!(cfg.endpoints.connect_backoff.initial_sec, 1);
        assert!((cfg.endpoints.connect_backoff.multiplier - 2.0).abs() < f64::EPSILON);
        assert!(cfg.socket_types.is_empty());
    }

    #[test]
    fn listen_max_conn_defaults_to_twenty() {
        let cfg: SimConfig =
            serde_yaml::from_str("endpoints:\n  listen:\n    lp:\n      bind: 0.0.0.0:9000\n")
                .unwrap();
        assert_eq!(cfg.endpoints.listen["lp"].max_conn, 20);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = serde_yaml::from_str::<SimConfig>("bogus: 1").unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }
}
