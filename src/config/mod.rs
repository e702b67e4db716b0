// Copyright (c) 2026 Meshsim
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Participant configuration: loading, validation, and the recognised keys
//! of spec.md §6.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors. Fatal at startup; surfaced to the caller.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading configuration file: {0}")]
    Io(#[from] std::io::Error),
    /// The file extension wasn't one of yaml/yml/json/toml.
    #[error("unrecognised configuration file extension: {0}")]
    UnknownExtension(String),
    /// YAML parse error.
    #[error("parsing YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// JSON parse error.
    #[error("parsing JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
    /// TOML parse error.
    #[error("parsing TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),
    /// A required field was missing or out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root participant configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Participant identity/runtime settings.
    pub participant: ParticipantSettings,
    /// `middleware.*` keys.
    pub middleware: MiddlewareConfig,
    /// `healthCheck.*` keys.
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// `logger.*` keys.
    #[serde(default)]
    pub logger: LoggerConfig,
    /// HTTP observability surface.
    #[serde(default)]
    pub http: HttpConfig,
}

impl NodeConfig {
    /// Validate required fields, returning the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.participant.name.trim().is_empty() {
            return Err(ConfigError::Invalid("participant.name must not be empty".into()));
        }
        if self.middleware.registry_uri.trim().is_empty() {
            return Err(ConfigError::Invalid("middleware.registryUri must not be empty".into()));
        }
        if self.health_check.soft_response_timeout_ms == 0 {
            return Err(ConfigError::Invalid("healthCheck.softResponseTimeout must be > 0".into()));
        }
        if self.health_check.hard_response_timeout_ms == 0 {
            return Err(ConfigError::Invalid("healthCheck.hardResponseTimeout must be > 0".into()));
        }
        Ok(())
    }

    /// Load and validate from a `.yaml`/`.yml`/`.json`/`.toml` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        let cfg: NodeConfig = match ext.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&raw)?,
            "json" => serde_json::from_str(&raw)?,
            "toml" => toml::from_str(&raw)?,
            other => return Err(ConfigError::UnknownExtension(other.to_string())),
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

/// `participant.*` keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSettings {
    /// Stable participant name.
    pub name: String,
    /// Whether this participant takes part in virtual-time synchronisation.
    #[serde(default)]
    pub is_synchronized: bool,
    /// Whether `StartLifecycle` waits for cluster coordination
    /// (`coordinatedStart`/`coordinatedStop`, spec.md §4.7).
    #[serde(default = "default_true")]
    pub coordinated_start: bool,
    /// See `coordinated_start`.
    #[serde(default = "default_true")]
    pub coordinated_stop: bool,
    /// Initial step duration for synchronised participants, nanoseconds.
    #[serde(default = "default_step_ns")]
    pub step_duration_ns: i64,
    /// Data subscriptions this participant wants matched against publishers
    /// discovered over the mesh (spec.md §4.6 pub/sub matcher).
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// One `participant.subscriptions[]` entry: a pub/sub match predicate.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionConfig {
    /// Topic string, matched by exact equality.
    pub topic: String,
    /// Media type; empty matches any publisher's media type.
    #[serde(default)]
    pub media_type: String,
    /// Required label subset.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_step_ns() -> i64 {
    1_000_000 // 1 ms
}

/// `middleware.*` keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MiddlewareConfig {
    /// Registry URI, e.g. `silkit://localhost:8500` or `local:///run/mesh.sock`.
    pub registry_uri: String,
}

/// `healthCheck.*` keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthCheckConfig {
    /// Step duration budget (milliseconds) that triggers a warn-level
    /// watchdog event.
    pub soft_response_timeout_ms: u64,
    /// Step duration budget (milliseconds) that triggers an error-level
    /// watchdog event.
    pub hard_response_timeout_ms: u64,
}

impl HealthCheckConfig {
    /// Soft timeout as a `Duration`.
    pub fn soft_response_timeout(&self) -> Duration {
        Duration::from_millis(self.soft_response_timeout_ms)
    }

    /// Hard timeout as a `Duration`.
    pub fn hard_response_timeout(&self) -> Duration {
        Duration::from_millis(self.hard_response_timeout_ms)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self { soft_response_timeout_ms: 5_000, hard_response_timeout_ms: 20_000 }
    }
}

/// A single `logger.sinks[]` entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogSinkConfig {
    /// Sink kind.
    #[serde(rename = "type")]
    pub kind: LogSinkKind,
}

/// `logger.sinks[].type`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSinkKind {
    /// Write to stdout.
    Stdout,
    /// Write to a file (path configured out-of-band, as in the teacher's
    /// `tracing-subscriber` file-appender setup).
    File,
    /// Forward to a remote collector; opaque to the core (spec.md §6).
    Remote,
}

/// `logger.*` keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Minimum level to emit.
    pub level: String,
    /// Configured sinks.
    pub sinks: Vec<LogSinkConfig>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), sinks: vec![LogSinkConfig { kind: LogSinkKind::Stdout }] }
    }
}

/// A parsed `middleware.registryUri` (spec.md §6): either a TCP endpoint
/// (`silkit://host:port`) or a local-IPC path (`local:///run/mesh.sock`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEndpoint {
    /// Connect/bind over TCP.
    Tcp(String),
    /// Connect/bind over a Unix domain socket at this filesystem path.
    Local(String),
}

impl RegistryEndpoint {
    /// Parse a `silkit://` or `local://` registry URI.
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        if let Some(rest) = uri.strip_prefix("silkit://") {
            if rest.is_empty() {
                return Err(ConfigError::Invalid(format!("empty silkit:// host:port in {uri:?}")));
            }
            let host_port = if rest.contains(':') { rest.to_string() } else { format!("{rest}:8500") };
            Ok(RegistryEndpoint::Tcp(host_port))
        } else if let Some(rest) = uri.strip_prefix("local://") {
            if rest.is_empty() {
                return Err(ConfigError::Invalid(format!("empty local:// path in {uri:?}")));
            }
            Ok(RegistryEndpoint::Local(rest.to_string()))
        } else {
            Err(ConfigError::Invalid(format!("registry URI must start with silkit:// or local://, got {uri:?}")))
        }
    }
}

/// HTTP observability surface (`/metrics`, `/healthz`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Listen address, e.g. `0.0.0.0:9090`. Empty disables the surface.
    pub listen_addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { listen_addr: String::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_endpoint_parses_silkit_host_port() {
        assert_eq!(
            RegistryEndpoint::parse("silkit://localhost:8500").unwrap(),
            RegistryEndpoint::Tcp("localhost:8500".into())
        );
    }

    #[test]
    fn registry_endpoint_defaults_missing_port_to_8500() {
        assert_eq!(RegistryEndpoint::parse("silkit://localhost").unwrap(), RegistryEndpoint::Tcp("localhost:8500".into()));
    }

    #[test]
    fn registry_endpoint_parses_local_path() {
        assert_eq!(RegistryEndpoint::parse("local:///run/mesh.sock").unwrap(), RegistryEndpoint::Local("/run/mesh.sock".into()));
    }

    #[test]
    fn registry_endpoint_rejects_unknown_scheme() {
        assert!(RegistryEndpoint::parse("http://localhost:8500").is_err());
    }

    #[test]
    fn rejects_empty_participant_name() {
        let cfg = NodeConfig {
            participant: ParticipantSettings {
                name: "".into(),
                is_synchronized: false,
                coordinated_start: true,
                coordinated_stop: true,
                step_duration_ns: 1_000_000,
                subscriptions: vec![],
            },
            middleware: MiddlewareConfig { registry_uri: "silkit://localhost:8500".into() },
            health_check: HealthCheckConfig::default(),
            logger: LoggerConfig::default(),
            http: HttpConfig::default(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loads_yaml_from_tempfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("participant.yaml");
        std::fs::write(
            &path,
            r#"
participant:
  name: Unit
  isSynchronized: true
middleware:
  registryUri: "silkit://localhost:8500"
"#,
        )
        .unwrap();
        let cfg = NodeConfig::load(&path).unwrap();
        assert_eq!(cfg.participant.name, "Unit");
        assert!(cfg.participant.is_synchronized);
    }
}
