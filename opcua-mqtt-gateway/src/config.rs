//! Gateway configuration (`config.toml`).
//!
//! Handles:
//! - OPC UA endpoint and client certificate settings
//! - MQTT broker settings
//! - Per-operation and shutdown timeouts
//! - The ordered list of metrics, validated before anything connects

use crate::models::{Metric, MetricConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV_VAR: &str = "OPCUA_MQTT_GATEWAY_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("error parsing configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid metric #{index} ({node_id} -> {topic}): {reason}")]
    InvalidMetric {
        index: usize,
        node_id: String,
        topic: String,
        reason: String,
    },
}

/// Raw file layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    pub opcua: OpcUaSettings,
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpcUaSettings {
    pub url: String,
    #[serde(default = "default_certificate_file")]
    pub certificate_file: PathBuf,
    #[serde(default = "default_private_key_file")]
    pub private_key_file: PathBuf,
    #[serde(default = "default_pki_dir")]
    pub pki_dir: PathBuf,
    #[serde(default = "default_application_name")]
    pub application_name: String,
    #[serde(default = "default_application_uri")]
    pub application_uri: String,
    #[serde(default = "default_session_retry_limit")]
    pub session_retry_limit: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl GatewaySettings {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            operation_timeout_ms: default_operation_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

fn default_certificate_file() -> PathBuf {
    PathBuf::from("certs/own/certs/client_selfsigned_cert.pem")
}
fn default_private_key_file() -> PathBuf {
    PathBuf::from("certs/own/private/private_key.pem")
}
fn default_pki_dir() -> PathBuf {
    PathBuf::from("pki")
}
fn default_application_name() -> String {
    "opcua-mqtt-gateway".into()
}
fn default_application_uri() -> String {
    "urn:opcua-mqtt-gateway".into()
}
fn default_session_retry_limit() -> i32 {
    3
}
fn default_client_id() -> String {
    "opcua-mqtt-gateway".into()
}
fn default_keep_alive_secs() -> u64 {
    30
}
fn default_operation_timeout_ms() -> u64 {
    5_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}

/// Validated configuration. Metrics are shared read-only with the scheduler and router.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub opcua: OpcUaSettings,
    pub mqtt: MqttSettings,
    pub gateway: GatewaySettings,
    pub metrics: Vec<Arc<Metric>>,
}

impl GatewayConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: FileConfig = toml::from_str(text)?;
        Self::validate(raw)
    }

    pub fn validate(raw: FileConfig) -> Result<Self, ConfigError> {
        let mut metrics = Vec::with_capacity(raw.metrics.len());

        for (index, entry) in raw.metrics.into_iter().enumerate() {
            let node_id = entry.node_id.clone();
            let topic = entry.topic.clone();
            let metric = Metric::try_from(entry).map_err(|reason| ConfigError::InvalidMetric {
                index,
                node_id,
                topic,
                reason,
            })?;

            if metric.mode().publishes() && metric.mode().subscribes() {
                warn!(
                    node_id = metric.node_id(),
                    topic = metric.topic(),
                    "pubsub metric subscribes to its own publish topic; published values will be written back"
                );
            }
            metrics.push(Arc::new(metric));
        }

        if metrics.is_empty() {
            warn!("no metrics configured, the gateway will only hold its connections open");
        }

        Ok(Self {
            opcua: raw.opcua,
            mqtt: raw.mqtt,
            gateway: raw.gateway,
            metrics,
        })
    }
}

/// Config file location: `$OPCUA_MQTT_GATEWAY_CONFIG` or `config.toml`.
pub fn config_path_from_env() -> PathBuf {
    std::env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub async fn load_config(path: impl AsRef<Path>) -> Result<GatewayConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    GatewayConfig::from_toml_str(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Mode;
    use std::io::Write;

    const SAMPLE: &str = r#"
[opcua]
url = "opc.tcp://localhost:4840"

[mqtt]
host = "localhost"
port = 1883
username = "gateway"
password = "secret"

[[metrics]]
nodeId = "ns=1;s=Temp"
topic = "plant/temp"
mode = "pub"
interval = 1000

[[metrics]]
nodeId = "ns=1;s=Setpoint"
topic = "plant/setpoint/cmd"
mode = "sub"
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = GatewayConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.opcua.url, "opc.tcp://localhost:4840");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.username.as_deref(), Some("gateway"));
        assert_eq!(config.metrics.len(), 2);
        assert_eq!(config.metrics[0].mode(), Mode::Pub);
        assert_eq!(config.metrics[0].interval(), Some(Duration::from_millis(1000)));
        assert_eq!(config.metrics[1].node_id(), "ns=1;s=Setpoint");
        assert_eq!(config.metrics[1].interval(), None);
    }

    #[test]
    fn test_defaults_applied() {
        let config = GatewayConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.gateway.operation_timeout(), Duration::from_secs(5));
        assert_eq!(config.mqtt.client_id, "opcua-mqtt-gateway");
        assert_eq!(
            config.opcua.certificate_file,
            PathBuf::from("certs/own/certs/client_selfsigned_cert.pem")
        );
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let text = SAMPLE.replace(r#"mode = "sub""#, r#"mode = "both""#);
        let err = GatewayConfig::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_interval_rejected_with_index() {
        let text = SAMPLE.replace("interval = 1000", "");
        match GatewayConfig::from_toml_str(&text).unwrap_err() {
            ConfigError::InvalidMetric { index, node_id, .. } => {
                assert_eq!(index, 0);
                assert_eq!(node_id, "ns=1;s=Temp");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_example_config_parses() {
        let config = GatewayConfig::from_toml_str(include_str!("../config.example.toml")).unwrap();
        assert_eq!(config.metrics.len(), 3);
        assert_eq!(config.metrics[2].mode(), Mode::PubSub);
        assert_eq!(config.gateway.shutdown_grace(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = load_config("/definitely/not/here/config.toml").await.unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = load_config(file.path()).await.unwrap();
        assert_eq!(config.metrics.len(), 2);
    }
}
