/*!
Test harness for the gateway.

Builds a `Gateway` wired to a `MockBroker` and a `MockEndpoint`, with
short timeouts so failure paths resolve quickly, plus helpers to wait
for asynchronous effects.
*/

use crate::endpoint_stub::MockEndpoint;
use crate::mqtt_stub::MockBroker;
use anyhow::Result;
use opcua_mqtt_gateway::config::{
    FileConfig, GatewaySettings, MqttSettings, OpcUaSettings,
};
use opcua_mqtt_gateway::models::MetricConfig;
use opcua_mqtt_gateway::{Gateway, GatewayConfig, Mode, RunningGateway};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

pub struct TestHarness {
    pub broker: MockBroker,
    pub endpoint: MockEndpoint,
    pub settings: GatewaySettings,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        init_tracing();

        Self {
            broker: MockBroker::new(),
            endpoint: MockEndpoint::new(),
            settings: GatewaySettings {
                operation_timeout_ms: 200,
                connect_timeout_ms: 500,
                shutdown_grace_ms: 300,
            },
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.settings.operation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn config(&self, metrics: Vec<MetricConfig>) -> Result<GatewayConfig> {
        let raw = FileConfig {
            opcua: OpcUaSettings {
                url: "opc.tcp://mock:4840".into(),
                certificate_file: PathBuf::from("certs/mock_cert.pem"),
                private_key_file: PathBuf::from("certs/mock_key.pem"),
                pki_dir: PathBuf::from("pki"),
                application_name: "gateway-devkit".into(),
                application_uri: "urn:gateway-devkit".into(),
                session_retry_limit: 1,
            },
            mqtt: MqttSettings {
                host: "mock-broker".into(),
                port: 1883,
                username: None,
                password: None,
                client_id: "gateway-devkit".into(),
                keep_alive_secs: 30,
            },
            gateway: self.settings.clone(),
            metrics,
        };
        Ok(GatewayConfig::validate(raw)?)
    }

    pub fn gateway(&self, metrics: Vec<MetricConfig>) -> Result<Gateway> {
        Ok(Gateway::new(
            self.config(metrics)?,
            Arc::new(self.endpoint.clone()),
            Arc::new(self.broker.clone()),
        ))
    }

    /// Builds and starts a gateway; startup failures become test errors.
    pub async fn start(&self, metrics: Vec<MetricConfig>) -> Result<RunningGateway> {
        let running = self.gateway(metrics)?.start().await?;
        Ok(running)
    }

    /// Waits until `topic` has seen at least `count` publishes.
    pub async fn wait_for_publishes(&self, topic: &str, count: usize, timeout_ms: u64) -> bool {
        wait_until(timeout_ms, || self.broker.count_on(topic) >= count).await
    }

    /// Waits until `node_id` has received at least `count` writes.
    pub async fn wait_for_writes(&self, node_id: &str, count: usize, timeout_ms: u64) -> bool {
        wait_until(timeout_ms, || self.endpoint.writes_to(node_id).len() >= count).await
    }
}

/// Polls `condition` every 10 ms until it holds or `timeout_ms` elapses.
pub async fn wait_until<F>(timeout_ms: u64, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

pub fn pub_metric(node_id: &str, topic: &str, interval_ms: u64) -> MetricConfig {
    metric(node_id, topic, Mode::Pub, Some(interval_ms))
}

pub fn sub_metric(node_id: &str, topic: &str) -> MetricConfig {
    metric(node_id, topic, Mode::Sub, None)
}

pub fn pubsub_metric(node_id: &str, topic: &str, interval_ms: u64) -> MetricConfig {
    metric(node_id, topic, Mode::PubSub, Some(interval_ms))
}

pub fn metric(node_id: &str, topic: &str, mode: Mode, interval: Option<u64>) -> MetricConfig {
    MetricConfig {
        node_id: node_id.to_string(),
        topic: topic.to_string(),
        mode,
        interval,
    }
}

/// `{"value": v}` as the broker would carry it.
pub fn value_payload(value: serde_json::Value) -> Vec<u8> {
    serde_json::json!({ "value": value }).to_string().into_bytes()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}
