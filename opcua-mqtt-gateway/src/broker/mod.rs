//! Broker seam.
//!
//! A connected broker is a `BrokerChannel` for outgoing calls plus one
//! delivery stream carrying every message received on any subscribed topic.

mod mqtt;

pub use mqtt::MqttConnector;

use crate::config::MqttSettings;
use async_trait::async_trait;
use rumqttc::QoS;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("failed to connect to MQTT broker {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("failed to publish to topic {topic}: {reason}")]
    Publish { topic: String, reason: String },
    #[error("failed to subscribe to topic {topic}: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("error closing MQTT connection: {0}")]
    Close(String),
}

/// Quality of service and retain flag for one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl DeliveryOptions {
    /// QoS 0, not retained. Every gateway publish uses this.
    pub const FIRE_AND_FORGET: DeliveryOptions = DeliveryOptions {
        qos: QoS::AtMostOnce,
        retain: false,
    };
}

/// A message delivered on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Outgoing half of a broker connection. Shared by all tasks.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: DeliveryOptions,
    ) -> Result<(), BrokerError>;

    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Result of a successful broker connect.
pub struct BrokerSession {
    pub channel: Arc<dyn BrokerChannel>,
    pub inbound: mpsc::Receiver<InboundMessage>,
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, settings: &MqttSettings) -> Result<BrokerSession, BrokerError>;
}
