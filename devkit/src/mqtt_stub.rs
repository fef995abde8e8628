/*!
Mock MQTT broker for running the gateway without a broker.

Records every publish and subscription and lets tests inject inbound
messages. Only subscribed topics are delivered, like a real broker.
*/

use anyhow::Result;
use async_trait::async_trait;
use opcua_mqtt_gateway::broker::{
    BrokerChannel, BrokerConnector, BrokerError, BrokerSession, DeliveryOptions, InboundMessage,
};
use opcua_mqtt_gateway::config::MqttSettings;
use rumqttc::QoS;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl MockMessage {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Default)]
struct BrokerState {
    published: Mutex<Vec<MockMessage>>,
    subscriptions: Mutex<Vec<String>>,
    inbound: Mutex<Option<mpsc::Sender<InboundMessage>>>,
    failing_subscribes: Mutex<HashSet<String>>,
    failing_publishes: Mutex<HashSet<String>>,
    fail_connect: AtomicBool,
    loopback: AtomicBool,
    closed: AtomicBool,
    connects: AtomicUsize,
}

/// Mock broker: acts as both the connector and the connected channel.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next connects.
    pub fn fail_connect(&self) {
        self.state.fail_connect.store(true, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, topic: &str) {
        self.state
            .failing_subscribes
            .lock()
            .unwrap()
            .insert(topic.to_string());
    }

    pub fn fail_publish(&self, topic: &str) {
        self.state
            .failing_publishes
            .lock()
            .unwrap()
            .insert(topic.to_string());
    }

    /// Deliver the gateway's own publishes back to it when it subscribes to the topic.
    pub fn enable_loopback(&self) {
        self.state.loopback.store(true, Ordering::SeqCst);
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.state
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .any(|t| t == topic)
    }

    async fn deliver(&self, message: InboundMessage) -> Result<bool> {
        if !self.is_subscribed(&message.topic) {
            return Ok(false);
        }
        let sender = self.state.inbound.lock().unwrap().clone();
        match sender {
            Some(sender) => {
                sender
                    .send(message)
                    .await
                    .map_err(|e| anyhow::anyhow!("Send error: {}", e))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Simulates a message arriving from another client.
    ///
    /// Returns `false` when nobody is subscribed to `topic`.
    pub async fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> Result<bool>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let delivered = self.deliver(InboundMessage::new(topic, payload)).await?;
        tracing::debug!(delivered, "[MOCK] simulated incoming message");
        Ok(delivered)
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.state.published.lock().unwrap().clone()
    }

    pub fn get_subscriptions(&self) -> Vec<String> {
        self.state.subscriptions.lock().unwrap().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.state
            .published
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    pub fn count_on(&self, topic: &str) -> usize {
        self.find_messages_by_topic(topic).len()
    }

    /// Parses the last message published on a topic as JSON.
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let messages = self.find_messages_by_topic(topic);
        if let Some(last_msg) = messages.last() {
            let parsed: T = serde_json::from_slice(&last_msg.payload)?;
            Ok(Some(parsed))
        } else {
            Ok(None)
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.state.published.lock().unwrap().clear();
    }
}

#[async_trait]
impl BrokerConnector for MockBroker {
    async fn connect(&self, settings: &MqttSettings) -> Result<BrokerSession, BrokerError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(BrokerError::Connect {
                host: settings.host.clone(),
                port: settings.port,
                reason: "connection refused (mock)".to_string(),
            });
        }

        let (sender, receiver) = mpsc::channel(INBOUND_CAPACITY);
        *self.state.inbound.lock().unwrap() = Some(sender);
        self.state.closed.store(false, Ordering::SeqCst);

        Ok(BrokerSession {
            channel: Arc::new(self.clone()),
            inbound: receiver,
        })
    }
}

#[async_trait]
impl BrokerChannel for MockBroker {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: DeliveryOptions,
    ) -> Result<(), BrokerError> {
        if self.state.failing_publishes.lock().unwrap().contains(topic) {
            return Err(BrokerError::Publish {
                topic: topic.to_string(),
                reason: "publish rejected (mock)".to_string(),
            });
        }

        self.state.published.lock().unwrap().push(MockMessage {
            topic: topic.to_string(),
            payload: payload.clone(),
            qos: options.qos,
            retain: options.retain,
        });

        if self.state.loopback.load(Ordering::SeqCst) {
            // try_send: a full inbound queue must not stall the publisher.
            let sender = self.state.inbound.lock().unwrap().clone();
            if let (true, Some(sender)) = (self.is_subscribed(topic), sender) {
                let _ = sender.try_send(InboundMessage::new(topic, payload));
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        if self.state.failing_subscribes.lock().unwrap().contains(topic) {
            return Err(BrokerError::Subscribe {
                topic: topic.to_string(),
                reason: "not authorized (mock)".to_string(),
            });
        }
        self.state
            .subscriptions
            .lock()
            .unwrap()
            .push(topic.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.inbound.lock().unwrap().take();
        Ok(())
    }
}
