//! `rumqttc` implementation of the broker seam.

use super::{
    BrokerChannel, BrokerConnector, BrokerError, BrokerSession, DeliveryOptions, InboundMessage,
};
use crate::config::MqttSettings;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions,
    Outgoing, QoS, SubscribeReasonCode,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const REQUEST_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 256;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const PUMP_STOP_WAIT: Duration = Duration::from_secs(2);

type Subscriptions = Arc<Mutex<SubscriptionBook>>;

struct PendingSubscribe {
    topic: String,
    /// Caller of `subscribe()` waiting for the SUBACK; `None` for restores.
    ack: Option<oneshot::Sender<bool>>,
}

/// Pairs SUBSCRIBE packets with their SUBACKs and tracks accepted topics.
///
/// rumqttc only reveals a SUBSCRIBE's packet id once the event loop sends it,
/// in request order, so topics are queued in the order they are requested.
#[derive(Default)]
struct SubscriptionBook {
    active: Vec<String>,
    queued: VecDeque<PendingSubscribe>,
    in_flight: HashMap<u16, PendingSubscribe>,
}

impl SubscriptionBook {
    fn queue(&mut self, topic: String, ack: Option<oneshot::Sender<bool>>) {
        self.queued.push_back(PendingSubscribe { topic, ack });
    }

    fn sent(&mut self, pkid: u16) {
        // Same packet id still awaiting its SUBACK: a retransmission.
        if self.in_flight.contains_key(&pkid) {
            return;
        }
        if let Some(pending) = self.queued.pop_front() {
            self.in_flight.insert(pkid, pending);
        }
    }

    /// Settles the SUBSCRIBE with `pkid`; returns its topic.
    ///
    /// A topic is only kept for restoring when the broker accepted it and the
    /// caller, if any, was still waiting.
    fn acked(&mut self, pkid: u16, accepted: bool) -> Option<String> {
        let PendingSubscribe { topic, ack } = self.in_flight.remove(&pkid)?;
        let delivered = match ack {
            Some(ack) => ack.send(accepted).is_ok(),
            None => true,
        };

        if accepted && delivered {
            if !self.active.contains(&topic) {
                self.active.push(topic.clone());
            }
        } else {
            self.active.retain(|t| t != &topic);
        }
        Some(topic)
    }

    /// Everything to request again after a reconnect: the accepted topics,
    /// then SUBSCRIBEs whose SUBACK was lost with the old connection.
    fn restore(&mut self) -> Vec<PendingSubscribe> {
        let mut restore: Vec<PendingSubscribe> = self
            .active
            .iter()
            .map(|topic| PendingSubscribe {
                topic: topic.clone(),
                ack: None,
            })
            .collect();
        restore.extend(self.in_flight.drain().map(|(_, pending)| pending));
        restore
    }

    fn drop_topic(&mut self, topic: &str) {
        self.active.retain(|t| t != topic);
    }

    /// Fails every waiter; used once the event loop has stopped.
    fn abandon(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
    }
}

/// Issues a SUBSCRIBE and queues its topic under the same lock, so the
/// queue order always matches the request order.
fn request_subscribe(
    client: &AsyncClient,
    book: &mut SubscriptionBook,
    topic: String,
    ack: Option<oneshot::Sender<bool>>,
) -> Result<(), ClientError> {
    client.try_subscribe(topic.clone(), QoS::AtMostOnce)?;
    book.queue(topic, ack);
    Ok(())
}

pub struct MqttConnector {
    connect_timeout: Duration,
}

impl MqttConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(&self, settings: &MqttSettings) -> Result<BrokerSession, BrokerError> {
        let connect_err = |reason: String| BrokerError::Connect {
            host: settings.host.clone(),
            port: settings.port,
            reason,
        };

        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
        options.set_clean_session(true);
        if let Some(username) = &settings.username {
            options.set_credentials(username.clone(), settings.password.clone().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        info!(host = %settings.host, port = settings.port, "connecting to MQTT broker");
        match tokio::time::timeout(self.connect_timeout, wait_for_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(connect_err(reason)),
            Err(_) => {
                return Err(connect_err(format!(
                    "no CONNACK within {} ms",
                    self.connect_timeout.as_millis()
                )))
            }
        }
        info!("MQTT client connected");

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let subscriptions: Subscriptions = Arc::new(Mutex::new(SubscriptionBook::default()));
        let pump = tokio::spawn(pump_events(
            eventloop,
            client.clone(),
            subscriptions.clone(),
            inbound_tx,
        ));

        Ok(BrokerSession {
            channel: Arc::new(MqttChannel {
                client,
                subscriptions,
                pump: Mutex::new(Some(pump)),
            }),
            inbound: inbound_rx,
        })
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), String> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(format!("connection refused: {:?}", ack.code))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
}

/// Drives the rumqttc event loop for the lifetime of the channel.
///
/// Forwards inbound publishes, restores subscriptions after a reconnect and
/// stops once the client's DISCONNECT has gone out.
async fn pump_events(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Subscriptions,
    inbound: mpsc::Sender<InboundMessage>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let message = InboundMessage::new(publish.topic, publish.payload.to_vec());
                if inbound.send(message).await.is_err() {
                    debug!("inbound dispatch closed, dropping message");
                }
            }
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                // The first CONNACK is consumed by connect(); this one follows a reconnect.
                let mut book = subscriptions.lock();
                let restore = book.restore();
                info!(count = restore.len(), "MQTT reconnected, restoring subscriptions");
                for PendingSubscribe { topic, ack } in restore {
                    if let Err(e) = request_subscribe(&client, &mut book, topic.clone(), ack) {
                        error!(topic = %topic, error = %e, "failed to restore subscription");
                        book.drop_topic(&topic);
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => subscriptions.lock().sent(pkid),
            Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                let accepted = ack
                    .return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
                let topic = subscriptions.lock().acked(ack.pkid, accepted);
                match topic {
                    Some(topic) if accepted => debug!(topic = %topic, "subscription acknowledged"),
                    Some(topic) => error!(topic = %topic, "broker rejected subscription"),
                    None => debug!(pkid = ack.pkid, "SUBACK for an unknown packet"),
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent, stopping event loop");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "MQTT connection error, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
    subscriptions.lock().abandon();
}

struct MqttChannel {
    client: AsyncClient,
    subscriptions: Subscriptions,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl BrokerChannel for MqttChannel {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: DeliveryOptions,
    ) -> Result<(), BrokerError> {
        self.client
            .publish(topic, options.qos, options.retain, payload)
            .await
            .map_err(|e| BrokerError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    /// Resolves once the broker has acknowledged the subscription.
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        let subscribe_err = |reason: String| BrokerError::Subscribe {
            topic: topic.to_string(),
            reason,
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut book = self.subscriptions.lock();
            request_subscribe(&self.client, &mut book, topic.to_string(), Some(ack_tx))
                .map_err(|e| subscribe_err(e.to_string()))?;
        }

        match ack_rx.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(subscribe_err("rejected by broker".to_string())),
            Err(_) => Err(subscribe_err("connection closed before SUBACK".to_string())),
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| BrokerError::Close(e.to_string()));

        let pump = self.pump.lock().take();
        if let Some(handle) = pump {
            let abort = handle.abort_handle();
            if tokio::time::timeout(PUMP_STOP_WAIT, handle).await.is_err() {
                warn!("MQTT event loop did not stop in time, aborting it");
                abort.abort();
            }
        }

        result
    }
}
