//! Lifecycle coordinator.
//!
//! Startup: broker channel, endpoint connection, session, then per-metric
//! registration. Shutdown: stop polling and dispatch, close the session,
//! disconnect the endpoint, close the broker channel.

use crate::broker::{BrokerChannel, BrokerConnector, BrokerSession, MqttConnector};
use crate::config::{GatewayConfig, OpcUaSettings};
use crate::context::BridgeContext;
use crate::endpoint::{EndpointConnection, EndpointConnector, EndpointSession, OpcUaConnector};
use crate::error::FatalError;
use crate::health::{GatewayStats, StatsSnapshot};
use crate::models::Mode;
use crate::router::Router;
use crate::scheduler::Scheduler;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Unconnected,
    EndpointConnected,
    SessionOpen,
    Running,
    ShuttingDown,
    Terminated,
    /// Fatal startup failure. Terminal, distinct from `Terminated`.
    Failed,
}

impl LifecycleState {
    /// Allowed transitions; no state is ever skipped.
    pub fn can_advance_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Unconnected, EndpointConnected)
                | (EndpointConnected, SessionOpen)
                | (SessionOpen, Running)
                | (Running, ShuttingDown)
                | (ShuttingDown, Terminated)
                | (Unconnected | EndpointConnected, Failed)
        )
    }
}

/// Read-only view of a gateway's lifecycle state.
#[derive(Clone)]
pub struct StateHandle(Arc<Mutex<LifecycleState>>);

impl StateHandle {
    pub fn get(&self) -> LifecycleState {
        *self.0.lock()
    }

    fn advance(&self, next: LifecycleState) {
        let mut state = self.0.lock();
        let current = *state;
        if !current.can_advance_to(next) {
            warn!(from = ?current, to = ?next, "unexpected lifecycle transition");
        }
        *state = next;
    }
}

/// Which directions ended up active for one metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricRegistration {
    pub index: usize,
    pub node_id: String,
    pub topic: String,
    pub mode: Mode,
    pub polling: bool,
    pub subscribed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrationReport {
    pub metrics: Vec<MetricRegistration>,
}

impl RegistrationReport {
    pub fn polling(&self) -> usize {
        self.metrics.iter().filter(|m| m.polling).count()
    }

    pub fn subscribed(&self) -> usize {
        self.metrics.iter().filter(|m| m.subscribed).count()
    }

    /// Metrics whose configured sub direction could not be activated.
    pub fn failed_subscriptions(&self) -> impl Iterator<Item = &MetricRegistration> {
        self.metrics
            .iter()
            .filter(|m| m.mode.subscribes() && !m.subscribed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownIssue {
    pub step: &'static str,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub issues: Vec<ShutdownIssue>,
    pub stats: StatsSnapshot,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Client certificate and key must exist before the OPC UA client is built.
pub fn check_credentials(settings: &OpcUaSettings) -> Result<(), FatalError> {
    if !settings.certificate_file.exists() {
        return Err(FatalError::MissingCredential {
            what: "client certificate",
            path: settings.certificate_file.clone(),
        });
    }
    if !settings.private_key_file.exists() {
        return Err(FatalError::MissingCredential {
            what: "client private key",
            path: settings.private_key_file.clone(),
        });
    }
    Ok(())
}

pub struct Gateway {
    config: GatewayConfig,
    endpoint: Arc<dyn EndpointConnector>,
    broker: Arc<dyn BrokerConnector>,
    state: StateHandle,
    stats: GatewayStats,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        endpoint: Arc<dyn EndpointConnector>,
        broker: Arc<dyn BrokerConnector>,
    ) -> Self {
        Self {
            config,
            endpoint,
            broker,
            state: StateHandle(Arc::new(Mutex::new(LifecycleState::Unconnected))),
            stats: GatewayStats::new(),
        }
    }

    /// Production wiring: OPC UA client and rumqttc.
    pub fn from_config(config: GatewayConfig) -> Result<Self, FatalError> {
        check_credentials(&config.opcua)?;
        let endpoint = Arc::new(OpcUaConnector::new(config.opcua.clone()));
        let broker = Arc::new(MqttConnector::new(config.gateway.connect_timeout()));
        Ok(Self::new(config, endpoint, broker))
    }

    pub fn state(&self) -> StateHandle {
        self.state.clone()
    }

    pub fn stats(&self) -> GatewayStats {
        self.stats.clone()
    }

    fn fail(&self, err: FatalError) -> FatalError {
        error!(error = %err, "fatal startup error");
        self.state.advance(LifecycleState::Failed);
        err
    }

    pub async fn start(self) -> Result<RunningGateway, FatalError> {
        let settings = &self.config.gateway;
        let close_timeout = settings.operation_timeout();

        let BrokerSession { channel, inbound } = match self.broker.connect(&self.config.mqtt).await {
            Ok(session) => session,
            Err(e) => return Err(self.fail(FatalError::BrokerConnect(e))),
        };

        info!(url = %self.config.opcua.url, "connecting to the OPC UA server");
        let connection = match self.endpoint.connect(&self.config.opcua.url).await {
            Ok(connection) => connection,
            Err(e) => {
                close_broker(channel.as_ref(), close_timeout).await;
                return Err(self.fail(FatalError::EndpointConnect(e)));
            }
        };
        self.state.advance(LifecycleState::EndpointConnected);
        info!("connected to OPC UA server");

        let session = match connection.open_session().await {
            Ok(session) => session,
            Err(e) => {
                match tokio::time::timeout(close_timeout, connection.disconnect()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(close_err)) => warn!(error = %close_err, "error disconnecting endpoint"),
                    Err(_) => warn!("endpoint disconnect timed out"),
                }
                close_broker(channel.as_ref(), close_timeout).await;
                return Err(self.fail(FatalError::SessionOpen(e)));
            }
        };
        self.state.advance(LifecycleState::SessionOpen);
        info!("session created");

        let token = CancellationToken::new();
        let ctx = Arc::new(BridgeContext {
            session: session.clone(),
            channel: channel.clone(),
            stats: self.stats.clone(),
            operation_timeout: settings.operation_timeout(),
            shutdown_grace: settings.shutdown_grace(),
        });

        let mut scheduler = Scheduler::new(ctx.clone(), token.child_token());
        let mut router = Router::new(ctx);
        let mut registration = RegistrationReport::default();

        for (index, metric) in self.config.metrics.iter().enumerate() {
            let polling = metric.mode().publishes() && scheduler.register(index, metric.clone());

            let subscribed = if metric.mode().subscribes() {
                match router.register(metric.clone()).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(
                            topic = metric.topic(),
                            node_id = metric.node_id(),
                            error = %e,
                            "failed to subscribe to topic"
                        );
                        false
                    }
                }
            } else {
                false
            };

            registration.metrics.push(MetricRegistration {
                index,
                node_id: metric.node_id().to_string(),
                topic: metric.topic().to_string(),
                mode: metric.mode(),
                polling,
                subscribed,
            });
        }

        let router_task = router.spawn(inbound, token.child_token());
        self.state.advance(LifecycleState::Running);
        info!(
            metrics = registration.metrics.len(),
            polling = registration.polling(),
            subscribed = registration.subscribed(),
            "gateway running"
        );

        Ok(RunningGateway {
            state: self.state,
            stats: self.stats,
            registration,
            token,
            scheduler,
            router_task,
            session,
            connection,
            channel,
            close_timeout,
        })
    }
}

async fn close_broker(channel: &dyn BrokerChannel, timeout: Duration) {
    match tokio::time::timeout(timeout, channel.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "error closing MQTT connection"),
        Err(_) => warn!("closing MQTT connection timed out"),
    }
}

pub struct RunningGateway {
    state: StateHandle,
    stats: GatewayStats,
    registration: RegistrationReport,
    token: CancellationToken,
    scheduler: Scheduler,
    router_task: JoinHandle<()>,
    session: Arc<dyn EndpointSession>,
    connection: Box<dyn EndpointConnection>,
    channel: Arc<dyn BrokerChannel>,
    close_timeout: Duration,
}

impl RunningGateway {
    pub fn state(&self) -> StateHandle {
        self.state.clone()
    }

    pub fn stats(&self) -> GatewayStats {
        self.stats.clone()
    }

    pub fn registration(&self) -> &RegistrationReport {
        &self.registration
    }

    /// Stops polling for the metric at `index`; everything else keeps running.
    pub fn cancel_polling(&mut self, index: usize) -> bool {
        self.scheduler.cancel(index)
    }

    /// Waits for `signal`, then shuts down.
    pub async fn run_until<F>(self, signal: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        signal.await;
        self.shutdown().await
    }

    /// Every close step is attempted even if an earlier one fails.
    pub async fn shutdown(self) -> ShutdownReport {
        self.state.advance(LifecycleState::ShuttingDown);
        info!("closing session and disconnecting");

        self.token.cancel();
        self.scheduler.shutdown().await;
        if let Err(e) = self.router_task.await {
            if e.is_panic() {
                error!("inbound dispatch task panicked");
            }
        }

        let mut issues = Vec::new();
        let timeout = self.close_timeout;

        record_close(&mut issues, "close session", timeout, self.session.close()).await;
        record_close(
            &mut issues,
            "disconnect endpoint",
            timeout,
            self.connection.disconnect(),
        )
        .await;
        record_close(&mut issues, "close broker channel", timeout, self.channel.close()).await;

        self.state.advance(LifecycleState::Terminated);
        let stats = self.stats.snapshot();
        if issues.is_empty() {
            info!("session closed and client disconnected");
        } else {
            warn!(issues = issues.len(), "shutdown completed with errors");
        }
        info!(
            reads = stats.reads,
            publishes = stats.publishes,
            writes = stats.writes,
            read_errors = stats.read_errors,
            publish_errors = stats.publish_errors,
            write_errors = stats.write_errors,
            decode_errors = stats.decode_errors,
            "final gateway stats"
        );

        ShutdownReport { issues, stats }
    }
}

async fn record_close<E, F>(
    issues: &mut Vec<ShutdownIssue>,
    step: &'static str,
    timeout: Duration,
    fut: F,
) where
    F: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let error = match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("timed out after {} ms", timeout.as_millis()),
    };
    error!(step, error = %error, "error during disconnect");
    issues.push(ShutdownIssue { step, error });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_lifecycle_transitions() {
        use LifecycleState::*;
        assert!(Unconnected.can_advance_to(EndpointConnected));
        assert!(Running.can_advance_to(ShuttingDown));
        assert!(EndpointConnected.can_advance_to(Failed));
        assert!(!Unconnected.can_advance_to(Running));
        assert!(!SessionOpen.can_advance_to(Terminated));
        assert!(!Running.can_advance_to(Failed));
        assert!(!Terminated.can_advance_to(Unconnected));
    }

    #[test]
    fn test_missing_certificate_is_fatal() {
        let settings = OpcUaSettings {
            url: "opc.tcp://localhost:4840".into(),
            certificate_file: PathBuf::from("/nonexistent/cert.pem"),
            private_key_file: PathBuf::from("/nonexistent/key.pem"),
            pki_dir: PathBuf::from("pki"),
            application_name: "test".into(),
            application_uri: "urn:test".into(),
            session_retry_limit: 1,
        };

        match check_credentials(&settings).unwrap_err() {
            FatalError::MissingCredential { what, .. } => assert_eq!(what, "client certificate"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_private_key_is_fatal() {
        let cert = tempfile::NamedTempFile::new().unwrap();
        let settings = OpcUaSettings {
            url: "opc.tcp://localhost:4840".into(),
            certificate_file: cert.path().to_path_buf(),
            private_key_file: PathBuf::from("/nonexistent/key.pem"),
            pki_dir: PathBuf::from("pki"),
            application_name: "test".into(),
            application_uri: "urn:test".into(),
            session_retry_limit: 1,
        };

        let err = check_credentials(&settings).unwrap_err();
        assert!(err.to_string().contains("client private key"));
        assert_eq!(err.exit_code(), 1);
    }
}
