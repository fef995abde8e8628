//! OPC UA implementation of the endpoint seam, on top of the `opcua` crate.
//!
//! The `opcua` client API is blocking (it drives its own runtime internally),
//! so every call is moved onto tokio's blocking pool. A slow read therefore
//! only occupies one blocking thread, never the async workers that run the
//! scheduler and the inbound dispatch loop.

use super::{EndpointConnection, EndpointConnector, EndpointError, EndpointSession};
use crate::config::OpcUaSettings;
use crate::models::Value;
use async_trait::async_trait;
use opcua::client::prelude::*;
use opcua::sync::RwLock;
use parking_lot::Mutex;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task;
use tracing::{debug, info, trace};

type UaSession = Arc<RwLock<Session>>;

/// One owned reference to the shared `opcua` session.
///
/// `Session` owns a tokio runtime that panics if dropped on an async worker,
/// so references are only ever released on the blocking pool or on a plain
/// thread.
struct SessionSlot(Mutex<Option<UaSession>>);

impl SessionSlot {
    fn new(session: UaSession) -> Self {
        Self(Mutex::new(Some(session)))
    }

    fn get(&self) -> Option<UaSession> {
        self.0.lock().clone()
    }

    fn take(&self) -> Option<UaSession> {
        self.0.lock().take()
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        if let Some(session) = self.0.get_mut().take() {
            std::thread::spawn(move || drop(session));
        }
    }
}

/// Connects with security policy `None`, message mode `None` and an
/// anonymous identity, presenting the configured client certificate.
pub struct OpcUaConnector {
    settings: OpcUaSettings,
}

impl OpcUaConnector {
    pub fn new(settings: OpcUaSettings) -> Self {
        Self { settings }
    }
}

fn build_client(settings: &OpcUaSettings) -> Option<Client> {
    ClientBuilder::new()
        .application_name(settings.application_name.clone())
        .application_uri(settings.application_uri.clone())
        .certificate_path(settings.certificate_file.clone())
        .private_key_path(settings.private_key_file.clone())
        .pki_dir(settings.pki_dir.clone())
        .trust_server_certs(true)
        .session_retry_limit(settings.session_retry_limit)
        .client()
}

fn connect_blocking(settings: &OpcUaSettings, url: &str) -> Result<UaSession, EndpointError> {
    let connect_err = |reason: String| EndpointError::Connect {
        url: url.to_string(),
        reason,
    };

    let mut client = build_client(settings)
        .ok_or_else(|| connect_err("invalid OPC UA client configuration".to_string()))?;

    let endpoint: EndpointDescription = (
        url,
        SecurityPolicy::None.to_str(),
        MessageSecurityMode::None,
        UserTokenPolicy::anonymous(),
    )
        .into();

    let session = client
        .new_session_from_info((endpoint, IdentityToken::Anonymous))
        .map_err(connect_err)?;

    // Opens the secure channel only; the session itself is created later.
    session
        .write()
        .connect()
        .map_err(|status| connect_err(format!("{status:?}")))?;

    Ok(session)
}

async fn blocking<T, F>(f: F) -> Result<T, String>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|e| format!("client task failed: {e}"))
}

fn parse_node_id(node_id: &str) -> Result<NodeId, EndpointError> {
    NodeId::from_str(node_id).map_err(|status| EndpointError::InvalidNodeId {
        node_id: node_id.to_string(),
        reason: format!("{status:?}"),
    })
}

/// Numeric variants only; anything else cannot be carried as `{"value": n}`.
fn variant_to_value(node_id: &str, variant: &Variant) -> Result<Value, EndpointError> {
    let value = match variant {
        Variant::SByte(v) => Some(Value::from(i64::from(*v))),
        Variant::Byte(v) => Some(Value::from(u64::from(*v))),
        Variant::Int16(v) => Some(Value::from(i64::from(*v))),
        Variant::UInt16(v) => Some(Value::from(u64::from(*v))),
        Variant::Int32(v) => Some(Value::from(i64::from(*v))),
        Variant::UInt32(v) => Some(Value::from(u64::from(*v))),
        Variant::Int64(v) => Some(Value::from(*v)),
        Variant::UInt64(v) => Some(Value::from(*v)),
        Variant::Float(v) => Value::from_f64(f64::from(*v)),
        Variant::Double(v) => Value::from_f64(*v),
        _ => None,
    };

    value.ok_or_else(|| EndpointError::NonNumeric {
        node_id: node_id.to_string(),
        found: format!("{variant:?}"),
    })
}

#[async_trait]
impl EndpointConnector for OpcUaConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn EndpointConnection>, EndpointError> {
        info!(url, "connecting to OPC UA server");

        let settings = self.settings.clone();
        let target = url.to_string();
        let session = blocking(move || connect_blocking(&settings, &target))
            .await
            .map_err(|reason| EndpointError::Connect {
                url: url.to_string(),
                reason,
            })??;

        Ok(Box::new(UaConnection {
            url: url.to_string(),
            session: SessionSlot::new(session),
        }))
    }
}

struct UaConnection {
    url: String,
    session: SessionSlot,
}

#[async_trait]
impl EndpointConnection for UaConnection {
    async fn open_session(&self) -> Result<Arc<dyn EndpointSession>, EndpointError> {
        let session = self
            .session
            .get()
            .ok_or_else(|| EndpointError::SessionOpen("connection already closed".to_string()))?;
        let handle = SessionSlot::new(session.clone());
        blocking(move || {
            let session = session.read();
            session
                .create_session()
                .map_err(|status| EndpointError::SessionOpen(format!("create: {status:?}")))?;
            session
                .activate_session()
                .map_err(|status| EndpointError::SessionOpen(format!("activate: {status:?}")))
        })
        .await
        .map_err(EndpointError::SessionOpen)??;

        debug!(url = %self.url, "session activated");
        Ok(Arc::new(UaSessionHandle { session: handle }))
    }

    async fn disconnect(&self) -> Result<(), EndpointError> {
        let Some(session) = self.session.take() else {
            debug!(url = %self.url, "endpoint already disconnected");
            return Ok(());
        };
        let was_connected = blocking(move || {
            let guard = session.read();
            let connected = guard.is_connected();
            if connected {
                guard.disconnect();
            }
            connected
        })
        .await
        .map_err(EndpointError::Close)?;

        if !was_connected {
            debug!(url = %self.url, "secure channel already closed");
        }
        Ok(())
    }
}

struct UaSessionHandle {
    session: SessionSlot,
}

impl UaSessionHandle {
    fn session(&self, node_id: &str) -> Result<UaSession, String> {
        self.session
            .get()
            .ok_or_else(|| format!("session closed before accessing {node_id}"))
    }
}

#[async_trait]
impl EndpointSession for UaSessionHandle {
    async fn read(&self, node_id: &str) -> Result<Value, EndpointError> {
        let target = parse_node_id(node_id)?;
        let read_err = |reason: String| EndpointError::Read {
            node_id: node_id.to_string(),
            reason,
        };
        let session = self.session(node_id).map_err(read_err)?;

        trace!(node_id, "reading node value");
        let results = blocking(move || {
            let request = ReadValueId {
                node_id: target,
                attribute_id: AttributeId::Value as u32,
                index_range: UAString::null(),
                data_encoding: QualifiedName::null(),
            };
            session
                .read()
                .read(&[request], TimestampsToReturn::Neither, 0.0)
        })
        .await
        .map_err(read_err)?
        .map_err(|status| read_err(format!("{status:?}")))?;

        let data_value = results
            .into_iter()
            .next()
            .ok_or_else(|| read_err("empty read response".to_string()))?;

        if let Some(status) = data_value.status {
            if status.is_bad() {
                return Err(read_err(format!("{status:?}")));
            }
        }

        match data_value.value {
            Some(ref variant) => variant_to_value(node_id, variant),
            None => Err(read_err("no value returned".to_string())),
        }
    }

    async fn write(&self, node_id: &str, value: &Value) -> Result<(), EndpointError> {
        let target = parse_node_id(node_id)?;
        let number = value.as_f64();
        let write_err = |reason: String| EndpointError::Write {
            node_id: node_id.to_string(),
            reason,
        };
        let session = self.session(node_id).map_err(write_err)?;

        let statuses = blocking(move || {
            let request = WriteValue {
                node_id: target,
                attribute_id: AttributeId::Value as u32,
                index_range: UAString::null(),
                value: DataValue::value_only(Variant::Double(number)),
            };
            session.read().write(&[request])
        })
        .await
        .map_err(write_err)?
        .map_err(|status| write_err(format!("{status:?}")))?;

        match statuses.first() {
            Some(status) if status.is_good() => Ok(()),
            Some(status) => Err(write_err(format!("{status:?}"))),
            None => Err(write_err("empty write response".to_string())),
        }
    }

    async fn close(&self) -> Result<(), EndpointError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        blocking(move || session.read().disconnect())
            .await
            .map_err(EndpointError::Close)
    }
}
