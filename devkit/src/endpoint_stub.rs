/*!
Mock OPC UA endpoint.

Holds node values in memory and records every read and write. Reads and
writes can be made to fail or stall per node, and the connect, session
and close steps can be made to fail.
*/

use async_trait::async_trait;
use opcua_mqtt_gateway::endpoint::{
    EndpointConnection, EndpointConnector, EndpointError, EndpointSession,
};
use opcua_mqtt_gateway::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct EndpointState {
    nodes: Mutex<HashMap<String, Value>>,
    reads: Mutex<HashMap<String, usize>>,
    writes: Mutex<Vec<(String, Value)>>,
    failing_reads: Mutex<HashSet<String>>,
    failing_writes: Mutex<HashSet<String>>,
    read_delays: Mutex<HashMap<String, Duration>>,
    fail_connect: AtomicBool,
    fail_session: AtomicBool,
    fail_close: AtomicBool,
    connects: AtomicUsize,
    session_closed: AtomicBool,
    disconnected: AtomicBool,
}

/// Mock endpoint: the connector, the connection and the session in one handle.
#[derive(Clone, Default)]
pub struct MockEndpoint {
    state: Arc<EndpointState>,
}

impl MockEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_node(&self, node_id: &str, value: impl Into<Value>) {
        self.state
            .nodes
            .lock()
            .unwrap()
            .insert(node_id.to_string(), value.into());
    }

    pub fn set_node_f64(&self, node_id: &str, value: f64) {
        let value = Value::from_f64(value).expect("finite value");
        self.set_node(node_id, value);
    }

    pub fn node(&self, node_id: &str) -> Option<Value> {
        self.state.nodes.lock().unwrap().get(node_id).cloned()
    }

    pub fn fail_reads(&self, node_id: &str) {
        self.state
            .failing_reads
            .lock()
            .unwrap()
            .insert(node_id.to_string());
    }

    pub fn fail_writes(&self, node_id: &str) {
        self.state
            .failing_writes
            .lock()
            .unwrap()
            .insert(node_id.to_string());
    }

    /// Every read of `node_id` stalls for `delay` before answering.
    pub fn delay_reads(&self, node_id: &str, delay: Duration) {
        self.state
            .read_delays
            .lock()
            .unwrap()
            .insert(node_id.to_string(), delay);
    }

    pub fn fail_connect(&self) {
        self.state.fail_connect.store(true, Ordering::SeqCst);
    }

    pub fn fail_session(&self) {
        self.state.fail_session.store(true, Ordering::SeqCst);
    }

    /// Session close and disconnect report an error (the flags are still set).
    pub fn fail_close(&self) {
        self.state.fail_close.store(true, Ordering::SeqCst);
    }

    /// Read attempts on `node_id`, failed ones included.
    pub fn read_count(&self, node_id: &str) -> usize {
        self.state
            .reads
            .lock()
            .unwrap()
            .get(node_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn writes(&self) -> Vec<(String, Value)> {
        self.state.writes.lock().unwrap().clone()
    }

    pub fn writes_to(&self, node_id: &str) -> Vec<Value> {
        self.state
            .writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(node, _)| node == node_id)
            .map(|(_, value)| value.clone())
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn is_session_closed(&self) -> bool {
        self.state.session_closed.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.disconnected.load(Ordering::SeqCst)
    }

    fn close_result(&self) -> Result<(), EndpointError> {
        if self.state.fail_close.load(Ordering::SeqCst) {
            Err(EndpointError::Close("BadSessionClosed (mock)".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EndpointConnector for MockEndpoint {
    async fn connect(&self, url: &str) -> Result<Box<dyn EndpointConnection>, EndpointError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(EndpointError::Connect {
                url: url.to_string(),
                reason: "BadCommunicationError (mock)".to_string(),
            });
        }
        self.state.disconnected.store(false, Ordering::SeqCst);
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl EndpointConnection for MockEndpoint {
    async fn open_session(&self) -> Result<Arc<dyn EndpointSession>, EndpointError> {
        if self.state.fail_session.load(Ordering::SeqCst) {
            return Err(EndpointError::SessionOpen(
                "BadIdentityTokenRejected (mock)".to_string(),
            ));
        }
        self.state.session_closed.store(false, Ordering::SeqCst);
        Ok(Arc::new(self.clone()))
    }

    async fn disconnect(&self) -> Result<(), EndpointError> {
        self.state.disconnected.store(true, Ordering::SeqCst);
        self.close_result()
    }
}

#[async_trait]
impl EndpointSession for MockEndpoint {
    async fn read(&self, node_id: &str) -> Result<Value, EndpointError> {
        *self
            .state
            .reads
            .lock()
            .unwrap()
            .entry(node_id.to_string())
            .or_default() += 1;

        let delay = self.state.read_delays.lock().unwrap().get(node_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.state.failing_reads.lock().unwrap().contains(node_id) {
            return Err(EndpointError::Read {
                node_id: node_id.to_string(),
                reason: "BadNodeIdUnknown (mock)".to_string(),
            });
        }

        self.node(node_id).ok_or_else(|| EndpointError::Read {
            node_id: node_id.to_string(),
            reason: "no such node (mock)".to_string(),
        })
    }

    async fn write(&self, node_id: &str, value: &Value) -> Result<(), EndpointError> {
        if self.state.failing_writes.lock().unwrap().contains(node_id) {
            return Err(EndpointError::Write {
                node_id: node_id.to_string(),
                reason: "BadNotWritable (mock)".to_string(),
            });
        }
        self.state
            .writes
            .lock()
            .unwrap()
            .push((node_id.to_string(), value.clone()));
        self.set_node(node_id, value.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), EndpointError> {
        self.state.session_closed.store(true, Ordering::SeqCst);
        self.close_result()
    }
}
