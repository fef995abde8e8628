//! Control endpoint seam.
//!
//! The gateway only needs connect, open-session, read, write and close from
//! the OPC UA side. These traits carry exactly that, so the core can run
//! against the real client (`ua_client`) or the devkit stubs.

mod ua_client;

pub use ua_client::OpcUaConnector;

use crate::models::Value;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EndpointError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("failed to open session: {0}")]
    SessionOpen(String),
    #[error("invalid node id '{node_id}': {reason}")]
    InvalidNodeId { node_id: String, reason: String },
    #[error("error reading from {node_id}: {reason}")]
    Read { node_id: String, reason: String },
    #[error("value at {node_id} is not numeric: {found}")]
    NonNumeric { node_id: String, found: String },
    #[error("error writing to {node_id}: {reason}")]
    Write { node_id: String, reason: String },
    #[error("error closing endpoint: {0}")]
    Close(String),
}

/// Establishes the transport-level connection to the control endpoint.
#[async_trait]
pub trait EndpointConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn EndpointConnection>, EndpointError>;
}

/// A connected, not yet authenticated endpoint.
#[async_trait]
pub trait EndpointConnection: Send + Sync {
    async fn open_session(&self) -> Result<Arc<dyn EndpointSession>, EndpointError>;

    async fn disconnect(&self) -> Result<(), EndpointError>;
}

/// The session shared by every scheduler tick and router dispatch.
///
/// Implementations must accept concurrent calls.
#[async_trait]
pub trait EndpointSession: Send + Sync {
    async fn read(&self, node_id: &str) -> Result<Value, EndpointError>;

    async fn write(&self, node_id: &str, value: &Value) -> Result<(), EndpointError>;

    async fn close(&self) -> Result<(), EndpointError>;
}
