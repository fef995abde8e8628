//! Error taxonomy of the gateway core.
//!
//! - `FatalError`: startup failures, the process must exit non-zero
//! - `OperationError`: one tick or one inbound message failed, reported and dropped
//! - shutdown failures are collected into `ShutdownReport` and never block exit

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::endpoint::EndpointError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FatalError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{what} not found: {}", .path.display())]
    MissingCredential { what: &'static str, path: PathBuf },
    #[error(transparent)]
    BrokerConnect(BrokerError),
    #[error(transparent)]
    EndpointConnect(EndpointError),
    #[error(transparent)]
    SessionOpen(EndpointError),
}

impl FatalError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> u8 {
        1
    }
}

#[derive(Debug, Error)]
pub enum OperationError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("malformed payload on topic {topic}: {reason}")]
    Decode { topic: String, reason: String },
    #[error("failed to encode value for topic {topic}: {reason}")]
    Encode { topic: String, reason: String },
    #[error("{operation} on {target} timed out after {} ms", .timeout.as_millis())]
    Timeout {
        operation: &'static str,
        target: String,
        timeout: Duration,
    },
}

/// Runs `fut` under the per-operation timeout.
pub(crate) async fn bounded<T, E, F>(
    operation: &'static str,
    target: &str,
    timeout: Duration,
    fut: F,
) -> Result<T, OperationError>
where
    F: std::future::Future<Output = Result<T, E>>,
    E: Into<OperationError>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(OperationError::Timeout {
            operation,
            target: target.to_string(),
            timeout,
        }),
    }
}
