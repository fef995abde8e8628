//! OPC UA <-> MQTT gateway.
//!
//! Bridges OPC UA variables and MQTT topics according to a list of metrics:
//! - `pub`: poll a node every `interval` ms and publish `{"value": v}`
//! - `sub`: subscribe to a topic and write incoming `{"value": v}` to a node
//! - `pubsub`: both, on the same topic
//!
//! The endpoint and broker clients sit behind traits (`endpoint`, `broker`)
//! so several gateways can run side by side in tests.

pub mod broker;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod gateway;
pub mod health;
pub mod models;
pub mod router;
pub mod scheduler;
pub mod shutdown;

pub use config::{load_config, GatewayConfig};
pub use error::{FatalError, OperationError};
pub use gateway::{Gateway, LifecycleState, RunningGateway, ShutdownReport};
pub use models::{Metric, Mode, Value, ValuePayload};
