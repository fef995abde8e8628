//! Metric descriptors and the `{"value": n}` wire payload.

use serde::{Deserialize, Serialize};
use serde_json::Number;
use std::fmt;
use std::time::Duration;

/// Direction(s) a metric is bridged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Endpoint -> broker (polling).
    Pub,
    /// Broker -> endpoint (writes).
    Sub,
    /// Both directions on the same topic.
    PubSub,
}

impl Mode {
    pub fn publishes(&self) -> bool {
        matches!(self, Mode::Pub | Mode::PubSub)
    }

    pub fn subscribes(&self) -> bool {
        matches!(self, Mode::Sub | Mode::PubSub)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Pub => "pub",
            Mode::Sub => "sub",
            Mode::PubSub => "pubsub",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric entry as written in `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    pub topic: String,
    pub mode: Mode,
    /// Polling period in milliseconds.
    #[serde(default)]
    pub interval: Option<u64>,
}

/// A validated, immutable binding between one node and one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metric {
    node_id: String,
    topic: String,
    mode: Mode,
    interval: Option<Duration>,
}

impl Metric {
    /// Validates a raw descriptor.
    ///
    /// `interval` is required (and must be non-zero) when the mode publishes;
    /// it is dropped for `sub` metrics since nothing polls them.
    pub fn new(
        node_id: impl Into<String>,
        topic: impl Into<String>,
        mode: Mode,
        interval_ms: Option<u64>,
    ) -> Result<Self, String> {
        let node_id = node_id.into();
        let topic = topic.into();

        if node_id.trim().is_empty() {
            return Err("nodeId must not be empty".to_string());
        }
        if topic.trim().is_empty() {
            return Err("topic must not be empty".to_string());
        }

        let interval = if mode.publishes() {
            match interval_ms {
                Some(0) => return Err(format!("interval must be > 0 for mode '{mode}'")),
                Some(ms) => Some(Duration::from_millis(ms)),
                None => return Err(format!("interval is required for mode '{mode}'")),
            }
        } else {
            None
        };

        Ok(Self {
            node_id,
            topic,
            mode,
            interval,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Polling period; `Some` iff the mode publishes.
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }
}

impl TryFrom<MetricConfig> for Metric {
    type Error = String;

    fn try_from(raw: MetricConfig) -> Result<Self, Self::Error> {
        Metric::new(raw.node_id, raw.topic, raw.mode, raw.interval)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {} ({})", self.node_id, self.topic, self.mode)
    }
}

/// Numeric scalar in transit between the endpoint and the broker.
///
/// Kept as a JSON number so integers stay integers on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Value(Number);

impl Value {
    /// `None` for NaN and infinities, which JSON cannot carry.
    pub fn from_f64(value: f64) -> Option<Self> {
        Number::from_f64(value).map(Value)
    }

    pub fn as_f64(&self) -> f64 {
        self.0.as_f64().unwrap_or_default()
    }

    pub fn as_number(&self) -> &Number {
        &self.0
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value(Number::from(value))
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value(Number::from(value))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The only message shape on the wire: `{"value": <number>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuePayload {
    pub value: Value,
}

impl ValuePayload {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(payload: &[u8]) -> Result<Value, serde_json::Error> {
        serde_json::from_slice::<ValuePayload>(payload).map(|p| p.value)
    }
}
