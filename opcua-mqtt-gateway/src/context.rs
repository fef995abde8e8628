use crate::broker::BrokerChannel;
use crate::endpoint::EndpointSession;
use crate::health::GatewayStats;
use std::sync::Arc;
use std::time::Duration;

/// Resources shared by every polling task and inbound dispatch.
///
/// Owned by the running gateway; tasks hold an `Arc` to it.
pub struct BridgeContext {
    pub session: Arc<dyn EndpointSession>,
    pub channel: Arc<dyn BrokerChannel>,
    pub stats: GatewayStats,
    pub operation_timeout: Duration,
    pub shutdown_grace: Duration,
}
