//! Inbound router.
//!
//! Subscriptions are collected into a routing table (topic -> metrics) at
//! startup. One dispatch loop then drains the broker's delivery stream,
//! looks each message up by exact topic and hands every matching metric its
//! own write task.

use crate::broker::InboundMessage;
use crate::context::BridgeContext;
use crate::error::{bounded, OperationError};
use crate::models::{Metric, Value, ValuePayload};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Exact-match topic table. Metrics sharing a topic all receive every message.
#[derive(Debug, Default, Clone)]
pub struct RoutingTable {
    routes: HashMap<String, Vec<Arc<Metric>>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, metric: Arc<Metric>) {
        self.routes
            .entry(metric.topic().to_string())
            .or_default()
            .push(metric);
    }

    pub fn lookup(&self, topic: &str) -> &[Arc<Metric>] {
        self.routes.get(topic).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Number of routed metrics.
    pub fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

pub struct Router {
    ctx: Arc<BridgeContext>,
    table: RoutingTable,
}

impl Router {
    pub fn new(ctx: Arc<BridgeContext>) -> Self {
        Self {
            ctx,
            table: RoutingTable::new(),
        }
    }

    /// Subscribes to the metric's topic and routes it once the broker accepts.
    ///
    /// On failure the metric is left out of the table; its other direction,
    /// if any, is unaffected.
    pub async fn register(&mut self, metric: Arc<Metric>) -> Result<(), OperationError> {
        let subscribed = bounded(
            "subscribe",
            metric.topic(),
            self.ctx.operation_timeout,
            self.ctx.channel.subscribe(metric.topic()),
        )
        .await;

        match subscribed {
            Ok(()) => {
                self.ctx.stats.record_subscription();
                info!(topic = metric.topic(), node_id = metric.node_id(), "subscribed to topic");
                self.table.insert(metric);
                Ok(())
            }
            Err(e) => {
                self.ctx.stats.record_subscribe_error();
                Err(e)
            }
        }
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Starts the dispatch loop; the table is frozen from here on.
    pub fn spawn(
        self,
        inbound: mpsc::Receiver<InboundMessage>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(dispatch_loop(
            Arc::new(self.table),
            self.ctx,
            inbound,
            token,
        ))
    }
}

async fn dispatch_loop(
    table: Arc<RoutingTable>,
    ctx: Arc<BridgeContext>,
    mut inbound: mpsc::Receiver<InboundMessage>,
    token: CancellationToken,
) {
    let mut writes = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            message = inbound.recv() => {
                let Some(message) = message else {
                    debug!("broker delivery stream ended");
                    break;
                };
                while writes.try_join_next().is_some() {}
                dispatch(&table, &ctx, message, &mut writes);
            }
        }
    }

    if !writes.is_empty() {
        let drained = tokio::time::timeout(ctx.shutdown_grace, async {
            while writes.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = writes.len(), "aborting in-flight writes");
            writes.abort_all();
        }
    }
    debug!("inbound dispatch stopped");
}

fn dispatch(
    table: &RoutingTable,
    ctx: &Arc<BridgeContext>,
    message: InboundMessage,
    writes: &mut JoinSet<()>,
) {
    let targets = table.lookup(&message.topic);
    if targets.is_empty() {
        debug!(topic = %message.topic, "no metric routed for topic");
        return;
    }

    let payload: Arc<[u8]> = message.payload.into();
    for metric in targets {
        let metric = metric.clone();
        let payload = payload.clone();
        let ctx = ctx.clone();
        writes.spawn(async move {
            if let Err(e) = deliver(&metric, &payload, &ctx).await {
                error!(
                    topic = metric.topic(),
                    node_id = metric.node_id(),
                    error = %e,
                    "error processing message"
                );
            }
        });
    }
}

/// Decodes `{"value": v}` and writes `v` to the metric's node.
pub async fn deliver(
    metric: &Metric,
    payload: &[u8],
    ctx: &BridgeContext,
) -> Result<Value, OperationError> {
    let value = ValuePayload::decode(payload).map_err(|e| {
        ctx.stats.record_decode_error();
        OperationError::Decode {
            topic: metric.topic().to_string(),
            reason: e.to_string(),
        }
    })?;

    let written = bounded(
        "write",
        metric.node_id(),
        ctx.operation_timeout,
        ctx.session.write(metric.node_id(), &value),
    )
    .await;

    match written {
        Ok(()) => {
            ctx.stats.record_write();
            info!(node_id = metric.node_id(), value = %value, "written value");
            Ok(value)
        }
        Err(e) => {
            ctx.stats.record_write_error();
            Err(e)
        }
    }
}
