//! Polling scheduler.
//!
//! Every `pub`/`pubsub` metric gets its own loop. Each tick runs as a
//! separate task, so a slow read never delays the next tick of the same
//! metric (overlapping ticks are allowed) nor any other metric's loop.

use crate::broker::DeliveryOptions;
use crate::context::BridgeContext;
use crate::error::{bounded, OperationError};
use crate::models::{Metric, Value, ValuePayload};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Position of the metric in the configuration.
pub type MetricKey = usize;

struct PollTask {
    metric: Arc<Metric>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    ctx: Arc<BridgeContext>,
    token: CancellationToken,
    tasks: HashMap<MetricKey, PollTask>,
}

impl Scheduler {
    /// Cancelling `token` stops every loop registered on this scheduler.
    pub fn new(ctx: Arc<BridgeContext>, token: CancellationToken) -> Self {
        Self {
            ctx,
            token,
            tasks: HashMap::new(),
        }
    }

    /// Starts polling `metric`. The first tick fires immediately.
    ///
    /// Returns `false` for metrics that do not publish.
    pub fn register(&mut self, key: MetricKey, metric: Arc<Metric>) -> bool {
        let Some(period) = metric.interval() else {
            return false;
        };

        if let Some(previous) = self.tasks.remove(&key) {
            warn!(key, node_id = previous.metric.node_id(), "replacing polling task");
            previous.token.cancel();
        }

        let token = self.token.child_token();
        let handle = tokio::spawn(poll_loop(
            metric.clone(),
            period,
            self.ctx.clone(),
            token.clone(),
        ));

        info!(
            node_id = metric.node_id(),
            topic = metric.topic(),
            interval_ms = period.as_millis() as u64,
            "polling registered"
        );
        self.tasks.insert(
            key,
            PollTask {
                metric,
                token,
                handle,
            },
        );
        true
    }

    /// Stops one metric's loop without touching the others.
    pub fn cancel(&mut self, key: MetricKey) -> bool {
        match self.tasks.remove(&key) {
            Some(task) => {
                task.token.cancel();
                info!(node_id = task.metric.node_id(), "polling cancelled");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancels every loop and waits for them to wind down.
    pub async fn shutdown(self) {
        self.token.cancel();
        for (_, task) in self.tasks {
            if let Err(e) = task.handle.await {
                if e.is_panic() {
                    error!(node_id = task.metric.node_id(), "polling task panicked");
                }
            }
        }
    }
}

async fn poll_loop(
    metric: Arc<Metric>,
    period: Duration,
    ctx: Arc<BridgeContext>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                while in_flight.try_join_next().is_some() {}

                let metric = metric.clone();
                let ctx = ctx.clone();
                in_flight.spawn(async move {
                    if let Err(e) = poll_once(&metric, &ctx).await {
                        error!(
                            node_id = metric.node_id(),
                            topic = metric.topic(),
                            error = %e,
                            "polling tick failed"
                        );
                    }
                });
            }
        }
    }

    // In-flight ticks may finish within the grace period; the rest are dropped.
    if !in_flight.is_empty() {
        let drained = tokio::time::timeout(ctx.shutdown_grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                node_id = metric.node_id(),
                remaining = in_flight.len(),
                "aborting in-flight polling ticks"
            );
            in_flight.abort_all();
        }
    }
    debug!(node_id = metric.node_id(), "polling stopped");
}

/// One tick: read the node, publish `{"value": v}` on the metric's topic.
pub async fn poll_once(metric: &Metric, ctx: &BridgeContext) -> Result<Value, OperationError> {
    let read = bounded(
        "read",
        metric.node_id(),
        ctx.operation_timeout,
        ctx.session.read(metric.node_id()),
    )
    .await;

    let value = match read {
        Ok(value) => {
            ctx.stats.record_read();
            value
        }
        Err(e) => {
            ctx.stats.record_read_error();
            return Err(e);
        }
    };
    debug!(node_id = metric.node_id(), value = %value, "read value");

    let payload = ValuePayload::new(value.clone())
        .encode()
        .map_err(|e| OperationError::Encode {
            topic: metric.topic().to_string(),
            reason: e.to_string(),
        })?;

    let published = bounded(
        "publish",
        metric.topic(),
        ctx.operation_timeout,
        ctx.channel.publish(
            metric.topic(),
            payload.clone().into_bytes(),
            DeliveryOptions::FIRE_AND_FORGET,
        ),
    )
    .await;

    match published {
        Ok(()) => {
            ctx.stats.record_publish();
            debug!(topic = metric.topic(), payload = %payload, "published");
            Ok(value)
        }
        Err(e) => {
            ctx.stats.record_publish_error();
            Err(e)
        }
    }
}
