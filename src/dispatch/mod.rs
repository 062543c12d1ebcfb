//! Event dispatch pipeline.
//!
//! Every op-0 frame flows through here: a process-wide worker ticket is
//! acquired, blacklists are applied, the injected state-update step
//! runs, and the result is wrapped in a bus envelope and published.
//! The pipeline never decodes event payloads itself.

mod envelope;

pub use envelope::{CourierMetadata, CourierPayload};

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::error::GatewayError;
use crate::manager::ManagerContext;
use crate::wire::{GatewayOp, ReceivedPayload};

/// Dispatches slower than this log a warning with the event trace.
const SLOW_DISPATCH_WARN: Duration = Duration::from_secs(1);

/// Dispatches slower than this additionally page an operator.
const SLOW_DISPATCH_NOTIFY: Duration = Duration::from_secs(15);

/// Where a dispatched event came from, for the state-update step.
#[derive(Debug, Clone, Copy)]
pub struct StateCtx<'a> {
    pub identifier: &'a str,
    pub group_id: i32,
    pub shard_id: u32,
}

/// Outcome of the state-update step.
pub struct StateResult {
    /// Payload to publish, possibly transformed.
    pub data: Value,
    /// Driver-specific side data attached to the envelope.
    pub extra: Option<Value>,
    /// When false the event is consumed by state alone.
    pub publish: bool,
}

/// Injected collaborator that maintains shared state off the event
/// stream and decides whether each event reaches consumers.
#[async_trait]
pub trait StateUpdate: Send + Sync {
    async fn update(
        &self,
        ctx: StateCtx<'_>,
        msg: &ReceivedPayload,
    ) -> Result<StateResult, GatewayError>;
}

/// Default state step: forward every event untouched.
pub struct PassthroughState;

#[async_trait]
impl StateUpdate for PassthroughState {
    async fn update(
        &self,
        _ctx: StateCtx<'_>,
        msg: &ReceivedPayload,
    ) -> Result<StateResult, GatewayError> {
        Ok(StateResult {
            data: msg.data.clone(),
            extra: None,
            publish: true,
        })
    }
}

/// Run one dispatched event through the pipeline.
///
/// Called from a spawned task per event; ordering beyond sequence
/// storage is not guaranteed once the ticket is acquired.
pub async fn handle_dispatch(
    manager: Arc<ManagerContext>,
    group_id: i32,
    shard_id: u32,
    mut msg: ReceivedPayload,
) -> Result<(), GatewayError> {
    let started = Instant::now();
    let identifier = manager.identifier.clone();

    let result = run_pipeline(&manager, group_id, shard_id, &mut msg).await;

    let elapsed = started.elapsed();
    if elapsed > SLOW_DISPATCH_WARN {
        let trace = serde_json::to_string(&msg.trace).unwrap_or_default();
        warn!(
            manager = %identifier,
            shard_id,
            event_type = msg.event_type.as_deref().unwrap_or(""),
            elapsed_ms = elapsed.as_millis() as u64,
            %trace,
            "Dispatch took too long"
        );
    }
    if elapsed > SLOW_DISPATCH_NOTIFY {
        manager.process.metrics.record_operator_notification(&identifier);
        tracing::error!(
            target: "operator",
            manager = %identifier,
            shard_id,
            event_type = msg.event_type.as_deref().unwrap_or(""),
            elapsed_ms = elapsed.as_millis() as u64,
            "Dispatch exceeded operator threshold"
        );
    }

    if let Err(ref e) = result {
        manager.process.metrics.record_error(shard_id, e.error_type_label());
    }

    result
}

async fn run_pipeline(
    manager: &Arc<ManagerContext>,
    group_id: i32,
    shard_id: u32,
    msg: &mut ReceivedPayload,
) -> Result<(), GatewayError> {
    let process = &manager.process;

    process.pool_waiting.fetch_add(1, Ordering::Relaxed);
    let ticket = process.pool.wait().await;
    process.pool_waiting.fetch_sub(1, Ordering::Relaxed);

    msg.add_trace("ticket");
    msg.trace.insert("ticket_id".to_string(), ticket.id() as i64);

    let event_type = msg.event_type.clone().unwrap_or_default();

    // Blacklisted events are consumed silently, before state runs.
    if manager.event_blacklist.read().contains(&event_type) {
        process.metrics.record_dropped(&manager.identifier, "event_blacklist");
        return Ok(());
    }

    msg.add_trace("dispatch");

    let ctx = StateCtx {
        identifier: &manager.identifier,
        group_id,
        shard_id,
    };
    let result = manager.state_update.update(ctx, msg).await?;

    msg.add_trace("state");

    if !result.publish {
        process.metrics.record_dropped(&manager.identifier, "state");
        return Ok(());
    }

    // The produce blacklist suppresses delivery only; state already ran.
    if manager.produce_blacklist.read().contains(&event_type) {
        process.metrics.record_dropped(&manager.identifier, "produce_blacklist");
        return Ok(());
    }

    let payload = CourierPayload {
        op: GatewayOp::Dispatch,
        sequence: msg.sequence.unwrap_or(0),
        event_type: event_type.clone(),
        data: result.data,
        extra: result.extra,
        trace: Some(msg.trace.clone()),
        metadata: CourierMetadata::for_manager(&manager.identifier),
    };
    let bytes = payload.encode()?;

    let publisher = manager
        .publisher
        .read()
        .clone()
        .ok_or(GatewayError::PublisherUnavailable)?;
    let channel = manager.config.read().messaging.channel_name.clone();

    let publish_started = Instant::now();
    match publisher.publish(&channel, bytes).await {
        Ok(()) => {
            msg.add_trace("publish");
            process.total_events.fetch_add(1, Ordering::Relaxed);
            process
                .metrics
                .record_publish_success(&manager.identifier, publish_started.elapsed());
            Ok(())
        }
        Err(e) => {
            process.metrics.record_publish_failure(&manager.identifier);
            Err(e)
        }
    }
}
