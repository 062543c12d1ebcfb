//! Shard group lifecycle.
//!
//! A shard group is a cohort of shards sharing one `(shard_count,
//! shard_ids)` plan. Groups exist so a replacement cohort can spin up
//! next to a running one during a rolling restart; the manager retires
//! older groups once the successor is ready.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::status::GroupStatus;
use super::Shard;
use crate::error::GatewayError;
use crate::limit::TicketPool;
use crate::manager::ManagerContext;

/// Simultaneous member-chunk flows allowed per group.
const CHUNK_CONCURRENCY: usize = 8;

/// Shared state of a shard group. Shards hold this upward reference;
/// it never owns the shards themselves.
pub struct GroupContext {
    pub id: i32,
    pub manager: Arc<ManagerContext>,
    pub token: CancellationToken,
    pub start: Instant,

    shard_count: AtomicU32,
    shard_ids: RwLock<Vec<u32>>,
    status: RwLock<GroupStatus>,
    error: RwLock<String>,

    /// Shards that have not reached Ready yet.
    pub waiting_for: AtomicI32,
    ready_tx: watch::Sender<bool>,

    /// Bounds concurrent guild-member-chunk flows.
    pub chunk_limiter: TicketPool,
    /// Per-guild completion flags: present-and-unset means a chunk flow
    /// is running, present-and-set means one finished recently.
    pub chunks_complete: DashMap<u64, Arc<AtomicBool>>,
    /// Per-guild wait handles released when a chunk flow completes.
    pub chunks_callback: DashMap<u64, watch::Receiver<bool>>,
    /// Per-guild coalescing signal, fired once per received chunk.
    pub chunk_arrivals: DashMap<u64, mpsc::Sender<()>>,
}

impl GroupContext {
    pub fn shard_count(&self) -> u32 {
        self.shard_count.load(Ordering::Acquire)
    }

    pub fn shard_ids(&self) -> Vec<u32> {
        self.shard_ids.read().clone()
    }

    pub fn status(&self) -> GroupStatus {
        *self.status.read()
    }

    pub fn error(&self) -> String {
        self.error.read().clone()
    }

    pub fn ready_subscribe(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    pub fn set_status(&self, status: GroupStatus) {
        *self.status.write() = status;

        debug!(
            manager = %self.manager.identifier,
            group_id = self.id,
            status = status.as_str(),
            "Shard group status changed"
        );

        let manager = Arc::clone(&self.manager);
        let group_id = self.id;
        tokio::spawn(async move {
            let data = serde_json::json!({
                "shard_group": group_id,
                "status": status.code(),
            });
            if let Err(e) = manager.publish_event("SHARD_GROUP_STATUS", data).await {
                debug!(error = %e, "Failed to publish shard group status");
            }
        });
    }

    /// Record a fatal error and stop the whole group. Used when a shard
    /// observes a close code that retrying cannot fix.
    pub fn fail(&self, message: String) {
        warn!(
            manager = %self.manager.identifier,
            group_id = self.id,
            error = %message,
            "Shard group cannot continue"
        );
        *self.error.write() = message.clone();
        self.manager.set_error(message);
        self.set_status(GroupStatus::Erroring);
        self.token.cancel();
    }

    /// Remove every trace of a guild from the chunking maps.
    pub fn clean_guild_chunks(&self, guild_id: u64) {
        self.chunks_callback.remove(&guild_id);
        self.chunk_arrivals.remove(&guild_id);
        self.chunks_complete.remove(&guild_id);
    }

    /// Called by the shard readiness waiters; fires the group ready
    /// signal when the last shard arrives.
    pub(super) fn shard_became_ready(&self) {
        let left = self.waiting_for.fetch_sub(1, Ordering::AcqRel) - 1;
        if left == 0 {
            self.set_status(GroupStatus::Ready);
            let _ = self.ready_tx.send(true);
        }
    }
}

/// Owner of a cohort of shards.
pub struct ShardGroup {
    pub ctx: Arc<GroupContext>,
    shards: DashMap<u32, Arc<Shard>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ShardGroup {
    pub fn new(manager: Arc<ManagerContext>, id: i32) -> Self {
        let (ready_tx, _) = watch::channel(false);
        let ctx = Arc::new(GroupContext {
            id,
            token: manager.token.child_token(),
            manager,
            start: Instant::now(),
            shard_count: AtomicU32::new(0),
            shard_ids: RwLock::new(Vec::new()),
            status: RwLock::new(GroupStatus::Idle),
            error: RwLock::new(String::new()),
            waiting_for: AtomicI32::new(0),
            ready_tx,
            chunk_limiter: TicketPool::new(CHUNK_CONCURRENCY),
            chunks_complete: DashMap::new(),
            chunks_callback: DashMap::new(),
            chunk_arrivals: DashMap::new(),
        });

        Self {
            ctx,
            shards: DashMap::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn shard(&self, shard_id: u32) -> Option<Arc<Shard>> {
        self.shards.get(&shard_id).map(|s| Arc::clone(&s))
    }

    pub fn shards(&self) -> Vec<Arc<Shard>> {
        self.shards.iter().map(|s| Arc::clone(&s)).collect()
    }

    pub fn shards_ready(&self) -> usize {
        self.shards
            .iter()
            .filter(|s| s.status().is_ready())
            .count()
    }

    /// Start the group: one shard state machine per id, identifies
    /// serialized through the manager's concurrency buckets. The
    /// returned signal fires once every shard has been ready at least
    /// once.
    pub async fn open(
        &self,
        shard_ids: Vec<u32>,
        shard_count: u32,
    ) -> Result<watch::Receiver<bool>, GatewayError> {
        let remaining = self
            .ctx
            .manager
            .gateway
            .read()
            .session_start_limit
            .remaining;
        if shard_ids.len() as i64 > remaining {
            let err = GatewayError::SessionLimitExhausted {
                requested: shard_ids.len(),
                remaining,
            };
            self.ctx.manager.set_error(err.to_string());
            return Err(err);
        }

        info!(
            manager = %self.ctx.manager.identifier,
            group_id = self.ctx.id,
            shard_count,
            shards = shard_ids.len(),
            "Opening shard group"
        );

        self.ctx.set_status(GroupStatus::Starting);
        self.ctx.shard_count.store(shard_count, Ordering::Release);
        *self.ctx.shard_ids.write() = shard_ids.clone();
        self.ctx
            .waiting_for
            .store(shard_ids.len() as i32, Ordering::Release);

        for shard_id in &shard_ids {
            let shard = Shard::new(
                Arc::clone(&self.ctx),
                Arc::clone(&self.ctx.manager),
                *shard_id,
            );
            self.shards.insert(*shard_id, shard);
        }

        let mut handles = self.handles.lock();
        for shard_id in &shard_ids {
            let shard = self.shard(*shard_id).expect("shard just inserted");

            // Readiness waiter: one decrement per shard, on first Ready.
            let ctx = Arc::clone(&self.ctx);
            let mut ready_rx = shard.ready_subscribe();
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    _ = ctx.token.cancelled() => {}
                    result = ready_rx.wait_for(|ready| *ready) => {
                        if result.is_ok() {
                            ctx.shard_became_ready();
                        }
                    }
                }
            }));

            handles.push(tokio::spawn(shard.run()));
        }
        drop(handles);

        self.ctx.set_status(GroupStatus::Connecting);

        Ok(self.ctx.ready_subscribe())
    }

    /// Stop every shard and wait for the state machines to exit.
    /// Closing an already-closed group is a no-op.
    pub async fn close(&self) {
        self.close_with(GroupStatus::Closed).await
    }

    /// Close, recording `status` as the terminal state. An Erroring
    /// group keeps its status so operators can see why it stopped.
    pub async fn close_with(&self, status: GroupStatus) {
        if self.ctx.status() == GroupStatus::Closed {
            return;
        }

        info!(
            manager = %self.ctx.manager.identifier,
            group_id = self.ctx.id,
            "Closing shard group"
        );

        self.ctx.token.cancel();

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        if self.ctx.status() != GroupStatus::Erroring {
            self.ctx.set_status(status);
        }
    }
}
