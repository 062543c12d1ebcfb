//! Manager orchestration.
//!
//! A manager is one bot identity: its token, publisher, token buckets
//! and shard groups. During a rolling restart a manager briefly runs
//! two groups, retiring the older one once the successor is ready.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{GatewayDescriptor, ManagerConfig};
use crate::dispatch::{CourierMetadata, CourierPayload, StateUpdate};
use crate::error::GatewayError;
use crate::limit::BucketStore;
use crate::publisher::Publisher;
use crate::shard::{GroupStatus, ShardGroup};
use crate::supervisor::ProcessShared;
use crate::wire::GatewayOp;

/// Largest random suffix appended to messaging client names.
const MAX_CLIENT_NUMBER: u32 = 9999;

/// Shared manager state. Shards and groups hold this upward reference;
/// it never owns the shard groups themselves.
pub struct ManagerContext {
    pub identifier: String,
    pub display_name: String,
    pub config: RwLock<ManagerConfig>,
    pub gateway: RwLock<GatewayDescriptor>,
    pub buckets: BucketStore,
    pub publisher: RwLock<Option<Arc<dyn Publisher>>>,
    pub event_blacklist: RwLock<HashSet<String>>,
    pub produce_blacklist: RwLock<HashSet<String>>,
    pub state_update: Arc<dyn StateUpdate>,
    pub process: Arc<ProcessShared>,
    pub token: CancellationToken,
    /// Hash of the bot token, used to key identify buckets without
    /// leaking the token into bucket names or logs.
    pub token_hash: String,
    error: RwLock<String>,
}

impl ManagerContext {
    /// Publish a daemon-originated event (status updates and the like)
    /// wrapped in the standard envelope.
    pub async fn publish_event(&self, event_type: &str, data: Value) -> Result<(), GatewayError> {
        let payload = CourierPayload {
            op: GatewayOp::Dispatch,
            sequence: 0,
            event_type: event_type.to_string(),
            data,
            extra: None,
            trace: None,
            metadata: CourierMetadata::for_manager(&self.identifier),
        };
        let bytes = payload.encode()?;

        let publisher = self
            .publisher
            .read()
            .clone()
            .ok_or(GatewayError::PublisherUnavailable)?;
        let channel = self.config.read().messaging.channel_name.clone();

        publisher.publish(&channel, bytes).await
    }

    pub fn set_error(&self, message: String) {
        *self.error.write() = message;
    }

    pub fn last_error(&self) -> String {
        self.error.read().clone()
    }
}

/// One bot identity and its shard groups.
pub struct Manager {
    pub ctx: Arc<ManagerContext>,
    shard_groups: DashMap<i32, Arc<ShardGroup>>,
    group_iter: AtomicI32,
}

impl Manager {
    /// Validate the configuration and build the manager. The publisher
    /// is attached later by [`Manager::open`].
    pub fn new(
        process: Arc<ProcessShared>,
        parent: &CancellationToken,
        mut config: ManagerConfig,
        state_update: Arc<dyn StateUpdate>,
    ) -> Result<Self, GatewayError> {
        config.normalize()?;

        info!(manager = %config.identifier, "Creating new manager");

        let ctx = Arc::new(ManagerContext {
            identifier: config.identifier.clone(),
            display_name: config.display_name.clone(),
            gateway: RwLock::new(config.gateway.clone()),
            buckets: BucketStore::new(),
            publisher: RwLock::new(None),
            event_blacklist: RwLock::new(HashSet::new()),
            produce_blacklist: RwLock::new(HashSet::new()),
            state_update,
            process,
            token: parent.child_token(),
            token_hash: quick_hash(&config.token),
            error: RwLock::new(String::new()),
            config: RwLock::new(config),
        });

        Ok(Self {
            ctx,
            shard_groups: DashMap::new(),
            group_iter: AtomicI32::new(0),
        })
    }

    /// The client name the publisher should connect with, suffixed
    /// with a random number when configured, to keep cluster ids from
    /// clashing across daemon replicas.
    pub fn client_name(&self) -> String {
        let messaging = self.ctx.config.read().messaging.clone();
        if messaging.use_random_suffix {
            let suffix = rand::thread_rng().gen_range(0..=MAX_CLIENT_NUMBER);
            format!("{}-{}", messaging.client_name, suffix)
        } else {
            messaging.client_name
        }
    }

    /// Attach the connected publisher and load the event filters.
    pub fn open(&self, publisher: Arc<dyn Publisher>) {
        info!(manager = %self.ctx.identifier, "Starting up manager");

        {
            let config = self.ctx.config.read();
            *self.ctx.event_blacklist.write() =
                config.events.event_blacklist.iter().cloned().collect();
            *self.ctx.produce_blacklist.write() =
                config.events.produce_blacklist.iter().cloned().collect();
        }

        *self.ctx.publisher.write() = Some(publisher);
    }

    /// Expected shard count: the gateway's recommendation when
    /// auto-sharded, the configured count otherwise, rounded up to a
    /// multiple of `max_concurrency` so identify buckets stay aligned.
    pub fn gather_shard_count(&self) -> u32 {
        let (auto, configured) = {
            let config = self.ctx.config.read();
            (config.sharding.auto_sharded, config.sharding.shard_count)
        };
        let (recommended, max_concurrency) = {
            let gateway = self.ctx.gateway.read();
            (
                gateway.shards,
                gateway.session_start_limit.max_concurrency.max(1),
            )
        };

        let shard_count = if auto { recommended } else { configured }.max(1);
        shard_count.div_ceil(max_concurrency) * max_concurrency
    }

    /// The shard ids this process will run for a given count.
    pub fn generate_shard_ids(shard_count: u32) -> Vec<u32> {
        (0..shard_count).collect()
    }

    /// Create a new shard group and, when `start` is set, open it.
    /// Older groups are retired once the new one signals ready.
    pub async fn scale(
        &self,
        shard_ids: Vec<u32>,
        shard_count: u32,
        start: bool,
    ) -> Result<(i32, Option<watch::Receiver<bool>>), GatewayError> {
        let group_id = self.group_iter.fetch_add(1, Ordering::SeqCst);
        let group = Arc::new(ShardGroup::new(Arc::clone(&self.ctx), group_id));
        self.shard_groups.insert(group_id, Arc::clone(&group));

        if !start {
            return Ok((group_id, None));
        }

        let ready = group.open(shard_ids, shard_count).await?;

        // Rolling restart: the predecessors stay live until the new
        // cohort is ready, then get replaced. Duplicate events during
        // the overlap are tolerated downstream.
        let older: Vec<Arc<ShardGroup>> = self
            .shard_groups
            .iter()
            .filter(|entry| *entry.key() < group_id)
            .map(|entry| Arc::clone(&entry))
            .collect();

        if !older.is_empty() {
            let mut ready_rx = ready.clone();
            let identifier = self.ctx.identifier.clone();
            tokio::spawn(async move {
                if ready_rx.wait_for(|ready| *ready).await.is_ok() {
                    info!(
                        manager = %identifier,
                        group_id,
                        retiring = older.len(),
                        "New shard group ready, retiring older groups"
                    );
                    for group in older {
                        group.close_with(GroupStatus::Replaced).await;
                    }
                }
            });
        }

        Ok((group_id, Some(ready)))
    }

    pub fn shard_group(&self, group_id: i32) -> Option<Arc<ShardGroup>> {
        self.shard_groups.get(&group_id).map(|g| Arc::clone(&g))
    }

    pub fn shard_groups(&self) -> Vec<(i32, Arc<ShardGroup>)> {
        self.shard_groups
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(&entry)))
            .collect()
    }

    /// Stop a shard group without removing it from the manager.
    pub async fn stop_shard_group(&self, group_id: i32) -> Result<(), GatewayError> {
        let group = self
            .shard_group(group_id)
            .ok_or(GatewayError::InvalidShardGroup { group_id })?;
        group.close().await;
        Ok(())
    }

    /// Remove a shard group. Only closed groups can be deleted.
    pub fn delete_shard_group(&self, group_id: i32) -> Result<(), GatewayError> {
        let group = self
            .shard_group(group_id)
            .ok_or(GatewayError::InvalidShardGroup { group_id })?;

        if group.ctx.status() != GroupStatus::Closed {
            return Err(GatewayError::ShardGroupNotClosed { group_id });
        }

        self.shard_groups.remove(&group_id);
        debug!(manager = %self.ctx.identifier, group_id, "Deleted shard group");
        Ok(())
    }

    /// Replace the gateway descriptor, e.g. after a collaborator
    /// re-fetched `/gateway/bot`.
    pub fn refresh_gateway(&self, descriptor: GatewayDescriptor) {
        *self.ctx.gateway.write() = descriptor;
    }

    /// Close every shard group, then stop the manager scope. Restart
    /// brings the manager back with a fresh group.
    pub async fn close(&self) {
        info!(manager = %self.ctx.identifier, "Closing down manager");

        for (_, group) in self.shard_groups() {
            group.close().await;
        }

        if let Some(publisher) = self.ctx.publisher.read().clone() {
            publisher.close().await;
        }

        self.ctx.token.cancel();
    }

    /// Close existing groups and open a fresh one on the current plan.
    pub async fn restart(&self) -> Result<watch::Receiver<bool>, GatewayError> {
        for (_, group) in self.shard_groups() {
            group.close().await;
        }

        let shard_count = self.gather_shard_count();
        let shard_ids = Self::generate_shard_ids(shard_count);
        let (_, ready) = self.scale(shard_ids, shard_count, true).await?;
        Ok(ready.expect("scale with start returns a ready signal"))
    }
}

/// Short stable hash of a token for bucket names.
fn quick_hash(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
