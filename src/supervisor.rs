//! Process supervisor.
//!
//! Owns every manager in the daemon plus the process-wide resources
//! they share: the dispatch ticket pool, the global event counter and
//! the metrics handle. The control-surface operations live here; their
//! HTTP/RPC carrier is a separate concern.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{GatewayDescriptor, ManagerConfig};
use crate::dispatch::StateUpdate;
use crate::error::GatewayError;
use crate::limit::TicketPool;
use crate::manager::Manager;
use crate::metrics::GatewayMetrics;
use crate::publisher::Publisher;

/// Resources shared by every manager in the process.
pub struct ProcessShared {
    /// Bounds concurrent dispatches across all managers.
    pub pool: TicketPool,
    /// Dispatches currently waiting on a ticket.
    pub pool_waiting: AtomicI64,
    /// Events published since the daemon started.
    pub total_events: AtomicI64,
    pub metrics: GatewayMetrics,
}

impl ProcessShared {
    pub fn new(dispatch_pool_size: usize, metrics: GatewayMetrics) -> Self {
        Self {
            pool: TicketPool::new(dispatch_pool_size),
            pool_waiting: AtomicI64::new(0),
            total_events: AtomicI64::new(0),
            metrics,
        }
    }
}

/// The daemon supervisor.
pub struct Courier {
    managers: DashMap<String, Arc<Manager>>,
    pub process: Arc<ProcessShared>,
    pub token: CancellationToken,
    pub start: Instant,
}

impl Courier {
    pub fn new(dispatch_pool_size: usize, metrics: GatewayMetrics) -> Self {
        Self {
            managers: DashMap::new(),
            process: Arc::new(ProcessShared::new(dispatch_pool_size, metrics)),
            token: CancellationToken::new(),
            start: Instant::now(),
        }
    }

    pub fn total_events(&self) -> i64 {
        self.process.total_events.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    pub fn manager(&self, identifier: &str) -> Result<Arc<Manager>, GatewayError> {
        self.managers
            .get(identifier)
            .map(|m| Arc::clone(&m))
            .ok_or_else(|| GatewayError::InvalidManager {
                identifier: identifier.to_string(),
            })
    }

    pub fn managers(&self) -> Vec<Arc<Manager>> {
        self.managers.iter().map(|m| Arc::clone(&m)).collect()
    }

    /// Register a new manager. Identifiers are unique per process.
    pub fn create_manager(
        &self,
        config: ManagerConfig,
        state_update: Arc<dyn StateUpdate>,
    ) -> Result<Arc<Manager>, GatewayError> {
        if self.managers.contains_key(&config.identifier) {
            return Err(GatewayError::Config(format!(
                "manager '{}' already exists",
                config.identifier
            )));
        }

        let manager = Arc::new(Manager::new(
            Arc::clone(&self.process),
            &self.token,
            config,
            state_update,
        )?);
        self.managers
            .insert(manager.ctx.identifier.clone(), Arc::clone(&manager));
        Ok(manager)
    }

    /// Attach a connected publisher and activate a manager.
    pub fn open_manager(
        &self,
        identifier: &str,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Arc<Manager>, GatewayError> {
        let manager = self.manager(identifier)?;
        manager.open(publisher);
        Ok(manager)
    }

    /// Close a manager and remove it from the supervisor.
    pub async fn delete_manager(&self, identifier: &str) -> Result<(), GatewayError> {
        let manager = self.manager(identifier)?;
        manager.close().await;
        self.managers.remove(identifier);
        info!(manager = identifier, "Deleted manager");
        Ok(())
    }

    /// Close every group of a manager and start a fresh one.
    pub async fn restart_manager(
        &self,
        identifier: &str,
    ) -> Result<watch::Receiver<bool>, GatewayError> {
        self.manager(identifier)?.restart().await
    }

    pub fn refresh_gateway(
        &self,
        identifier: &str,
        descriptor: GatewayDescriptor,
    ) -> Result<(), GatewayError> {
        self.manager(identifier)?.refresh_gateway(descriptor);
        Ok(())
    }

    /// Open a new shard group on a manager with an explicit plan.
    pub async fn create_shard_group(
        &self,
        identifier: &str,
        shard_ids: Vec<u32>,
        shard_count: u32,
    ) -> Result<(i32, watch::Receiver<bool>), GatewayError> {
        let manager = self.manager(identifier)?;
        let (group_id, ready) = manager.scale(shard_ids, shard_count, true).await?;
        Ok((group_id, ready.expect("started groups have a ready signal")))
    }

    pub async fn stop_shard_group(
        &self,
        identifier: &str,
        group_id: i32,
    ) -> Result<(), GatewayError> {
        self.manager(identifier)?.stop_shard_group(group_id).await
    }

    pub fn delete_shard_group(
        &self,
        identifier: &str,
        group_id: i32,
    ) -> Result<(), GatewayError> {
        self.manager(identifier)?.delete_shard_group(group_id)
    }

    /// Stop everything: every manager, then the root scope.
    pub async fn close(&self) {
        info!("Closing supervisor");
        for manager in self.managers() {
            manager.close().await;
        }
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BotConfig, EventConfig, MessagingConfig, ShardingConfig};
    use crate::dispatch::PassthroughState;

    fn test_config(identifier: &str) -> ManagerConfig {
        ManagerConfig {
            identifier: identifier.to_string(),
            display_name: identifier.to_string(),
            token: "a-token".to_string(),
            bot: BotConfig::default(),
            sharding: ShardingConfig::default(),
            messaging: MessagingConfig::default(),
            events: EventConfig::default(),
            gateway: GatewayDescriptor::default(),
        }
    }

    #[tokio::test]
    async fn manager_identifiers_are_unique() {
        let courier = Courier::new(16, GatewayMetrics::disabled());
        courier
            .create_manager(test_config("bot-a"), Arc::new(PassthroughState))
            .unwrap();

        let duplicate =
            courier.create_manager(test_config("bot-a"), Arc::new(PassthroughState));
        assert!(matches!(duplicate, Err(GatewayError::Config(_))));
    }

    #[tokio::test]
    async fn unknown_manager_lookups_fail() {
        let courier = Courier::new(16, GatewayMetrics::disabled());
        assert!(matches!(
            courier.manager("ghost"),
            Err(GatewayError::InvalidManager { .. })
        ));
    }

    #[tokio::test]
    async fn delete_manager_removes_it() {
        let courier = Courier::new(16, GatewayMetrics::disabled());
        courier
            .create_manager(test_config("bot-a"), Arc::new(PassthroughState))
            .unwrap();
        courier.delete_manager("bot-a").await.unwrap();
        assert!(courier.manager("bot-a").is_err());
    }

    #[tokio::test]
    async fn delete_shard_group_requires_closed() {
        let courier = Courier::new(16, GatewayMetrics::disabled());
        let manager = courier
            .create_manager(test_config("bot-a"), Arc::new(PassthroughState))
            .unwrap();

        // A group that was created but never started is Idle, not Closed
        let (group_id, _) = manager.scale(vec![], 1, false).await.unwrap();
        assert!(matches!(
            courier.delete_shard_group("bot-a", group_id),
            Err(GatewayError::ShardGroupNotClosed { .. })
        ));

        manager.stop_shard_group(group_id).await.unwrap();
        courier.delete_shard_group("bot-a", group_id).unwrap();
        assert!(manager.shard_group(group_id).is_none());
    }
}
