//! Shard and shard group status tracking.

use serde::Serialize;
use tokio::time::Instant;

/// Lifecycle states of a single shard connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Idle,
    Waiting,
    Connecting,
    Connected,
    Ready,
    Reconnecting,
    Closed,
    Erroring,
}

impl ShardStatus {
    /// Numeric code carried on SHARD_STATUS bus messages.
    pub fn code(self) -> i32 {
        match self {
            Self::Idle => 0,
            Self::Waiting => 1,
            Self::Connecting => 2,
            Self::Connected => 3,
            Self::Ready => 4,
            Self::Reconnecting => 5,
            Self::Closed => 6,
            Self::Erroring => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
            Self::Erroring => "erroring",
        }
    }

    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Lifecycle states of a shard group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Idle,
    Starting,
    Connecting,
    Ready,
    Replaced,
    Closed,
    Erroring,
}

impl GroupStatus {
    /// Numeric code carried on SHARD_GROUP_STATUS bus messages.
    pub fn code(self) -> i32 {
        match self {
            Self::Idle => 0,
            Self::Starting => 1,
            Self::Connecting => 2,
            Self::Ready => 3,
            Self::Replaced => 4,
            Self::Closed => 5,
            Self::Erroring => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Replaced => "replaced",
            Self::Closed => "closed",
            Self::Erroring => "erroring",
        }
    }
}

/// Heartbeat bookkeeping. Liveness holds while
/// `last_sent - last_ack <= interval * max_heartbeat_failures`.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatTimes {
    pub last_sent: Instant,
    pub last_ack: Instant,
}

impl HeartbeatTimes {
    pub fn fresh() -> Self {
        let now = Instant::now();
        Self {
            last_sent: now,
            last_ack: now,
        }
    }

    /// Round-trip of the most recent acknowledged heartbeat.
    pub fn latency(&self) -> std::time::Duration {
        self.last_ack.saturating_duration_since(self.last_sent)
    }
}
