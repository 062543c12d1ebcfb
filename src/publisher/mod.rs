//! Message-bus publishing.
//!
//! The dispatch pipeline only sees the [`Publisher`] trait; concrete
//! drivers live alongside it. NATS JetStream is the production bus, the
//! channel driver backs local mode and tests.

mod channel;
mod nats;

pub use channel::ChannelPublisher;
pub use nats::NatsPublisher;

use async_trait::async_trait;

use crate::error::GatewayError;

/// A connected message-bus client.
///
/// Implementations must be safe to share across every shard of a
/// manager; publishes happen concurrently from dispatch workers.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Deliver an opaque payload onto a named channel.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), GatewayError>;

    /// Whether the underlying connection is believed healthy.
    fn is_connected(&self) -> bool;

    /// Graceful shutdown. Publishing after close is an error.
    async fn close(&self);
}
