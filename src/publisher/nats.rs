//! NATS JetStream publisher.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_nats::jetstream::{self, Context as JsContext};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::Publisher;
use crate::error::GatewayError;

/// Publishes bus envelopes to NATS JetStream subjects.
pub struct NatsPublisher {
    jetstream: JsContext,
    connected: AtomicBool,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
}

impl NatsPublisher {
    /// Connect to NATS with the given client name.
    pub async fn connect(servers: &str, client_name: &str) -> Result<Arc<Self>, GatewayError> {
        info!(servers, client_name, "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .name(client_name)
            .connect(servers)
            .await
            .map_err(|e| GatewayError::PublisherConnect(Box::new(e)))?;

        let jetstream = jetstream::new(client);

        info!("Connected to NATS JetStream");

        Ok(Arc::new(Self {
            jetstream,
            connected: AtomicBool::new(true),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        }))
    }

    /// Get total messages published.
    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    /// Get total publish failures.
    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Publisher for NatsPublisher {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::PublisherUnavailable);
        }

        let publish = self
            .jetstream
            .publish(channel.to_string(), payload.into())
            .await;

        let ack = match publish {
            Ok(ack_future) => ack_future.await,
            Err(e) => Err(e),
        };

        match ack {
            Ok(ack) => {
                self.messages_published.fetch_add(1, Ordering::Relaxed);
                debug!(channel, stream = %ack.stream, seq = ack.sequence, "Event published");
                Ok(())
            }
            Err(e) => {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                warn!(channel, error = %e, "Failed to publish event");
                Err(GatewayError::PublishFailed {
                    channel: channel.to_string(),
                    source: Box::new(e),
                })
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        info!("Closing NATS connection");
        self.connected.store(false, Ordering::SeqCst);
        // async-nats handles cleanup on drop
    }
}
