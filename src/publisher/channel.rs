//! Channel-backed publisher for local mode and tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::Publisher;
use crate::error::GatewayError;

/// Delivers payloads to an in-process receiver instead of a bus.
///
/// Local mode drains the receiver into debug logs; tests assert on it.
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<(String, Vec<u8>)>,
    connected: AtomicBool,
}

impl ChannelPublisher {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                connected: AtomicBool::new(true),
            }),
            rx,
        )
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::PublisherUnavailable);
        }

        self.tx
            .send((channel.to_string(), payload))
            .map_err(|e| GatewayError::PublishFailed {
                channel: channel.to_string(),
                source: Box::new(e),
            })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
