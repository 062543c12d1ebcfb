//! Domain error types for the gateway daemon.
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All application code returns Result<T, GatewayError>.

use thiserror::Error;

/// Close codes the gateway uses to signal that the session can never be
/// re-established with the current credentials. Receiving one of these
/// stops the whole shard group; reconnecting would only loop.
pub const FATAL_CLOSE_CODES: &[u16] = &[
    4004, // not authenticated
    4010, // invalid shard
    4011, // sharding required
    4012, // invalid API version
    4013, // invalid intents
    4014, // disallowed intents
];

/// Gateway domain errors.
///
/// Every variant carries structured context fields for diagnostics.
/// On-call engineers can pattern-match on the variant to understand
/// the failure mode without parsing error message strings.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration error (environment variable missing or invalid,
    /// or a manager configuration that failed validation)
    #[error("configuration error: {0}")]
    Config(String),

    /// The gateway closed the connection with a close code
    #[error("gateway closed connection with code {code}: {reason}")]
    GatewayClosed { code: u16, reason: String },

    /// The websocket failed at the transport level
    #[error("websocket failure: {0}")]
    Websocket(#[source] Box<tokio_tungstenite::tungstenite::Error>),

    /// The websocket stream ended without a close frame
    #[error("websocket stream ended unexpectedly")]
    StreamEnded,

    /// Inflating a binary frame failed
    #[error("payload decompression failed")]
    Decompress(#[source] std::io::Error),

    /// A frame could not be decoded as a gateway payload
    #[error("payload decode failed")]
    Payload(#[source] serde_json::Error),

    /// Encoding the bus envelope failed
    #[error("envelope encode failed for {event_type}")]
    Encode {
        event_type: String,
        #[source]
        source: rmp_serde::encode::Error,
    },

    /// No message arrived within the post-handshake window
    #[error("shard {shard_id} received no event within {timeout_secs}s of handshake")]
    ConnectTimeout { shard_id: u32, timeout_secs: u64 },

    /// The gateway stopped acknowledging heartbeats
    #[error("shard {shard_id} heartbeat unacknowledged for {elapsed_ms}ms")]
    HeartbeatFailure { shard_id: u32, elapsed_ms: u64 },

    /// Publishing to the message bus failed
    #[error("publish failed on channel '{channel}'")]
    PublishFailed {
        channel: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// No producer client is connected for this manager
    #[error("no producer client connected")]
    PublisherUnavailable,

    /// Connecting the producer client failed
    #[error("producer connection failed")]
    PublisherConnect(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Opening a shard group would exceed the daily session budget
    #[error("session limit exhausted: {requested} shards requested, {remaining} sessions remaining")]
    SessionLimitExhausted { requested: usize, remaining: i64 },

    /// No manager with this identifier exists
    #[error("no manager with identifier '{identifier}' exists")]
    InvalidManager { identifier: String },

    /// No shard group with this id exists
    #[error("invalid shard group id {group_id}")]
    InvalidShardGroup { group_id: i32 },

    /// Shard groups can only be deleted once fully closed
    #[error("shard group {group_id} is not closed")]
    ShardGroupNotClosed { group_id: i32 },

    /// Timed out waiting for the initial member chunk
    #[error("timed out on initial member chunks for guild {guild_id}")]
    ChunkTimeout { guild_id: u64 },

    /// The surrounding scope was cancelled
    #[error("operation cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on `gateway_errors_total`,
    /// enabling per-error-type monitoring and alerting.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::GatewayClosed { .. } => "gateway_closed",
            Self::Websocket(_) => "websocket",
            Self::StreamEnded => "stream_ended",
            Self::Decompress(_) => "decompress",
            Self::Payload(_) => "payload",
            Self::Encode { .. } => "encode",
            Self::ConnectTimeout { .. } => "connect_timeout",
            Self::HeartbeatFailure { .. } => "heartbeat",
            Self::PublishFailed { .. } => "publish",
            Self::PublisherUnavailable => "publisher_unavailable",
            Self::PublisherConnect(_) => "publisher_connect",
            Self::SessionLimitExhausted { .. } => "session_limit",
            Self::InvalidManager { .. } => "invalid_manager",
            Self::InvalidShardGroup { .. } => "invalid_shard_group",
            Self::ShardGroupNotClosed { .. } => "shard_group_not_closed",
            Self::ChunkTimeout { .. } => "chunk_timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// True when the error carries a close code the gateway has marked
    /// as permanent. These must never be retried.
    pub fn is_fatal_close(&self) -> bool {
        matches!(self, Self::GatewayClosed { code, .. } if FATAL_CLOSE_CODES.contains(code))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Websocket(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_close_codes_are_classified() {
        for code in [4004u16, 4010, 4011, 4012, 4013, 4014] {
            let err = GatewayError::GatewayClosed {
                code,
                reason: String::new(),
            };
            assert!(err.is_fatal_close(), "code {code} should be fatal");
        }

        // Normal closure and gateway-requested reconnects are transient
        for code in [1000u16, 1001, 4000, 4007, 4009] {
            let err = GatewayError::GatewayClosed {
                code,
                reason: String::new(),
            };
            assert!(!err.is_fatal_close(), "code {code} should be transient");
        }
    }

    #[test]
    fn non_close_errors_are_never_fatal() {
        assert!(!GatewayError::StreamEnded.is_fatal_close());
        assert!(!GatewayError::HeartbeatFailure {
            shard_id: 0,
            elapsed_ms: 12000
        }
        .is_fatal_close());
    }

    #[test]
    fn error_messages_contain_context() {
        let err = GatewayError::SessionLimitExhausted {
            requested: 16,
            remaining: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("16"));
        assert!(msg.contains('3'));

        let err = GatewayError::ChunkTimeout {
            guild_id: 812398123,
        };
        assert!(err.to_string().contains("812398123"));

        let err = GatewayError::GatewayClosed {
            code: 4014,
            reason: "Disallowed intent(s).".to_string(),
        };
        assert!(err.to_string().contains("4014"));
        assert!(err.to_string().contains("Disallowed"));
    }

    #[test]
    fn every_variant_has_distinct_error_type_label() {
        let labels = [
            GatewayError::Config(String::new()).error_type_label(),
            GatewayError::GatewayClosed {
                code: 1000,
                reason: String::new(),
            }
            .error_type_label(),
            GatewayError::StreamEnded.error_type_label(),
            GatewayError::ConnectTimeout {
                shard_id: 0,
                timeout_secs: 5,
            }
            .error_type_label(),
            GatewayError::HeartbeatFailure {
                shard_id: 0,
                elapsed_ms: 0,
            }
            .error_type_label(),
            GatewayError::PublisherUnavailable.error_type_label(),
            GatewayError::SessionLimitExhausted {
                requested: 0,
                remaining: 0,
            }
            .error_type_label(),
            GatewayError::InvalidManager {
                identifier: String::new(),
            }
            .error_type_label(),
            GatewayError::InvalidShardGroup { group_id: 0 }.error_type_label(),
            GatewayError::ShardGroupNotClosed { group_id: 0 }.error_type_label(),
            GatewayError::ChunkTimeout { guild_id: 0 }.error_type_label(),
            GatewayError::Cancelled.error_type_label(),
        ];

        let mut unique = labels.to_vec();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(labels.len(), unique.len(), "duplicate error_type_label");
    }
}
