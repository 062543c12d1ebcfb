//! Gateway wire protocol.
//!
//! Payload types and opcodes for the upstream websocket. Frames arrive
//! as text (JSON) or binary (zlib-compressed JSON); outbound frames are
//! always text. Only control opcodes are decoded in full — dispatch
//! payloads pass through as opaque JSON.

mod payload;

pub use payload::{
    Hello, Identify, IdentifyProperties, InvalidSession, MemberChunkRef, Ready,
    ReceivedPayload, RequestGuildMembers, Resume, SentPayload, Trace, User,
};

use std::io::Read;

use crate::error::GatewayError;

/// Upper bound on a single inbound frame after inflation.
pub const WEBSOCKET_READ_LIMIT: usize = 512 << 20;

/// Close code sent when this side initiates a resumable reconnect.
pub const RECONNECT_CLOSE_CODE: u16 = 4000;

/// Gateway opcodes.
///
/// Unlisted values are carried as `Unknown` rather than failing the
/// frame decode; the gateway adds opcodes without version bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayOp {
    Dispatch,
    Heartbeat,
    Identify,
    StatusUpdate,
    VoiceStateUpdate,
    Resume,
    Reconnect,
    RequestGuildMembers,
    InvalidSession,
    Hello,
    HeartbeatAck,
    Unknown(u8),
}

impl From<u8> for GatewayOp {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            3 => Self::StatusUpdate,
            4 => Self::VoiceStateUpdate,
            6 => Self::Resume,
            7 => Self::Reconnect,
            8 => Self::RequestGuildMembers,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            other => Self::Unknown(other),
        }
    }
}

impl From<GatewayOp> for u8 {
    fn from(op: GatewayOp) -> Self {
        match op {
            GatewayOp::Dispatch => 0,
            GatewayOp::Heartbeat => 1,
            GatewayOp::Identify => 2,
            GatewayOp::StatusUpdate => 3,
            GatewayOp::VoiceStateUpdate => 4,
            GatewayOp::Resume => 6,
            GatewayOp::Reconnect => 7,
            GatewayOp::RequestGuildMembers => 8,
            GatewayOp::InvalidSession => 9,
            GatewayOp::Hello => 10,
            GatewayOp::HeartbeatAck => 11,
            GatewayOp::Unknown(other) => other,
        }
    }
}

impl serde::Serialize for GatewayOp {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*self))
    }
}

impl<'de> serde::Deserialize<'de> for GatewayOp {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        Ok(Self::from(value))
    }
}

/// Gateway intent bits. Only the ones this daemon configures by name;
/// arbitrary bitfields pass through from configuration untouched.
pub mod intents {
    pub const GUILDS: u64 = 1;
    pub const GUILD_MEMBERS: u64 = 1 << 1;
    pub const GUILD_MESSAGES: u64 = 1 << 9;
}

/// Serde adapter for snowflake ids, which the gateway transmits as
/// decimal strings but older payloads may carry as integers.
pub mod snowflake {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&id.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
            Raw::Number(value) => Ok(value),
        }
    }
}

/// Inflate a zlib-compressed binary frame.
pub fn inflate(buf: &[u8]) -> Result<Vec<u8>, GatewayError> {
    let mut decoder = flate2::read::ZlibDecoder::new(buf);
    let mut out = Vec::new();
    decoder
        .take(WEBSOCKET_READ_LIMIT as u64)
        .read_to_end(&mut out)
        .map_err(GatewayError::Decompress)?;
    Ok(out)
}

/// Decode an inbound frame body into a payload.
pub fn decode_payload(buf: &[u8]) -> Result<ReceivedPayload, GatewayError> {
    serde_json::from_slice(buf).map_err(GatewayError::Payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn opcodes_round_trip() {
        for value in 0u8..=12 {
            let op = GatewayOp::from(value);
            assert_eq!(u8::from(op), value);
        }
        assert_eq!(GatewayOp::from(5), GatewayOp::Unknown(5));
    }

    #[test]
    fn decodes_dispatch_frame() {
        let msg = decode_payload(
            br#"{"op":0,"s":42,"t":"GUILD_CREATE","d":{"id":"123","name":"guild"}}"#,
        )
        .unwrap();
        assert_eq!(msg.op, GatewayOp::Dispatch);
        assert_eq!(msg.sequence, Some(42));
        assert_eq!(msg.event_type.as_deref(), Some("GUILD_CREATE"));
        assert_eq!(msg.data["name"], "guild");
    }

    #[test]
    fn decodes_hello_frame() {
        let msg = decode_payload(br#"{"op":10,"d":{"heartbeat_interval":41250}}"#).unwrap();
        assert_eq!(msg.op, GatewayOp::Hello);
        let hello: Hello = serde_json::from_value(msg.data).unwrap();
        assert_eq!(hello.heartbeat_interval, 41250);
    }

    #[test]
    fn inflates_zlib_frames() {
        let body = br#"{"op":11,"d":null}"#;
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(body).unwrap();
        let compressed = encoder.finish().unwrap();

        let inflated = inflate(&compressed).unwrap();
        assert_eq!(inflated, body);

        let msg = decode_payload(&inflated).unwrap();
        assert_eq!(msg.op, GatewayOp::HeartbeatAck);
    }

    #[test]
    fn inflate_rejects_garbage() {
        assert!(inflate(&[0x00, 0x01, 0x02]).is_err());
    }

    #[test]
    fn snowflakes_accept_both_encodings() {
        #[derive(serde::Deserialize)]
        struct Wrapper {
            #[serde(with = "snowflake")]
            id: u64,
        }

        let text: Wrapper = serde_json::from_str(r#"{"id":"81238123"}"#).unwrap();
        assert_eq!(text.id, 81238123);

        let number: Wrapper = serde_json::from_str(r#"{"id":81238123}"#).unwrap();
        assert_eq!(number.id, 81238123);
    }
}
