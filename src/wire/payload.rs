//! Payload bodies exchanged with the gateway.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{snowflake, GatewayOp};

/// Timestamps attached to an event as it moves through the pipeline,
/// keyed by stage name, in epoch milliseconds.
pub type Trace = BTreeMap<String, i64>;

fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A frame received from the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceivedPayload {
    pub op: GatewayOp,
    #[serde(rename = "s", default)]
    pub sequence: Option<i64>,
    #[serde(rename = "t", default)]
    pub event_type: Option<String>,
    #[serde(rename = "d", default)]
    pub data: Value,
    #[serde(skip)]
    pub trace: Trace,
}

impl ReceivedPayload {
    /// Record the current time against a pipeline stage.
    pub fn add_trace(&mut self, stage: &str) {
        self.trace.insert(stage.to_string(), epoch_ms());
    }

    /// Decode the inner `d` field into a concrete payload body.
    pub fn decode_data<T: serde::de::DeserializeOwned>(
        &self,
    ) -> Result<T, crate::error::GatewayError> {
        serde_json::from_value(self.data.clone()).map_err(crate::error::GatewayError::Payload)
    }
}

/// A frame sent to the gateway.
#[derive(Debug, Serialize)]
pub struct SentPayload<T: Serialize> {
    pub op: GatewayOp,
    #[serde(rename = "d")]
    pub data: T,
}

/// HELLO (op 10) body.
#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    /// Interval between heartbeats, in milliseconds.
    pub heartbeat_interval: u64,
}

/// IDENTIFY (op 2) body.
#[derive(Debug, Serialize)]
pub struct Identify {
    pub token: String,
    pub properties: IdentifyProperties,
    pub compress: bool,
    pub large_threshold: u32,
    pub shard: [u32; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Value>,
    pub guild_subscriptions: bool,
    pub intents: u64,
}

#[derive(Debug, Serialize)]
pub struct IdentifyProperties {
    #[serde(rename = "$os")]
    pub os: String,
    #[serde(rename = "$browser")]
    pub browser: String,
    #[serde(rename = "$device")]
    pub device: String,
}

impl IdentifyProperties {
    pub fn for_daemon() -> Self {
        let agent = concat!("courier-gateway ", env!("CARGO_PKG_VERSION"));
        Self {
            os: std::env::consts::OS.to_string(),
            browser: agent.to_string(),
            device: agent.to_string(),
        }
    }
}

/// RESUME (op 6) body.
#[derive(Debug, Serialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: i64,
}

/// REQUEST_GUILD_MEMBERS (op 8) body. An empty query with limit zero
/// asks for the full roster.
#[derive(Debug, Serialize)]
pub struct RequestGuildMembers {
    #[serde(with = "snowflake")]
    pub guild_id: u64,
    pub query: String,
    pub limit: u32,
}

/// INVALID_SESSION (op 9) carries a bare boolean: whether the session
/// can be resumed.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct InvalidSession(pub bool);

/// The subset of the READY dispatch event the daemon cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub session_id: String,
    #[serde(default)]
    pub user: Option<User>,
}

/// The bot user attached to READY.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(with = "snowflake")]
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub discriminator: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

/// Minimal view of GUILD_MEMBERS_CHUNK, just enough to route the
/// arrival signal; member lists stay opaque.
#[derive(Debug, Clone, Deserialize)]
pub struct MemberChunkRef {
    #[serde(with = "snowflake")]
    pub guild_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_serializes_legacy_property_keys() {
        let identify = Identify {
            token: "token".to_string(),
            properties: IdentifyProperties::for_daemon(),
            compress: false,
            large_threshold: 250,
            shard: [3, 16],
            presence: None,
            guild_subscriptions: true,
            intents: 3,
        };

        let value = serde_json::to_value(SentPayload {
            op: GatewayOp::Identify,
            data: identify,
        })
        .unwrap();

        assert_eq!(value["op"], 2);
        assert_eq!(value["d"]["shard"], serde_json::json!([3, 16]));
        assert!(value["d"]["properties"]["$os"].is_string());
        // No presence key at all when none is configured
        assert!(value["d"].get("presence").is_none());
    }

    #[test]
    fn resume_carries_sequence() {
        let value = serde_json::to_value(SentPayload {
            op: GatewayOp::Resume,
            data: Resume {
                token: "token".to_string(),
                session_id: "S1".to_string(),
                seq: 42,
            },
        })
        .unwrap();

        assert_eq!(value["op"], 6);
        assert_eq!(value["d"]["seq"], 42);
        assert_eq!(value["d"]["session_id"], "S1");
    }

    #[test]
    fn request_guild_members_asks_for_full_roster() {
        let value = serde_json::to_value(RequestGuildMembers {
            guild_id: 1029384756,
            query: String::new(),
            limit: 0,
        })
        .unwrap();

        assert_eq!(value["guild_id"], "1029384756");
        assert_eq!(value["query"], "");
        assert_eq!(value["limit"], 0);
    }

    #[test]
    fn invalid_session_decodes_bare_boolean() {
        let msg = super::super::decode_payload(br#"{"op":9,"d":false}"#).unwrap();
        let InvalidSession(resumable) = msg.decode_data().unwrap();
        assert!(!resumable);
    }

    #[test]
    fn ready_tolerates_extra_fields() {
        let ready: Ready = serde_json::from_str(
            r#"{"v":6,"session_id":"S1","user":{"id":"42","username":"bot"},"guilds":[],"shard":[0,1]}"#,
        )
        .unwrap();
        assert_eq!(ready.session_id, "S1");
        assert_eq!(ready.user.unwrap().id, 42);
    }

    #[test]
    fn trace_stages_accumulate() {
        let mut msg = super::super::decode_payload(br#"{"op":0,"s":1,"t":"X","d":{}}"#).unwrap();
        msg.add_trace("read");
        msg.add_trace("unmarshal");
        assert!(msg.trace.contains_key("read"));
        assert!(msg.trace.contains_key("unmarshal"));
    }
}
