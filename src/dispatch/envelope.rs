//! Bus envelope.
//!
//! Every event leaves the daemon wrapped in a compact MessagePack
//! envelope so consumers can route on type and identifier without
//! touching the inner payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::wire::{GatewayOp, Trace};

/// The envelope published onto the bus.
#[derive(Debug, Serialize, Deserialize)]
pub struct CourierPayload {
    pub op: GatewayOp,
    pub sequence: i64,
    #[serde(rename = "t")]
    pub event_type: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<Trace>,
    pub metadata: CourierMetadata,
}

/// Identifies which daemon build and manager produced an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierMetadata {
    pub version: String,
    pub identifier: String,
}

impl CourierMetadata {
    pub fn for_manager(identifier: &str) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            identifier: identifier.to_string(),
        }
    }
}

impl CourierPayload {
    /// Serialize with named fields so consumers in any language can
    /// decode without a schema.
    pub fn encode(&self) -> Result<Vec<u8>, GatewayError> {
        rmp_serde::to_vec_named(self).map_err(|source| GatewayError::Encode {
            event_type: self.event_type.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_msgpack() {
        let payload = CourierPayload {
            op: GatewayOp::Dispatch,
            sequence: 42,
            event_type: "GUILD_CREATE".to_string(),
            data: serde_json::json!({"id": "123", "name": "guild"}),
            extra: None,
            trace: None,
            metadata: CourierMetadata::for_manager("courier"),
        };

        let bytes = payload.encode().unwrap();
        let decoded: CourierPayload = rmp_serde::from_slice(&bytes).unwrap();

        assert_eq!(decoded.op, GatewayOp::Dispatch);
        assert_eq!(decoded.sequence, 42);
        assert_eq!(decoded.event_type, "GUILD_CREATE");
        assert_eq!(decoded.data["name"], "guild");
        assert_eq!(decoded.metadata.identifier, "courier");
    }

    #[test]
    fn absent_extras_are_omitted_from_the_wire() {
        let payload = CourierPayload {
            op: GatewayOp::Dispatch,
            sequence: 0,
            event_type: "X".to_string(),
            data: Value::Null,
            extra: None,
            trace: None,
            metadata: CourierMetadata::for_manager("courier"),
        };

        // Named-map encoding without the optional keys
        let bytes = payload.encode().unwrap();
        let value: serde_json::Value = rmp_serde::from_slice(&bytes).unwrap();
        let map = value.as_object().unwrap();
        assert!(map.contains_key("op"));
        assert!(map.contains_key("t"));
        assert!(map.contains_key("metadata"));
        assert!(!map.contains_key("extra"));
        assert!(!map.contains_key("trace"));
    }
}
