//! Wire protocol for worker communication.
//!
//! Three envelope kinds cross an endpoint, tagged by `kind` on the wire:
//! calls carry a method name and ordered opaque arguments, success and
//! error envelopes answer a call by id. Ids are unique per channel and
//! monotonically assigned by the caller side; payloads are opaque
//! [`serde_json::Value`]s whose marshaling is not this crate's concern.

use serde::{Deserialize, Serialize};

/// Reserved method name for the construction call.
///
/// The first call every worker context must accept. A worker receiving any
/// other method before a successful constructor call rejects it with an
/// error envelope.
pub const CONSTRUCTOR_METHOD: &str = "constructor";

/// A message crossing the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WireMessage {
    /// Method invocation sent to the worker. Immutable once sent.
    Call {
        /// Call id, unique and monotonically increasing per channel.
        id: u64,
        /// Method name.
        method: String,
        /// Ordered, opaque arguments.
        args: Vec<serde_json::Value>,
    },
    /// Successful response to a call.
    Success {
        /// Id of the call this response answers.
        id: u64,
        /// Opaque result payload.
        result: serde_json::Value,
    },
    /// Failed response to a call.
    Error {
        /// Id of the call this response answers.
        id: u64,
        /// Opaque error payload.
        error: serde_json::Value,
    },
}

impl WireMessage {
    /// The call id carried by this envelope.
    pub fn id(&self) -> u64 {
        match self {
            Self::Call { id, .. } | Self::Success { id, .. } | Self::Error { id, .. } => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_envelope_serialization() {
        let call = WireMessage::Call {
            id: 7,
            method: "add".to_string(),
            args: vec![json!(1.11), json!(2.22)],
        };

        let encoded = serde_json::to_value(&call).unwrap();
        assert_eq!(
            encoded,
            json!({"kind": "call", "id": 7, "method": "add", "args": [1.11, 2.22]})
        );
    }

    #[test]
    fn test_success_envelope_deserialization() {
        let message: WireMessage =
            serde_json::from_str(r#"{"kind": "success", "id": 3, "result": 3.3}"#).unwrap();

        assert_eq!(
            message,
            WireMessage::Success {
                id: 3,
                result: json!(3.3)
            }
        );
    }

    #[test]
    fn test_error_envelope_deserialization() {
        let message: WireMessage =
            serde_json::from_str(r#"{"kind": "error", "id": 4, "error": "no such method"}"#)
                .unwrap();

        assert_eq!(
            message,
            WireMessage::Error {
                id: 4,
                error: json!("no such method")
            }
        );
    }

    #[test]
    fn test_unrecognized_kind_is_a_parse_error() {
        let result = serde_json::from_str::<WireMessage>(r#"{"kind": "ping", "id": 1}"#);
        assert!(result.is_err());
    }
}
