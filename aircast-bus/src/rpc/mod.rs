//! JSON-RPC over the stream bus.
//!
//! A [`Peer`] sends on its `out` stream and receives on its `in` stream;
//! two peers wire them crosswise. Requests carry correlation IDs matched
//! back to callers; handlers reply synchronously (return value) or
//! asynchronously (via [`Reply`]). A [`Notifier`] is a write-only peer for
//! one-to-many fan-out.

pub mod notifier;
pub mod peer;

pub use notifier::Notifier;
pub use peer::{Peer, Reply};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stream field carrying the serialized envelope.
pub(crate) const PAYLOAD_FIELD: &str = "payload";

/// Wire envelope for RPC traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Envelope {
    Request {
        id: String,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Response {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<RpcError>,
    },
}

/// RPC-level error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL: i64 = -32603;

    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: Self::INVALID_REQUEST,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: Self::METHOD_NOT_FOUND,
            message: format!("Method not found: {method}"),
        }
    }

    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: Self::INVALID_PARAMS,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: Self::INTERNAL,
            message: message.into(),
        }
    }
}

/// Parse request params into a typed structure; serde's required fields
/// are the schema.
pub fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let req = Envelope::Request {
            id: "r1".to_string(),
            method: "createUser".to_string(),
            params: serde_json::json!({"roomId": "room123"}),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["kind"], "request");
        assert_eq!(json["method"], "createUser");

        let resp = Envelope::Response {
            id: "r1".to_string(),
            result: Some(serde_json::json!({"ok": true})),
            error: None,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_parse_params_rejects_missing_fields() {
        #[derive(serde::Deserialize, Debug)]
        struct Params {
            #[allow(dead_code)]
            room_id: String,
        }
        let err = parse_params::<Params>(serde_json::json!({})).unwrap_err();
        assert_eq!(err.code, RpcError::INVALID_PARAMS);
    }
}
