//! Message envelope shared by every connection variant.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error code synthesized when a request can never reach a live backend:
/// the stub connection answers every request with it, and the router fails
/// pending requests with it when the transport drops.
pub const CONNECTION_LOST_ERROR_CODE: i64 = -32001;

/// The protocol message envelope.
///
/// Requests carry `id` + `method`, events carry `method` only, and responses
/// carry `id` with either `result` or `error`. `sessionId` addresses the
/// message to one of the flattened sessions multiplexed on the connection;
/// its absence means the root session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Message {
    /// Builds a request envelope. An empty session id is omitted from the
    /// wire, which addresses the root session.
    pub fn request(id: u64, method: &str, params: Value, session_id: &str) -> Self {
        Self {
            id: Some(id),
            method: Some(method.to_string()),
            params,
            session_id: (!session_id.is_empty()).then(|| session_id.to_string()),
            result: None,
            error: None,
        }
    }

    /// Builds an error response echoing the given request id.
    pub fn error_response(id: u64, code: i64, message: &str) -> Self {
        Self {
            id: Some(id),
            error: Some(ErrorObject {
                code,
                message: message.to_string(),
                data: None,
            }),
            ..Self::default()
        }
    }

    /// True if this envelope is a response to a previously issued request.
    pub fn is_response(&self) -> bool {
        self.id.is_some() && self.method.is_none()
    }
}

/// Error payload of a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Sibling envelope used when the host delivers one message in pieces.
///
/// `messageSize` is present on the first chunk only and announces the total
/// length of the reassembled message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageChunk {
    #[serde(rename = "messageChunk")]
    pub message_chunk: String,
    #[serde(rename = "messageSize", default, skip_serializing_if = "Option::is_none")]
    pub message_size: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_omits_empty_session_id() {
        let raw = serde_json::to_string(&Message::request(
            1,
            "Target.setAutoAttach",
            serde_json::json!({"autoAttach": true}),
            "",
        ))
        .unwrap();
        assert!(!raw.contains("sessionId"));
        assert!(raw.contains("\"id\":1"));

        let raw = serde_json::to_string(&Message::request(2, "DOM.enable", Value::Null, "s1"))
            .unwrap();
        assert!(raw.contains("\"sessionId\":\"s1\""));
        assert!(!raw.contains("params"));
    }

    #[test]
    fn response_classification() {
        let response: Message = serde_json::from_str(r#"{"id": 4, "result": {}}"#).unwrap();
        assert!(response.is_response());

        let event: Message =
            serde_json::from_str(r#"{"method": "Target.targetCreated", "params": {}}"#).unwrap();
        assert!(!event.is_response());
        assert_eq!(event.method.as_deref(), Some("Target.targetCreated"));
    }

    #[test]
    fn error_response_echoes_id_and_code() {
        let raw =
            serde_json::to_string(&Message::error_response(9, CONNECTION_LOST_ERROR_CODE, "gone"))
                .unwrap();
        let parsed: Message = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.id, Some(9));
        let error = parsed.error.unwrap();
        assert_eq!(error.code, CONNECTION_LOST_ERROR_CODE);
        assert_eq!(error.message, "gone");
    }

    #[test]
    fn chunk_envelope_field_names() {
        let chunk: MessageChunk =
            serde_json::from_str(r#"{"messageChunk": "abc", "messageSize": 6}"#).unwrap();
        assert_eq!(chunk.message_chunk, "abc");
        assert_eq!(chunk.message_size, Some(6));

        let continuation: MessageChunk =
            serde_json::from_str(r#"{"messageChunk": "def"}"#).unwrap();
        assert_eq!(continuation.message_size, None);
    }
}
