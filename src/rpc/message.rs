use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, GENERIC_FAILURE};

pub fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// One self-delimited message on the wire, discriminated by `mode`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Frame {
    #[serde(rename_all = "camelCase")]
    Request {
        #[serde(default)]
        request_id: String,
        method: String,
        #[serde(default = "empty_object")]
        data: Value,
    },

    #[serde(rename_all = "camelCase")]
    Response {
        #[serde(default)]
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "is_false")]
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },

    Notification {
        method: String,
        #[serde(default = "empty_object")]
        data: Value,
    },
}

impl Frame {
    pub fn request(request_id: impl Into<String>, method: impl Into<String>, data: Value) -> Self {
        Frame::Request {
            request_id: request_id.into(),
            method: method.into(),
            data,
        }
    }

    pub fn notification(method: impl Into<String>, data: Value) -> Self {
        Frame::Notification {
            method: method.into(),
            data,
        }
    }

    pub fn success(request_id: impl Into<String>, data: Value) -> Self {
        Frame::Response {
            request_id: request_id.into(),
            data: Some(data),
            is_error: false,
            error_message: None,
        }
    }

    pub fn failure(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Frame::Response {
            request_id: request_id.into(),
            data: None,
            is_error: true,
            error_message: Some(message.into()),
        }
    }

    /// Parses one frame. Malformed JSON, a missing `mode` or an unknown
    /// `mode` yield `None`; such frames are dropped by the channel.
    pub fn decode(text: &str) -> Option<Self> {
        match serde_json::from_str(text) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::debug!(error = %e, raw_message = %text, "Dropping unrecognised frame");
                None
            }
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Outcome carried by a Response frame, from the requester's point of view.
pub(crate) fn response_outcome(
    data: Option<Value>,
    is_error: bool,
    error_message: Option<String>,
) -> std::result::Result<Value, String> {
    if is_error {
        Err(error_message.unwrap_or_else(|| GENERIC_FAILURE.to_string()))
    } else {
        Ok(data.unwrap_or_else(empty_object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let frame = Frame::request("abc", "join", json!({ "displayName": "ada" }));
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "mode": "request",
                "requestId": "abc",
                "method": "join",
                "data": { "displayName": "ada" }
            })
        );
    }

    #[test]
    fn test_error_response_omits_data() {
        let frame = Frame::failure("abc", "invalid peer");
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "mode": "response",
                "requestId": "abc",
                "isError": true,
                "errorMessage": "invalid peer"
            })
        );
    }

    #[test]
    fn test_success_response_omits_error_fields() {
        let value: Value =
            serde_json::from_str(&Frame::success("abc", json!({})).encode().unwrap()).unwrap();
        assert_eq!(value, json!({ "mode": "response", "requestId": "abc", "data": {} }));
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let frame = Frame::decode(r#"{"mode":"notification","method":"resumeConsumer"}"#).unwrap();
        assert_eq!(frame, Frame::notification("resumeConsumer", empty_object()));

        let frame = Frame::decode(r#"{"mode":"response","requestId":"x"}"#).unwrap();
        match frame {
            Frame::Response { data, is_error, error_message, .. } => {
                assert_eq!(response_outcome(data, is_error, error_message), Ok(empty_object()));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_error_without_message_uses_generic_text() {
        assert_eq!(
            response_outcome(None, true, None),
            Err(GENERIC_FAILURE.to_string())
        );
    }

    #[test]
    fn test_unrecognised_frames_are_dropped() {
        assert!(Frame::decode("not json").is_none());
        assert!(Frame::decode(r#"{"method":"join","data":{}}"#).is_none());
        assert!(Frame::decode(r#"{"mode":"broadcast","method":"join"}"#).is_none());
    }
}
