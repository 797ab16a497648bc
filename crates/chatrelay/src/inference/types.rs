//! Inference backend request/response types.

use async_trait::async_trait;
use bytes::Bytes;
use chatrelay_protocol::{Message, Role};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::error::InferenceResult;

/// Role of a turn sent to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

/// One `{role, content}` entry of the model prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::System,
            content: content.into(),
        }
    }

    /// Convert a stored message. Tool rows have no prompt representation.
    pub fn from_message(message: &Message) -> Option<Self> {
        let role = match message.role {
            Role::User => TurnRole::User,
            Role::Assistant => TurnRole::Assistant,
            Role::Tool => return None,
        };
        Some(Self {
            role,
            content: message.content.clone(),
        })
    }
}

/// Body of an inference call.
#[derive(Debug, Clone, Serialize)]
pub struct InferenceRequest {
    pub messages: Vec<ChatTurn>,
    pub stream: bool,
}

/// Raw response bytes of a streaming call.
pub type ByteStream = BoxStream<'static, InferenceResult<Bytes>>;

/// What the backend returned, resolved once per call.
pub enum InferenceOutput {
    /// The whole reply at once.
    Text(String),
    /// SSE-style frames, to be decoded incrementally.
    Stream(ByteStream),
}

impl std::fmt::Debug for InferenceOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Longest accepted model identifier.
pub const MAX_MODEL_ID_LEN: usize = 256;

/// Whether `model` is safe to place in a request path.
///
/// Identifiers are `/`-separated segments of `[A-Za-z0-9@._:-]`; empty,
/// `.` and `..` segments are rejected.
pub fn is_valid_model_id(model: &str) -> bool {
    if model.is_empty() || model.len() > MAX_MODEL_ID_LEN {
        return false;
    }
    model.split('/').all(|segment| {
        !segment.is_empty()
            && segment != "."
            && segment != ".."
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | ':' | '-'))
    })
}

/// A hosted model runner.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn run(&self, model: &str, request: InferenceRequest)
    -> InferenceResult<InferenceOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let request = InferenceRequest {
            messages: vec![
                ChatTurn::system("be brief"),
                ChatTurn::from_message(&Message::new(Role::User, "hello", 1)).unwrap(),
            ],
            stream: true,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hello"}
                ],
                "stream": true
            })
        );
    }

    #[test]
    fn test_model_id_validation() {
        for model in ["@cf/meta/llama-3.1-8b-instruct", "X", "org/model:v2", "a_b"] {
            assert!(is_valid_model_id(model), "{model} should be valid");
        }
        for model in [
            "",
            "../../admin",
            "@cf/../x",
            "./x",
            "/leading",
            "trailing/",
            "a//b",
            "x?y",
            "x#frag",
            "x y",
            "%2e%2e",
        ] {
            assert!(!is_valid_model_id(model), "{model:?} should be rejected");
        }
        assert!(!is_valid_model_id(&"m".repeat(MAX_MODEL_ID_LEN + 1)));
    }

    #[test]
    fn test_tool_messages_are_not_prompted() {
        assert!(ChatTurn::from_message(&Message::new(Role::Tool, "{}", 1)).is_none());
    }
}
