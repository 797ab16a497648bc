//! Conversation data carried inside events.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Author of a conversational turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    /// Reserved for tool output. Stored, but never sent to clients or the model.
    Tool,
}

impl Role {
    /// Whether turns with this role take part in the visible conversation.
    pub fn is_conversational(self) -> bool {
        matches!(self, Self::User | Self::Assistant)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            _ => Err(format!("Unknown message role: {}", s)),
        }
    }
}

/// One immutable turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>, timestamp: i64) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp,
        }
    }
}

/// Session state as delivered in the `ready` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub model: String,
    pub messages: Vec<Message>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip_through_str() {
        for role in [Role::User, Role::Assistant, Role::Tool] {
            assert_eq!(role.to_string().parse::<Role>().unwrap(), role);
        }
        assert!("system".parse::<Role>().is_err());
    }

    #[test]
    fn test_tool_role_is_not_conversational() {
        assert!(Role::User.is_conversational());
        assert!(Role::Assistant.is_conversational());
        assert!(!Role::Tool.is_conversational());
    }

    #[test]
    fn test_message_wire_shape() {
        let msg = Message::new(Role::Assistant, "Hi there", 1_700_000_000_000);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "role": "assistant",
                "content": "Hi there",
                "timestamp": 1_700_000_000_000_i64
            })
        );
    }
}
