//! Commands sent from clients to the relay.

use serde::Deserialize;

/// A command sent by a client over its session connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Append a user turn and generate a reply.
    Chat { text: String },

    /// Truncate the session log.
    Reset,

    /// Switch the model used for subsequent generations.
    Model { model: String },
}

/// Parse one inbound frame.
///
/// Unknown types, missing fields and invalid JSON all yield `None`; callers
/// drop such frames without replying.
pub fn parse_command(raw: &str) -> Option<ClientCommand> {
    serde_json::from_str(raw).ok()
}
