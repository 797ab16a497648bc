//! Wire protocol shared between the chatrelay server and its clients.
//!
//! Every frame on the connection is one JSON object carrying a `type` tag.
//! Clients send [`ClientCommand`]s, the relay answers with [`ServerEvent`]s.

mod commands;
mod events;
mod messages;

pub use commands::{ClientCommand, parse_command};
pub use events::ServerEvent;
pub use messages::{Message, Role, SessionSnapshot};
