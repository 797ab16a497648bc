//! Events sent from the relay to clients.

use serde::{Deserialize, Serialize};

use crate::messages::SessionSnapshot;

/// Events delivered to every connection attached to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent once per connection after the session has been hydrated.
    Ready { state: SessionSnapshot },

    /// Incremental text of the reply being generated.
    Delta { text: String },

    /// Generation finished; no more deltas follow for this chat.
    Done,

    /// The session log was truncated.
    Cleared,
}
