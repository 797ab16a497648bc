//! Session relay.
//!
//! Each session is served by one relay task that exclusively owns the
//! session's state. Connections talk to it through a [`RelayHandle`]:
//! attaching yields the current snapshot plus a subscription to the
//! session's event stream, and client commands are queued to the task one at
//! a time.
//!
//! ## Phases
//!
//! ```text
//! Hydrating ──attach──▶ Idle ──chat──▶ Generating ──done + persist──▶ Idle
//!                        │ ▲
//!                        └─┘ model / reset
//! ```
//!
//! Replies are generated on a separate task, so attaching and inspecting are
//! answered while Generating. Commands stay serialized: a `chat`, `model` or
//! `reset` received mid-generation waits until the reply has been persisted.
//!
//! A relay with no connections, no queued work and no outstanding handles
//! removes itself from the [`RelayHub`] after [`RelaySettings::idle_timeout`].

mod actor;
mod hub;
mod pipeline;

use chrono::TimeDelta;
use std::time::Duration;

pub use actor::{Attachment, RelayHandle, RelayPhase};
pub use hub::RelayHub;
pub use pipeline::{STREAM_ERROR_PLACEHOLDER, build_turns, generate_reply};

/// Model used until a client picks another one.
pub const DEFAULT_MODEL: &str = "@cf/meta/llama-3.1-8b-instruct";

/// System instruction prepended to every prompt.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful, friendly assistant. Keep responses concise and use markdown when it helps.";

/// Number of past user/assistant messages sent with each prompt.
pub const DEFAULT_HISTORY_WINDOW: usize = 40;

/// Hours added to a session's expiry on every mutation.
pub const DEFAULT_SESSION_TTL_HOURS: i64 = 24;

/// Capacity of each session's event broadcast channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Seconds an unused relay stays in memory.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Seconds a streamed reply may go without producing data.
pub const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 60;

/// Behaviour shared by all relays of a hub.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub default_model: String,
    pub system_prompt: String,
    pub history_window: usize,
    pub session_ttl: TimeDelta,
    pub event_buffer: usize,
    /// How long a relay with no connections waits before shutting down.
    pub idle_timeout: Duration,
    /// Longest wait for the backend's response or its next chunk.
    pub stream_idle_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            history_window: DEFAULT_HISTORY_WINDOW,
            session_ttl: TimeDelta::hours(DEFAULT_SESSION_TTL_HOURS),
            event_buffer: DEFAULT_EVENT_BUFFER,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            stream_idle_timeout: Duration::from_secs(DEFAULT_STREAM_IDLE_TIMEOUT_SECS),
        }
    }
}
