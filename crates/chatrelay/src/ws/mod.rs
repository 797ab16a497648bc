//! WebSocket transport for session relays.
//!
//! ```text
//! client ──text frame──▶ parse_command ──▶ RelayHandle::send ──▶ relay task
//! client ◀──text frame── serialize ◀── broadcast::Receiver ◀──── relay task
//! ```
//!
//! The first frame on every connection is `ready`; after that the
//! connection forwards whatever its session relay publishes.

mod handler;

pub use handler::ws_handler;
