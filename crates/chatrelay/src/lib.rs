//! Real-time chat session relay.
//!
//! Clients connect over WebSocket to a session id, receive the session's
//! persisted conversation, and send chat commands whose replies are streamed
//! back from a hosted language-model backend as incremental deltas.

pub mod api;
pub mod config;
pub mod db;
pub mod inference;
pub mod relay;
pub mod session;
pub mod store;
pub mod ws;
