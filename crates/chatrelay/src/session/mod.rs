//! Session state: the in-memory, write-through mirror of one conversation.
//!
//! The [`SessionStore`](crate::store::SessionStore) is the source of truth.
//! Every mutation writes to the store first and only then updates memory, so
//! a failed write never leaves the mirror ahead of storage.

mod state;

pub use state::{SessionInfo, SessionState, SessionStateManager};
