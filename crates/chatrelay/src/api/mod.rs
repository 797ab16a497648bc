//! HTTP API module.
//!
//! Health and session inspection endpoints, plus the WebSocket route.

mod error;
mod handlers;
mod routes;
mod state;

#[allow(unused_imports)]
pub use error::{ApiError, ApiResult, ErrorResponse};
pub use handlers::{MAX_SESSION_ID_LEN, validate_session_id};
pub use routes::create_router;
pub use state::AppState;
