//! Inference backend client.
//!
//! The backend takes a model identifier and a list of role-tagged turns and
//! answers either with a complete text or with a stream of SSE-style frames.
//! [`FrameDecoder`] turns such a stream back into text increments.

mod client;
mod error;
mod frames;
mod types;

pub use client::{HttpInferenceClient, InferenceClientConfig};
pub use error::{InferenceError, InferenceResult};
pub use frames::{FrameDecoder, STREAM_END_SENTINEL};
pub use types::*;
