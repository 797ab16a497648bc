//! Streaming response pipeline: prompt in, text increments out.

use chatrelay_protocol::Message;
use futures::StreamExt;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::inference::{
    ChatTurn, FrameDecoder, InferenceBackend, InferenceError, InferenceOutput, InferenceRequest,
    InferenceResult,
};

/// Reply recorded when generation produced no text at all.
pub const STREAM_ERROR_PLACEHOLDER: &str = "[stream error]";

/// System instruction followed by the given history, oldest first.
pub fn build_turns(system_prompt: &str, history: &[&Message]) -> Vec<ChatTurn> {
    std::iter::once(ChatTurn::system(system_prompt))
        .chain(history.iter().filter_map(|m| ChatTurn::from_message(m)))
        .collect()
}

/// Run the model and forward every increment to `on_delta` as it arrives.
///
/// Never fails: a backend error keeps whatever text was already produced,
/// and an empty result is replaced by [`STREAM_ERROR_PLACEHOLDER`], which is
/// then also passed to `on_delta`. The returned text always equals the
/// concatenation of all increments.
///
/// Waiting longer than `idle_timeout` for the response, or for any later
/// chunk of a stream, ends generation as a stream error.
pub async fn generate_reply<F>(
    backend: &dyn InferenceBackend,
    model: &str,
    turns: Vec<ChatTurn>,
    idle_timeout: Duration,
    mut on_delta: F,
) -> String
where
    F: FnMut(&str) + Send,
{
    let mut full = String::new();

    if let Err(e) = relay_output(backend, model, turns, idle_timeout, &mut full, &mut on_delta).await
    {
        warn!(model, error = %e, accumulated = full.len(), "generation failed");
    }

    if full.is_empty() {
        full.push_str(STREAM_ERROR_PLACEHOLDER);
        on_delta(&full);
    }

    full
}

async fn relay_output<F>(
    backend: &dyn InferenceBackend,
    model: &str,
    turns: Vec<ChatTurn>,
    idle_timeout: Duration,
    full: &mut String,
    on_delta: &mut F,
) -> InferenceResult<()>
where
    F: FnMut(&str) + Send,
{
    let request = InferenceRequest {
        messages: turns,
        stream: true,
    };

    let output = timeout(idle_timeout, backend.run(model, request))
        .await
        .map_err(|_| stalled(idle_timeout))??;

    match output {
        InferenceOutput::Text(text) => {
            debug!(model, len = text.len(), "backend returned complete text");
            if !text.is_empty() {
                on_delta(&text);
                full.push_str(&text);
            }
        }
        InferenceOutput::Stream(mut stream) => {
            let mut decoder = FrameDecoder::new();
            while let Some(chunk) = timeout(idle_timeout, stream.next())
                .await
                .map_err(|_| stalled(idle_timeout))?
            {
                for increment in decoder.push(&chunk?) {
                    on_delta(&increment);
                    full.push_str(&increment);
                }
            }
            for increment in decoder.finish() {
                on_delta(&increment);
                full.push_str(&increment);
            }
        }
    }

    Ok(())
}

fn stalled(idle_timeout: Duration) -> InferenceError {
    InferenceError::Stream(format!("no data from backend for {idle_timeout:?}"))
}
