//! HTTP inference client.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::error::{InferenceError, InferenceResult};
use super::types::{InferenceBackend, InferenceOutput, InferenceRequest, is_valid_model_id};

const EVENT_STREAM_MIME: &str = "text/event-stream";

/// Connection settings for [`HttpInferenceClient`].
#[derive(Debug, Clone)]
pub struct InferenceClientConfig {
    /// Base URL; models are run at `{base_url}/ai/run/{model}`.
    pub base_url: String,
    /// Bearer token, if the backend requires one.
    pub api_token: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for InferenceClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8787".to_string(),
            api_token: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// JSON body of a non-streaming reply. Accepts both the enveloped
/// `{"result": {"response": ..}}` form and a bare `{"response": ..}`.
#[derive(Debug, Deserialize)]
struct RunResponse {
    #[serde(default)]
    result: Option<RunResult>,
    #[serde(default)]
    response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunResult {
    #[serde(default)]
    response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorEntry>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEntry {
    message: String,
}

/// Client for a hosted model runner speaking JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpInferenceClient {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpInferenceClient {
    pub fn new(config: InferenceClientConfig) -> InferenceResult<Self> {
        // No overall timeout: streamed replies can legitimately run long.
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn run_url(&self, model: &str) -> InferenceResult<String> {
        if !is_valid_model_id(model) {
            return Err(InferenceError::InvalidModel(model.to_string()));
        }
        Ok(format!("{}/ai/run/{}", self.base_url, model))
    }

    /// Resolve a successful response into text or a byte stream.
    async fn into_output(response: Response) -> InferenceResult<InferenceOutput> {
        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with(EVENT_STREAM_MIME));

        if is_stream {
            let stream = response
                .bytes_stream()
                .map_err(InferenceError::from)
                .boxed();
            return Ok(InferenceOutput::Stream(stream));
        }

        let body = response.text().await?;
        match serde_json::from_str::<RunResponse>(&body) {
            Ok(parsed) => parsed
                .result
                .and_then(|r| r.response)
                .or(parsed.response)
                .map(InferenceOutput::Text)
                .ok_or_else(|| {
                    InferenceError::ParseError("response body has no `response` text".to_string())
                }),
            Err(_) => Ok(InferenceOutput::Text(body)),
        }
    }

    async fn error_from(response: Response) -> InferenceError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) => parsed
                .errors
                .into_iter()
                .map(|e| e.message)
                .next()
                .or(parsed.error)
                .unwrap_or(body),
            Err(_) => body,
        };
        InferenceError::Api { status, message }
    }
}

#[async_trait]
impl InferenceBackend for HttpInferenceClient {
    async fn run(
        &self,
        model: &str,
        request: InferenceRequest,
    ) -> InferenceResult<InferenceOutput> {
        let url = self.run_url(model)?;
        debug!(model, turns = request.messages.len(), stream = request.stream, "running model");

        let mut builder = self.client.post(&url).json(&request);
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() {
                InferenceError::ConnectionFailed {
                    url: url.clone(),
                    message: e.to_string(),
                }
            } else {
                InferenceError::RequestFailed(e)
            }
        })?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        Self::into_output(response).await
    }
}
