//! HTTP inference client against a local stand-in backend.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::post,
};
use chatrelay::inference::{
    ChatTurn, FrameDecoder, HttpInferenceClient, InferenceBackend, InferenceClientConfig,
    InferenceError, InferenceOutput, InferenceRequest,
};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct Recorded {
    requests: Arc<Mutex<Vec<(String, Option<String>, Value)>>>,
}

async fn run_model(
    State(recorded): State<Recorded>,
    Path(model): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    recorded
        .requests
        .lock()
        .unwrap()
        .push((model.clone(), auth, body));

    match model.as_str() {
        "@cf/test/stream" => (
            [(header::CONTENT_TYPE, "text/event-stream")],
            "data: {\"response\":\"Hi\"}\n\ndata: {\"response\":\" there\"}\n\ndata: [DONE]\n\n",
        )
            .into_response(),
        "@cf/test/json" => Json(json!({ "result": { "response": "whole" }, "success": true }))
            .into_response(),
        "@cf/test/plain" => "just text".into_response(),
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "errors": [{ "message": "no such model" }], "success": false })),
        )
            .into_response(),
    }
}

/// Records requests that land outside the model runner path.
async fn stray(State(recorded): State<Recorded>, headers: HeaderMap, uri: Uri) -> StatusCode {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    recorded
        .requests
        .lock()
        .unwrap()
        .push((uri.to_string(), auth, Value::Null));
    StatusCode::OK
}

async fn start_backend() -> (SocketAddr, Recorded) {
    let recorded = Recorded::default();
    let app = Router::new()
        .route("/ai/run/{*model}", post(run_model))
        .fallback(stray)
        .with_state(recorded.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, recorded)
}

fn client(addr: SocketAddr, token: Option<&str>) -> HttpInferenceClient {
    HttpInferenceClient::new(InferenceClientConfig {
        base_url: format!("http://{addr}/"),
        api_token: token.map(str::to_string),
        ..Default::default()
    })
    .unwrap()
}

fn request() -> InferenceRequest {
    InferenceRequest {
        messages: vec![ChatTurn::system("be brief")],
        stream: true,
    }
}

#[tokio::test]
async fn test_streaming_response_is_decoded() {
    let (addr, recorded) = start_backend().await;
    let output = client(addr, Some("tok"))
        .run("@cf/test/stream", request())
        .await
        .unwrap();

    let InferenceOutput::Stream(mut stream) = output else {
        panic!("expected a stream, got {output:?}");
    };
    let mut decoder = FrameDecoder::new();
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        for increment in decoder.push(&chunk.unwrap()) {
            text.push_str(&increment);
        }
    }
    for increment in decoder.finish() {
        text.push_str(&increment);
    }
    assert_eq!(text, "Hi there");

    let requests = recorded.requests.lock().unwrap();
    let (model, auth, body) = &requests[0];
    assert_eq!(model, "@cf/test/stream");
    assert_eq!(auth.as_deref(), Some("Bearer tok"));
    assert_eq!(body["stream"], true);
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][0]["content"], "be brief");
}

#[tokio::test]
async fn test_json_response_is_text() {
    let (addr, recorded) = start_backend().await;
    let output = client(addr, None)
        .run("@cf/test/json", request())
        .await
        .unwrap();

    assert!(matches!(output, InferenceOutput::Text(ref t) if t == "whole"));
    assert!(recorded.requests.lock().unwrap()[0].1.is_none());
}

#[tokio::test]
async fn test_plain_body_is_raw_text() {
    let (addr, _) = start_backend().await;
    let output = client(addr, None)
        .run("@cf/test/plain", request())
        .await
        .unwrap();

    assert!(matches!(output, InferenceOutput::Text(ref t) if t == "just text"));
}

#[tokio::test]
async fn test_error_status_is_api_error() {
    let (addr, _) = start_backend().await;
    let err = client(addr, None)
        .run("@cf/test/missing", request())
        .await
        .unwrap_err();

    match err {
        InferenceError::Api { status, message } => {
            assert_eq!(status, 400);
            assert_eq!(message, "no such model");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_unreachable_backend_is_connection_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client(addr, None)
        .run("@cf/test/json", request())
        .await
        .unwrap_err();
    assert!(matches!(err, InferenceError::ConnectionFailed { .. }));
}

#[tokio::test]
async fn test_path_escaping_model_is_never_sent() {
    let (addr, recorded) = start_backend().await;
    let client = client(addr, Some("SECRET"));

    for model in ["../../admin/delete?all=1#", "@cf/../../x", "x?y"] {
        let err = client.run(model, request()).await.unwrap_err();
        assert!(
            matches!(err, InferenceError::InvalidModel(ref m) if m == model),
            "unexpected error for {model:?}: {err:?}"
        );
    }
    assert!(recorded.requests.lock().unwrap().is_empty());
}
