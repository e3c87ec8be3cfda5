//! End-to-end gateway streaming against a local HTTP server.

use std::sync::{Arc, Mutex};

use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use confab::api::{ChatMessage, ChatRequest};
use confab::core::chat_stream::StreamChunk;
use confab::core::gateway::{ChatBackend, Gateway, GatewayError};

const STREAM_BODY: &str = concat!(
    ": keep-alive\n",
    "\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"},\"finish_reason\":null}]}\n",
    "\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"!\"},\"finish_reason\":null}]}\n",
    "\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"\"},\"finish_reason\":\"stop\"}],",
    "\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":2,\"total_tokens\":9}}\n",
    "\n",
    "data: [DONE]\n",
    "\n",
);

const TOOL_CALL_BODY: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",",
    "\"function\":{\"name\":\"echo\",\"arguments\":\"{\\\"te\"}}]},\"finish_reason\":null}]}\n",
    "\n",
    "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,",
    "\"function\":{\"arguments\":\"xt\\\":\\\"foo\\\"}\"}}]},\"finish_reason\":null}]}\n",
    "\n",
    "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n",
    "\n",
    "data: [DONE]\n",
    "\n",
);

struct FakeGateway {
    port: u16,
    seen_auth: Arc<Mutex<Option<String>>>,
}

async fn start_fake_gateway(completions_body: &'static str) -> FakeGateway {
    let seen_auth: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let auth_capture = seen_auth.clone();

    let app = Router::new()
        .route(
            "/v1/chat/completions",
            post(move |headers: axum::http::HeaderMap| {
                let auth_capture = auth_capture.clone();
                async move {
                    if let Some(auth) = headers.get("authorization") {
                        *auth_capture.lock().unwrap() =
                            auth.to_str().ok().map(str::to_string);
                    }
                    (
                        [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
                        completions_body,
                    )
                        .into_response()
                }
            }),
        )
        .route(
            "/v1/models",
            get(|| async {
                (
                    [(axum::http::header::CONTENT_TYPE, "application/json")],
                    r#"{"data":[{"id":"test/alpha"},{"id":"test/beta"}]}"#,
                )
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    FakeGateway { port, seen_auth }
}

fn request() -> ChatRequest {
    ChatRequest {
        model: "test/alpha".to_string(),
        messages: vec![ChatMessage::new("user", "Hello")],
        stream: true,
        tools: None,
    }
}

async fn collect(gateway: &Gateway) -> Vec<StreamChunk> {
    let mut stream = gateway.open_stream(&request()).await.unwrap();
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next_chunk().await {
        chunks.push(chunk.unwrap());
    }
    chunks
}

#[tokio::test]
async fn streams_deltas_and_usage_over_real_http() {
    let fake = start_fake_gateway(STREAM_BODY).await;
    let gateway = Gateway::new(
        format!("http://127.0.0.1:{}/v1", fake.port),
        "sk-test".to_string(),
        Some("https://example.com".to_string()),
        Some("Confab".to_string()),
    );

    let chunks = collect(&gateway).await;
    assert_eq!(
        chunks[0],
        StreamChunk::Content("Hi".to_string()),
    );
    assert_eq!(chunks[1], StreamChunk::Content("!".to_string()));
    match &chunks[2] {
        StreamChunk::Done { usage: Some(usage) } => {
            assert_eq!(usage.input_tokens, 7);
            assert_eq!(usage.output_tokens, 2);
            assert_eq!(usage.total_tokens, 9);
        }
        other => panic!("expected done with usage, got {other:?}"),
    }
    assert_eq!(chunks.len(), 3);

    assert_eq!(
        fake.seen_auth.lock().unwrap().as_deref(),
        Some("Bearer sk-test")
    );
}

#[tokio::test]
async fn assembles_tool_calls_over_real_http() {
    let fake = start_fake_gateway(TOOL_CALL_BODY).await;
    let gateway = Gateway::new(
        format!("http://127.0.0.1:{}/v1", fake.port),
        "sk-test".to_string(),
        None,
        None,
    );

    let chunks = collect(&gateway).await;
    match &chunks[0] {
        StreamChunk::ToolCall(call) => {
            assert_eq!(call.name, "echo");
            assert_eq!(call.arguments, r#"{"text":"foo"}"#);
        }
        other => panic!("expected tool call, got {other:?}"),
    }
    assert!(matches!(chunks[1], StreamChunk::Done { usage: None }));
}

#[tokio::test]
async fn lists_models_from_the_gateway() {
    let fake = start_fake_gateway(STREAM_BODY).await;
    let gateway = Gateway::new(
        format!("http://127.0.0.1:{}/v1", fake.port),
        "sk-test".to_string(),
        None,
        None,
    );

    let models = gateway.list_models().await.unwrap();
    let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["test/alpha", "test/beta"]);
    gateway.probe().await.unwrap();
}

#[tokio::test]
async fn non_success_status_is_a_typed_error() {
    let gateway = Gateway::new(
        "http://127.0.0.1:9/v1".to_string(),
        "sk-test".to_string(),
        None,
        None,
    );
    // Nothing listens on port 9; opening the stream fails as an HTTP error.
    let err = gateway.open_stream(&request()).await.unwrap_err();
    assert!(matches!(err, GatewayError::Http(_)));
}
