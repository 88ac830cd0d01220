use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use falgate::backend::{BackendArguments, BackendClient, BackendError, FalClient, ANY_LLM_ENDPOINT};
use falgate::credentials::{ClientFactory, CredentialPool};
use falgate::models::{ChatMessage, FinishReason};
use falgate::prompt::SimpleAssembler;
use falgate::ChatEngine;

#[derive(Clone)]
struct UpstreamState {
    requests: Arc<Mutex<Vec<(Option<String>, Value)>>>,
    body: Arc<String>,
}

async fn handle_stream(
    State(state): State<UpstreamState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.requests.lock().unwrap().push((auth.clone(), payload));

    if auth.is_none() {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "No user found for Key ID and Secret"})),
        )
            .into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/event-stream")],
        state.body.as_str().to_string(),
    )
        .into_response()
}

/// Minimal stand-in for `fal.run` serving one canned SSE body.
struct MockFal {
    base_url: String,
    requests: Arc<Mutex<Vec<(Option<String>, Value)>>>,
    join: JoinHandle<()>,
}

impl MockFal {
    async fn start(body: &str) -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = UpstreamState {
            requests: requests.clone(),
            body: Arc::new(body.to_string()),
        };

        let app = Router::new()
            .route("/fal-ai/any-llm/stream", post(handle_stream))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream");
        let addr = listener.local_addr().expect("local addr");
        let base_url = format!("http://{}", addr);

        let join = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("upstream server error");
        });

        Self {
            base_url,
            requests,
            join,
        }
    }

    fn requests(&self) -> Vec<(Option<String>, Value)> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockFal {
    fn drop(&mut self) {
        self.join.abort();
    }
}

fn arguments() -> BackendArguments {
    BackendArguments {
        prompt: "\u{8}Human: hi\n\n".into(),
        system_prompt: "be brief".into(),
        reasoning: false,
        model: "openai/gpt-4o-mini".into(),
    }
}

const HELLO_BODY: &str = concat!(
    "data: {\"output\": \"Hel\", \"partial\": true, \"error\": null}\n\n",
    ": keep-alive\n\n",
    "data: {\"output\": \"Hello\", \"partial\": true, \"error\": null}\n\n",
    "data: {\"output\": \"Hello world\", \"partial\": false, \"error\": null}\n\n",
);

#[tokio::test]
async fn fal_client_posts_arguments_with_key_header() {
    let upstream = MockFal::start(HELLO_BODY).await;
    let client = FalClient::new(reqwest::Client::new(), &upstream.base_url, Some("abc".into()));

    let events: Vec<_> = client
        .stream(ANY_LLM_ENDPOINT, &arguments())
        .await
        .expect("stream opens")
        .collect()
        .await;

    let outputs: Vec<String> = events
        .into_iter()
        .map(|e| e.expect("event").output.unwrap_or_default())
        .collect();
    assert_eq!(outputs, vec!["Hel", "Hello", "Hello world"]);

    let requests = upstream.requests();
    assert_eq!(requests.len(), 1);
    let (auth, payload) = &requests[0];
    assert_eq!(auth.as_deref(), Some("Key abc"));
    assert_eq!(payload["prompt"], "\u{8}Human: hi\n\n");
    assert_eq!(payload["system_prompt"], "be brief");
    assert_eq!(payload["reasoning"], false);
    assert_eq!(payload["model"], "openai/gpt-4o-mini");
}

#[tokio::test]
async fn missing_key_is_rejected_with_detail() {
    let upstream = MockFal::start(HELLO_BODY).await;
    let client = FalClient::new(reqwest::Client::new(), &upstream.base_url, None);

    let err = match client.stream(ANY_LLM_ENDPOINT, &arguments()).await {
        Ok(_) => panic!("anonymous call should be rejected"),
        Err(err) => err,
    };
    assert_eq!(
        err,
        BackendError::Rejected {
            status: 401,
            message: "No user found for Key ID and Secret".into(),
        }
    );
}

#[tokio::test]
async fn unreachable_host_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let client = FalClient::new(reqwest::Client::new(), &format!("http://{addr}"), Some("k".into()));
    match client.stream(ANY_LLM_ENDPOINT, &arguments()).await {
        Err(BackendError::Transport(_)) => {}
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("connection should fail"),
    }
}

fn fal_engine(base_url: &str, keys: &str) -> ChatEngine {
    let http = reqwest::Client::new();
    let base_url = base_url.to_string();
    let factory: ClientFactory = Arc::new(move |key: Option<&str>| {
        Arc::new(FalClient::new(http.clone(), &base_url, key.map(str::to_string)))
            as Arc<dyn BackendClient>
    });
    ChatEngine::new(
        Arc::new(CredentialPool::from_list(keys, factory)),
        Arc::new(SimpleAssembler),
    )
}

#[tokio::test]
async fn engine_turns_fal_stream_into_completion() {
    let upstream = MockFal::start(HELLO_BODY).await;
    let engine = fal_engine(&upstream.base_url, "k1,k2");
    let messages = vec![
        ChatMessage::new("system", "be brief"),
        ChatMessage::new("user", "hi"),
    ];

    let chunks: Vec<_> = engine
        .send_message(messages.clone(), None, "openai/gpt-4o-mini", None)
        .collect()
        .await;
    let deltas: Vec<&str> = chunks.iter().map(|c| c.content()).collect();
    assert_eq!(deltas, vec!["Hel", "lo", " world", ""]);
    assert_eq!(chunks.last().unwrap().finish_reason(), Some(FinishReason::Stop));

    let completion = engine
        .send_message_sync(messages, None, "openai/gpt-4o-mini", None)
        .await;
    assert_eq!(completion.content(), "Hello world");
    assert_eq!(completion.finish_reason(), Some(FinishReason::Stop));

    let keys: Vec<Option<String>> = upstream.requests().into_iter().map(|(a, _)| a).collect();
    assert_eq!(keys, vec![Some("Key k1".into()), Some("Key k2".into())]);
}

#[tokio::test]
async fn backend_error_event_ends_stream_with_error_chunk() {
    let body = concat!(
        "data: {\"output\": \"Partial\"}\n\n",
        "data: {\"output\": \"Partial\", \"error\": \"model overloaded\"}\n\n",
        "data: {\"output\": \"Partial answer\"}\n\n",
    );
    let upstream = MockFal::start(body).await;
    let engine = fal_engine(&upstream.base_url, "k1");

    let chunks: Vec<_> = engine
        .send_message(vec![ChatMessage::new("user", "hi")], None, "openai/gpt-4o", None)
        .collect()
        .await;
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].content(), "Partial");
    assert_eq!(chunks[1].content(), "ERROR: model overloaded");
    assert_eq!(chunks[1].finish_reason(), Some(FinishReason::Error));
}
