use std::sync::Arc;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use chat_relay::client::{
    ChatMessage, ChatSession, ClientError, ExchangeMode, ExchangeOutcome, HttpRelayClient,
    SessionState,
};
use chat_relay::config::{AppConfig, ClientConfig, UpstreamConfig};
use chat_relay::relay::UpstreamConnector;
use chat_relay::server;
use chat_relay::state::AppState;
use chat_relay::stream::FailureReason;
use futures_util::stream;
use serde_json::{json, Value};

const STREAM_CHUNKS: &[&[u8]] = &[
    b"data: {\"model\":\"gpt-4o-mini-2024-07-18\",\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
    b"data: {\"choices\":[{\"delta\":{\"content\":\"Bonjour \"}}]}\n\nda",
    b"ta: {\"choices\":[{\"delta\":{\"content\":\"le monde \\u00e9t\xc3",
    b"\xa9 \"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"\xf0\x9f",
    b"\x98\x80\"}}]}\n\n",
    b"data: [DONE]\n\n",
];

const FULL_TEXT: &str = "Bonjour le monde \u{e9}t\u{e9} \u{1f600}";

fn mock_upstream() -> Router {
    Router::new().route(
        "/v1/chat/completions",
        post(|Json(body): Json<Value>| async move {
            if body["stream"] == json!(false) {
                return Json(json!({
                    "model": "gpt-4o-mini-2024-07-18",
                    "choices": [{"message": {"role": "assistant", "content": FULL_TEXT}}]
                }))
                .into_response();
            }
            let chunks = STREAM_CHUNKS
                .iter()
                .map(|chunk| Ok::<_, std::io::Error>(Bytes::from_static(*chunk)));
            Response::builder()
                .header("content-type", "text/event-stream")
                .body(Body::from_stream(stream::iter(chunks)))
                .expect("mock response")
        }),
    )
}

async fn spawn(app: Router) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, handle)
}

async fn spawn_relay(api_url: String) -> (String, tokio::task::JoinHandle<()>) {
    let config = AppConfig {
        upstream: UpstreamConfig {
            api_url,
            default_model: "gpt-4o-mini".to_string(),
            ..UpstreamConfig::default()
        },
        ..AppConfig::default()
    };
    let upstream = UpstreamConnector::new(&config.server, &config.upstream, "k".to_string())
        .expect("build connector");
    let state = Arc::new(AppState::new(config, upstream));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");
    let handle = tokio::spawn(server::serve(listener, state));
    (format!("http://{addr}/api/chat"), handle)
}

fn client_for(relay_url: String) -> HttpRelayClient {
    HttpRelayClient::new(&ClientConfig {
        relay_url,
        ..ClientConfig::default()
    })
    .expect("build relay client")
}

#[tokio::test]
async fn test_stream_and_whole_modes_produce_same_text() {
    let (upstream_addr, upstream) = spawn(mock_upstream()).await;
    let (relay_url, relay) =
        spawn_relay(format!("http://{upstream_addr}/v1/chat/completions")).await;

    let session = ChatSession::new(client_for(relay_url.clone()));
    let mut updates: Vec<String> = Vec::new();
    let mut sink = |message: &ChatMessage| updates.push(message.text.clone());
    let outcome = session.send("salut", &mut sink).await.expect("accepted");
    assert_eq!(outcome, ExchangeOutcome::Replied);
    let streamed = session.messages()[1].clone();
    assert_eq!(streamed.text, FULL_TEXT);
    assert_eq!(streamed.model.as_deref(), Some("gpt-4o-mini"));
    assert!(updates.len() >= 4, "expected incremental updates, got {updates:?}");

    let whole_session = ChatSession::new(client_for(relay_url));
    whole_session.set_mode(ExchangeMode::Whole);
    let mut noop = |_: &ChatMessage| {};
    let outcome = whole_session.send("salut", &mut noop).await.expect("accepted");
    assert_eq!(outcome, ExchangeOutcome::Replied);
    let whole = whole_session.messages()[1].clone();
    assert_eq!(whole.text, streamed.text);
    assert_eq!(whole.model, streamed.model);

    relay.abort();
    upstream.abort();
}

#[tokio::test]
async fn test_upstream_unauthorized_flags_message_failed() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            (
                axum::http::StatusCode::UNAUTHORIZED,
                Json(json!({"error": {"message": "bad key"}})),
            )
        }),
    );
    let (upstream_addr, upstream) = spawn(app).await;
    let (relay_url, relay) =
        spawn_relay(format!("http://{upstream_addr}/v1/chat/completions")).await;

    let session = ChatSession::new(client_for(relay_url));
    let mut noop = |_: &ChatMessage| {};
    let outcome = session.send("hi", &mut noop).await.expect("accepted");
    match outcome {
        ExchangeOutcome::Failed(ClientError::Relay { status, reason, .. }) => {
            assert_eq!(status, 401);
            assert_eq!(reason, FailureReason::Unauthorized);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    let messages = session.messages();
    assert_eq!(messages.len(), 2);
    assert!(messages[1].failed);
    assert!(messages[1].text.contains("Invalid API key"));
    assert_eq!(session.state(), SessionState::Idle);

    relay.abort();
    upstream.abort();
}

#[tokio::test]
async fn test_relay_down_is_transport_failure() {
    let placeholder = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind placeholder");
    let addr = placeholder.local_addr().expect("placeholder addr");
    drop(placeholder);

    let session = ChatSession::new(client_for(format!("http://{addr}/api/chat")));
    let mut noop = |_: &ChatMessage| {};
    let outcome = session.send("hi", &mut noop).await.expect("accepted");
    assert!(matches!(
        outcome,
        ExchangeOutcome::Failed(ClientError::Transport(_))
    ));
    assert!(session.messages()[1].failed);
}
