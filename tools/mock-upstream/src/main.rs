//! Stand-in for an OpenAI-style chat completions endpoint.
//!
//! Point `upstream.api_url` at `http://127.0.0.1:19001/v1/chat/completions`
//! and pick a behaviour with `MOCK_SCENARIO`.

use std::convert::Infallible;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;

const DEFAULT_UPSTREAM_PORT: u16 = 19_001;
const DEFAULT_CHUNK_DELAY_MS: u64 = 40;

type MockBody = BoxBody<Bytes, std::io::Error>;

#[derive(Copy, Clone)]
enum MockScenario {
    /// Well-formed stream, one event per chunk.
    Text,
    /// Events split mid-token and mid-character.
    Fragmented,
    /// Comment lines, a malformed event, and a repeated `[DONE]`.
    Noisy,
    /// Connection dropped after the first delta.
    Cut,
    Unauthorized,
    Unavailable,
}

impl MockScenario {
    fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Fragmented => "fragmented",
            Self::Noisy => "noisy",
            Self::Cut => "cut",
            Self::Unauthorized => "unauthorized",
            Self::Unavailable => "unavailable",
        }
    }
}

struct MockState {
    scenario: MockScenario,
    chunk_delay: Duration,
    requests: AtomicU64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let port = env_u64("UPSTREAM_PORT", u64::from(DEFAULT_UPSTREAM_PORT));
    let port = u16::try_from(port).unwrap_or(DEFAULT_UPSTREAM_PORT);
    let state = Arc::new(MockState {
        scenario: parse_scenario(),
        chunk_delay: Duration::from_millis(env_u64("MOCK_CHUNK_DELAY_MS", DEFAULT_CHUNK_DELAY_MS)),
        requests: AtomicU64::new(0),
    });

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap_or_else(|err| panic!("failed to bind mock upstream on 127.0.0.1:{port}: {err}"));
    eprintln!(
        "mock upstream on 127.0.0.1:{port} (scenario {})",
        state.scenario.as_str()
    );

    let conn_builder = AutoBuilder::new(TokioExecutor::new());
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                eprintln!("accept error: {err}");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let conn_builder = conn_builder.clone();
        let service_state = Arc::clone(&state);
        let service = service_fn(move |request: Request<Incoming>| {
            let state_ref = Arc::clone(&service_state);
            async move { Ok::<_, Infallible>(handle_request(request, &state_ref).await) }
        });

        tokio::spawn(async move {
            if let Err(err) = conn_builder.serve_connection(io, service).await {
                eprintln!("mock upstream connection error from {remote_addr}: {err}");
            }
        });
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_scenario() -> MockScenario {
    match env::var("MOCK_SCENARIO").as_deref() {
        Ok("fragmented") => MockScenario::Fragmented,
        Ok("noisy") => MockScenario::Noisy,
        Ok("cut") => MockScenario::Cut,
        Ok("unauthorized") => MockScenario::Unauthorized,
        Ok("unavailable") => MockScenario::Unavailable,
        Ok("text") | Err(_) => MockScenario::Text,
        Ok(other) => {
            eprintln!("unknown MOCK_SCENARIO '{other}', fallback to text");
            MockScenario::Text
        }
    }
}

async fn handle_request(request: Request<Incoming>, state: &Arc<MockState>) -> Response<MockBody> {
    let (parts, body) = request.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };

    if parts.method == Method::GET && parts.uri.path() == "/_mock/stats" {
        let body = format!(
            "{{\"scenario\":\"{}\",\"requests\":{}}}",
            state.scenario.as_str(),
            state.requests.load(Ordering::Relaxed)
        );
        return full_response(StatusCode::OK, "application/json", Bytes::from(body));
    }
    if parts.method != Method::POST {
        return full_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "application/json",
            Bytes::from_static(br#"{"error":"method_not_allowed"}"#),
        );
    }
    if !matches!(parts.uri.path(), "/v1/chat/completions" | "/chat/completions") {
        return full_response(
            StatusCode::NOT_FOUND,
            "application/json",
            Bytes::from_static(br#"{"error":"not_found"}"#),
        );
    }
    state.requests.fetch_add(1, Ordering::Relaxed);

    match state.scenario {
        MockScenario::Unauthorized => {
            return full_response(
                StatusCode::UNAUTHORIZED,
                "application/json",
                Bytes::from_static(
                    br#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error"}}"#,
                ),
            );
        }
        MockScenario::Unavailable => {
            return full_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "application/json",
                Bytes::from_static(br#"{"error":{"message":"mock upstream overloaded"}}"#),
            );
        }
        _ => {}
    }

    let request: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
    let model = request
        .get("model")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("mock-model")
        .to_string();
    let wants_stream = request
        .get("stream")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    if !wants_stream {
        let reply = serde_json::json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion",
            "model": model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": REPLY_TEXT},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 6, "total_tokens": 9}
        });
        return full_response(StatusCode::OK, "application/json", Bytes::from(reply.to_string()));
    }

    streaming_response(state.scenario, &model, state.chunk_delay)
}

const REPLY_TEXT: &str = "Bonjour, \u{e9}t\u{e9} \u{1f600}!";

fn delta_event(model: &str, content: &str) -> String {
    let chunk = serde_json::json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion.chunk",
        "model": model,
        "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
    });
    format!("data: {chunk}\n\n")
}

fn stream_chunks(scenario: MockScenario, model: &str) -> Vec<Bytes> {
    let role = format!(
        "data: {{\"id\":\"chatcmpl-mock\",\"model\":\"{model}\",\"choices\":[{{\"index\":0,\"delta\":{{\"role\":\"assistant\"}}}}]}}\n\n"
    );
    let deltas = ["Bonjour, ", "\u{e9}t\u{e9} ", "\u{1f600}!"];
    let mut events: Vec<String> = vec![role];
    events.extend(deltas.iter().map(|text| delta_event(model, text)));

    match scenario {
        MockScenario::Fragmented => {
            // Cut every event into 7-byte pieces so lines and UTF-8 sequences straddle chunks.
            let mut joined = events.concat().into_bytes();
            joined.extend_from_slice(b"data: [DONE]\n\n");
            joined.chunks(7).map(Bytes::copy_from_slice).collect()
        }
        MockScenario::Noisy => {
            let mut chunks = vec![Bytes::from_static(b": keep-alive\n\n")];
            chunks.extend(events.into_iter().map(Bytes::from));
            chunks.insert(2, Bytes::from_static(b"data: {\"choices\":[{\"delta\":\n\n"));
            chunks.push(Bytes::from_static(b"data: [DONE]\n\ndata: [DONE]\n\n"));
            chunks.push(Bytes::from(delta_event(model, "after done")));
            chunks
        }
        MockScenario::Cut => events.into_iter().take(2).map(Bytes::from).collect(),
        _ => {
            let mut chunks: Vec<Bytes> = events.into_iter().map(Bytes::from).collect();
            chunks.push(Bytes::from_static(b"data: [DONE]\n\n"));
            chunks
        }
    }
}

fn streaming_response(scenario: MockScenario, model: &str, delay: Duration) -> Response<MockBody> {
    let chunks = stream_chunks(scenario, model);
    let cut = matches!(scenario, MockScenario::Cut);
    let frames = stream::unfold((chunks.into_iter(), cut), move |(mut chunks, cut)| async move {
        tokio::time::sleep(delay).await;
        match chunks.next() {
            Some(chunk) => Some((Ok(Frame::data(chunk)), (chunks, cut))),
            None if cut => Some((
                Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "mock upstream cut the stream",
                )),
                (chunks, false),
            )),
            None => None,
        }
    });

    let mut response = Response::new(BodyExt::boxed(StreamBody::new(frames)));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn full_response(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<MockBody> {
    let body = Full::new(body).map_err(|never: Infallible| match never {}).boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
