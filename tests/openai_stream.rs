use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use textbridge::translate::openai::OpenAiClient;
use textbridge::translate::{CompletionProvider, CompletionRequest, StreamEvent, TranslateError};

#[derive(Clone, Copy)]
enum Script {
    Stream,
    Stall,
    Truncated,
    SlowError,
    RateLimited,
}

#[derive(Default)]
struct Seen {
    auth: Option<String>,
    body: Option<serde_json::Value>,
}

struct Upstream {
    script: Script,
    seen: Mutex<Seen>,
}

fn delta(content: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({"choices": [{"delta": {"content": content}}]})
    )
}

async fn completions(
    State(upstream): State<Arc<Upstream>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    {
        let mut seen = upstream.seen.lock();
        seen.auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        seen.body = serde_json::from_slice(&body).ok();
    }

    let sse = |body: Body| {
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .body(body)
            .unwrap()
    };

    match upstream.script {
        Script::Stream => {
            let text = format!(
                "{}{}: keep-alive\n\n{}data: [DONE]\n\n",
                delta("Good "),
                delta("evening"),
                delta(".")
            );
            // Cut inside the payload so lines span chunks.
            let bytes = text.into_bytes();
            let (a, b) = bytes.split_at(17);
            let chunks = vec![
                Ok::<_, Infallible>(Bytes::copy_from_slice(a)),
                Ok(Bytes::copy_from_slice(b)),
            ];
            sse(Body::from_stream(stream::iter(chunks)))
        }
        Script::Stall => {
            let first = stream::iter(vec![Ok::<_, Infallible>(Bytes::from(delta("partial")))]);
            sse(Body::from_stream(first.chain(stream::pending())))
        }
        Script::Truncated => {
            let text = format!("{}{}", delta("Good "), delta("eve"));
            sse(Body::from(text))
        }
        Script::SlowError => {
            let body = Body::from_stream(stream::pending::<Result<Bytes, Infallible>>());
            Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(body)
                .unwrap()
        }
        Script::RateLimited => Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .body(Body::from("x".repeat(500)))
            .unwrap(),
    }
}

async fn upstream(script: Script) -> (SocketAddr, Arc<Upstream>) {
    let state = Arc::new(Upstream {
        script,
        seen: Mutex::new(Seen::default()),
    });
    let app = Router::new()
        .route("/v1/chat/completions", post(completions))
        .with_state(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    (addr, state)
}

fn request(addr: SocketAddr) -> CompletionRequest {
    CompletionRequest {
        base_url: format!("http://{addr}/v1/"),
        api_key: "sk-test".into(),
        model: "test-model".into(),
        system_prompt: "Translate to English.".into(),
        user_text: "こんばんは。".into(),
    }
}

#[tokio::test]
async fn streams_deltas_into_the_full_text() {
    let (addr, upstream) = upstream(Script::Stream).await;
    let client = OpenAiClient::new().unwrap();
    let seen_events = Mutex::new(Vec::new());

    let on_event = |event: StreamEvent<'_>| {
        let entry = match event {
            StreamEvent::Accepted => "accepted".to_string(),
            StreamEvent::Delta { accumulated, .. } => accumulated.to_string(),
        };
        seen_events.lock().push(entry);
    };
    let text = client
        .stream(&request(addr), &CancellationToken::new(), &on_event)
        .await
        .unwrap();

    assert_eq!(text, "Good evening.");
    assert_eq!(
        *seen_events.lock(),
        vec!["accepted", "Good ", "Good evening", "Good evening."]
    );

    let seen = upstream.seen.lock();
    assert_eq!(seen.auth.as_deref(), Some("Bearer sk-test"));
    let body = seen.body.as_ref().unwrap();
    assert_eq!(body["model"], "test-model");
    assert_eq!(body["stream"], true);
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["role"], "user");
    assert_eq!(body["messages"][1]["content"], "こんばんは。");
}

#[tokio::test]
async fn error_status_is_reported_with_a_truncated_body() {
    let (addr, _upstream) = upstream(Script::RateLimited).await;
    let client = OpenAiClient::new().unwrap();

    let result = client
        .stream(&request(addr), &CancellationToken::new(), &|_| {})
        .await;
    match result {
        Err(TranslateError::Status { status, body }) => {
            assert_eq!(status, 429);
            assert_eq!(body.chars().count(), 200);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn cancellation_stops_a_stalled_stream() {
    let (addr, _upstream) = upstream(Script::Stall).await;
    let client = OpenAiClient::new().unwrap();
    let cancel = CancellationToken::new();

    let on_event = |event: StreamEvent<'_>| {
        if let StreamEvent::Delta { .. } = event {
            cancel.cancel();
        }
    };
    let result = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        client.stream(&request(addr), &cancel, &on_event),
    )
    .await
    .expect("cancelled stream must return promptly");
    assert!(matches!(result, Err(TranslateError::Cancelled)));
}

#[tokio::test]
async fn unreachable_endpoint_is_an_api_error() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let client = OpenAiClient::new().unwrap();
    let mut req = request(SocketAddr::from(([127, 0, 0, 1], port)));
    req.base_url = format!("http://127.0.0.1:{port}/v1");

    let result = client.stream(&req, &CancellationToken::new(), &|_| {}).await;
    assert!(matches!(result, Err(TranslateError::Api(_))));
}

#[tokio::test]
async fn body_closed_before_done_is_an_error() {
    let (addr, _upstream) = upstream(Script::Truncated).await;
    let client = OpenAiClient::new().unwrap();
    let partial = Mutex::new(String::new());

    let on_event = |event: StreamEvent<'_>| {
        if let StreamEvent::Delta { accumulated, .. } = event {
            *partial.lock() = accumulated.to_string();
        }
    };
    let result = client
        .stream(&request(addr), &CancellationToken::new(), &on_event)
        .await;

    assert!(matches!(result, Err(TranslateError::Api(_))), "{result:?}");
    assert_eq!(*partial.lock(), "Good eve");
}

#[tokio::test]
async fn cancellation_interrupts_a_slow_error_body() {
    let (addr, _upstream) = upstream(Script::SlowError).await;
    let client = OpenAiClient::new().unwrap();
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        canceller.cancel();
    });
    let result = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        client.stream(&request(addr), &cancel, &|_| {}),
    )
    .await
    .expect("error body read must stop on cancellation");
    assert!(matches!(result, Err(TranslateError::Cancelled)));
}
