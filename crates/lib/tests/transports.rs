//! Integration tests: a loopback axum server plays the chat backend so the real HTTP client,
//! chunked reader and websocket adapter are exercised end to end. The server task is left
//! running when each test ends.

use axum::body::Body;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parley::api::{ApiClient, SessionProbe};
use parley::chat::Chat;
use parley::config::Config;
use parley::message::Status;
use parley::mode::Mode;
use parley::stream::{ReconnectPolicy, SocketStream, StreamEnd, StreamError, TokenTransport};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct Backend {
    /// Chunks of the stream body; `None` answers the stream endpoint with HTTP 500.
    chunks: Option<Vec<&'static str>>,
    /// Text frames sent on each socket connection before closing.
    frames: Vec<&'static str>,
    /// Keep each socket open after its frames until the client closes it.
    hold_open: bool,
    signed_in: bool,
    socket_connects: Arc<AtomicUsize>,
    /// Requests that matched no route.
    misses: Arc<AtomicUsize>,
    /// (thread id, workspace header, body) of each posted message.
    posts: Arc<Mutex<Vec<(String, Option<String>, serde_json::Value)>>>,
}

async fn me(State(b): State<Backend>) -> Response {
    if b.signed_in {
        Json(serde_json::json!({ "id": "u-1", "email": "u1@example.com", "name": "U" }))
            .into_response()
    } else {
        (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "detail": "not signed in" })))
            .into_response()
    }
}

async fn create_thread() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "threadId": "srv-1" }))
}

async fn post_message(
    State(b): State<Backend>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    let workspace = headers
        .get("x-workspace-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    b.posts.lock().unwrap().push((id, workspace, body));
    StatusCode::CREATED
}

async fn stream(State(b): State<Backend>) -> Response {
    match b.chunks {
        Some(chunks) => {
            let parts = futures_util::stream::iter(
                chunks.into_iter().map(Ok::<_, std::io::Error>),
            );
            Body::from_stream(parts).into_response()
        }
        None => (StatusCode::INTERNAL_SERVER_ERROR, "stream unavailable").into_response(),
    }
}

async fn socket(ws: WebSocketUpgrade, State(b): State<Backend>) -> Response {
    b.socket_connects.fetch_add(1, Ordering::SeqCst);
    let frames = b.frames.clone();
    let hold_open = b.hold_open;
    ws.on_upgrade(move |mut socket| async move {
        for f in frames {
            if socket.send(Message::Text(f.to_string())).await.is_err() {
                return;
            }
        }
        if hold_open {
            while let Some(Ok(_)) = socket.recv().await {}
            return;
        }
        let _ = socket.send(Message::Close(None)).await;
    })
}

async fn not_found(State(b): State<Backend>) -> StatusCode {
    b.misses.fetch_add(1, Ordering::SeqCst);
    StatusCode::NOT_FOUND
}

/// Serve the backend on a free loopback port; returns the HTTP base URL.
async fn serve(backend: Backend) -> String {
    let app = Router::new()
        .route("/auth/me", get(me))
        .route("/chat/threads", post(create_thread))
        .route("/chat/threads/:id/messages", post(post_message))
        .route("/chat/threads/:id/stream", get(stream))
        .route("/ws/chat/:id", get(socket))
        .fallback(not_found)
        .with_state(backend);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

fn client(base: &str) -> ApiClient {
    ApiClient::new(base, Some("ws-9"), None, Duration::from_secs(5)).expect("api client")
}

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy::linear(3, Duration::from_millis(5), Duration::from_millis(10))
}

async fn collect(
    transport: &dyn TokenTransport,
    path: &str,
) -> (Result<StreamEnd, StreamError>, Vec<String>) {
    let mut tokens = Vec::new();
    let mut on_token = |t: &str| tokens.push(t.to_string());
    let res = transport
        .stream(path, &mut on_token, &CancellationToken::new())
        .await;
    (res, tokens)
}

#[tokio::test]
async fn chunked_reader_reassembles_frames_split_across_chunks() {
    let base = serve(Backend {
        chunks: Some(vec![
            "data: H",
            "i\n\nda",
            "ta: !\n\nevent: done\n\ndata: ignored\n\n",
        ]),
        ..Backend::default()
    })
    .await;
    let reader = client(&base).chunked_reader();
    let (res, tokens) = collect(&reader, "/chat/threads/t-1/stream").await;
    assert_eq!(res.unwrap(), StreamEnd::Done);
    assert_eq!(tokens, vec!["Hi", "!"]);
}

#[tokio::test]
async fn chunked_reader_rejects_error_status_and_empty_body() {
    let base = serve(Backend::default()).await;
    let reader = client(&base).chunked_reader();
    let (res, tokens) = collect(&reader, "/chat/threads/t-1/stream").await;
    assert!(matches!(res, Err(StreamError::Status(500))));
    assert!(tokens.is_empty());

    let base = serve(Backend {
        chunks: Some(vec![]),
        ..Backend::default()
    })
    .await;
    let reader = client(&base).chunked_reader();
    let (res, _) = collect(&reader, "/chat/threads/t-1/stream").await;
    assert!(matches!(res, Err(StreamError::EmptyBody)));
}

#[tokio::test]
async fn chunked_body_ending_without_done_frame_succeeds() {
    let base = serve(Backend {
        chunks: Some(vec!["data: Hi\n\n", "data: there\n\n"]),
        ..Backend::default()
    })
    .await;
    let reader = client(&base).chunked_reader();
    let (res, tokens) = collect(&reader, "/chat/threads/t-1/stream").await;
    assert_eq!(res.unwrap(), StreamEnd::Done);
    assert_eq!(tokens, vec!["Hi", "there"]);
}

#[tokio::test]
async fn socket_streams_text_frames_until_sentinel() {
    let backend = Backend {
        frames: vec!["A", "B", "__DONE__", "late"],
        ..Backend::default()
    };
    let connects = backend.socket_connects.clone();
    let base = serve(backend).await;
    let ws_base = base.replacen("http://", "ws://", 1);
    let socket = SocketStream::new(ws_base, fast_policy());
    let (res, tokens) = collect(&socket, "/ws/chat/t-1").await;
    assert_eq!(res.unwrap(), StreamEnd::Done);
    assert_eq!(tokens, vec!["A", "B"]);
    assert_eq!(connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn socket_gives_up_after_three_connections() {
    let backend = Backend {
        frames: vec!["x"],
        ..Backend::default()
    };
    let connects = backend.socket_connects.clone();
    let base = serve(backend).await;
    let socket = SocketStream::new(base.replacen("http://", "ws://", 1), fast_policy());
    let (res, tokens) = collect(&socket, "/ws/chat/t-1").await;
    assert!(matches!(res, Err(StreamError::ReconnectLimit(3))));
    assert_eq!(connects.load(Ordering::SeqCst), 3);
    assert_eq!(tokens, vec!["x", "x", "x"]);
}

#[tokio::test]
async fn socket_cancel_closes_without_error_or_reconnect() {
    let backend = Backend {
        frames: vec!["A"],
        hold_open: true,
        ..Backend::default()
    };
    let connects = backend.socket_connects.clone();
    let base = serve(backend).await;
    let socket = SocketStream::new(base.replacen("http://", "ws://", 1), fast_policy());

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        stopper.cancel();
    });
    let mut tokens = Vec::new();
    let mut on_token = |t: &str| tokens.push(t.to_string());
    let res = socket.stream("/ws/chat/t-1", &mut on_token, &cancel).await;
    assert_eq!(res.unwrap(), StreamEnd::Cancelled);
    assert_eq!(tokens, vec!["A"]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn socket_error_is_terminal() {
    let backend = Backend::default();
    let misses = backend.misses.clone();
    let connects = backend.socket_connects.clone();
    let base = serve(backend).await;
    let socket = SocketStream::new(base.replacen("http://", "ws://", 1), fast_policy());

    // A plain 404 instead of an upgrade fails the handshake.
    let (res, tokens) = collect(&socket, "/ws/missing/t-1").await;
    assert!(matches!(res, Err(StreamError::Socket(_))));
    assert!(tokens.is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(misses.load(Ordering::SeqCst), 1);
    assert_eq!(connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn session_probe_maps_unauthorized_to_none() {
    let base = serve(Backend::default()).await;
    let api = client(&base);
    assert_eq!(api.current_user().await.unwrap(), None);
    assert_eq!(Mode::resolve(&api).await, Mode::Guest);

    let base = serve(Backend {
        signed_in: true,
        ..Backend::default()
    })
    .await;
    let api = client(&base);
    let user = api.current_user().await.unwrap().expect("user");
    assert_eq!(user.id, "u-1");
    assert!(!Mode::resolve(&api).await.is_guest());
}

fn temp_config(base: &str) -> (Config, std::path::PathBuf) {
    let dir = std::env::temp_dir().join(format!("parley-e2e-test-{}", uuid::Uuid::new_v4()));
    let mut config = Config::default();
    config.api.base_url = base.to_string();
    config.api.workspace_id = Some("ws-9".to_string());
    (config, dir.join("config.json"))
}

#[tokio::test]
async fn online_send_streams_reply_over_chunked_reader() {
    let backend = Backend {
        signed_in: true,
        chunks: Some(vec!["data: Hi\n\n", "event: done\n\n"]),
        ..Backend::default()
    };
    let posts = backend.posts.clone();
    let connects = backend.socket_connects.clone();
    let base = serve(backend).await;
    let (config, config_path) = temp_config(&base);

    let (chat, _api) = Chat::connect(&config, &config_path, false).await.unwrap();
    assert!(!chat.mode().is_guest());
    chat.send_message(None, "hello", Vec::new())
        .await
        .unwrap()
        .await
        .unwrap();

    let snap = chat.snapshot();
    assert_eq!(snap.thread_id.as_deref(), Some("srv-1"));
    assert_eq!(snap.messages[0].status, Status::Sent);
    assert_eq!(snap.messages[1].content, "Hi");
    assert_eq!(snap.messages[1].status, Status::Sent);
    assert_eq!(connects.load(Ordering::SeqCst), 0);

    let posts = posts.lock().unwrap().clone();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].0, "srv-1");
    assert_eq!(posts[0].1.as_deref(), Some("ws-9"));
    assert_eq!(posts[0].2["content"], "hello");
}

#[tokio::test]
async fn primary_http_error_falls_back_to_socket() {
    let backend = Backend {
        signed_in: true,
        chunks: None,
        frames: vec!["A", "B", "__DONE__"],
        ..Backend::default()
    };
    let connects = backend.socket_connects.clone();
    let base = serve(backend).await;
    let (mut config, config_path) = temp_config(&base);
    config.stream.reconnect.base_delay_ms = 5;
    config.stream.reconnect.max_delay_ms = 10;

    let (chat, _api) = Chat::connect(&config, &config_path, false).await.unwrap();
    chat.send_message(Some("t-7"), "hi", Vec::new())
        .await
        .unwrap()
        .await
        .unwrap();

    let snap = chat.snapshot();
    assert_eq!(snap.messages[1].content, "AB");
    assert_eq!(snap.messages[1].status, Status::Sent);
    assert_eq!(connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn forced_guest_mode_needs_no_backend() {
    let (mut config, config_path) = temp_config("http://127.0.0.1:9");
    config.guest.tick_ms = 1;
    let (chat, _api) = Chat::connect(&config, &config_path, true).await.unwrap();
    assert!(chat.mode().is_guest());
    chat.send_message(None, "hello", Vec::new())
        .await
        .unwrap()
        .await
        .unwrap();
    let snap = chat.snapshot();
    assert!(snap.messages[1].content.contains("hello"));
    assert_eq!(snap.messages[1].status, Status::Sent);
}

#[tokio::test]
async fn default_config_connects_and_derives_socket_base() {
    let dir = std::env::temp_dir().join(format!("parley-e2e-test-{}", uuid::Uuid::new_v4()));
    let mut config = Config::default();
    config.guest.tick_ms = 1;
    assert!(config.api.ws_base.is_none());
    let (chat, _api) = Chat::connect(&config, &dir.join("config.json"), true)
        .await
        .expect("connect with default config");
    assert!(chat.mode().is_guest());
}
