use axum::{
    extract::{Json, State},
    http::{header, HeaderMap, StatusCode},
    routing::post,
    Router,
};
use serde_json::{json, Value};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::net::TcpListener;

const EMAILS_PATH: &str = "/emails";

#[derive(Clone)]
struct FakeResendState {
    api_key: Arc<str>,
    unavailable: bool,
    received: Arc<Mutex<Vec<Value>>>,
    next_id: Arc<AtomicUsize>,
}

/// A stand-in for the Resend email API, listening on an ephemeral local port.
pub struct FakeResend {
    address: SocketAddr,
    received: Arc<Mutex<Vec<Value>>>,
}

impl FakeResend {
    /// Accepts requests bearing `api_key` and rejects all others.
    pub async fn start(api_key: &str) -> Self {
        Self::serve(api_key, false).await
    }

    /// Answers every request with a server error.
    pub async fn start_unavailable(api_key: &str) -> Self {
        Self::serve(api_key, true).await
    }

    async fn serve(api_key: &str, unavailable: bool) -> Self {
        let state = FakeResendState {
            api_key: api_key.into(),
            unavailable,
            received: Default::default(),
            next_id: Default::default(),
        };
        let received = state.received.clone();
        let app = Router::new()
            .route(EMAILS_PATH, post(send_email))
            .with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { address, received }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.address)
    }

    /// Payloads of all accepted requests, oldest first.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }
}

async fn send_email(
    State(state): State<FakeResendState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if state.unavailable {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "statusCode": 500,
                "name": "internal_server_error",
                "message": "An unexpected error occurred.",
            })),
        );
    }
    let expected = format!("Bearer {}", state.api_key);
    let authorised = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == expected);
    if !authorised {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "statusCode": 401,
                "name": "validation_error",
                "message": "API key is invalid",
            })),
        );
    }
    state.received.lock().unwrap().push(payload);
    let id = state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    (StatusCode::OK, Json(json!({ "id": format!("fake-{id}") })))
}
