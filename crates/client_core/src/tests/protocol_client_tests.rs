use super::*;

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use shared::domain::MessageId;
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct ServerState {
    requests: Arc<Mutex<Vec<(String, Option<String>, Value)>>>,
}

impl ServerState {
    fn record(&self, route: &str, headers: &HeaderMap, body: Value) {
        let authorization = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        self.requests
            .lock()
            .push((route.to_string(), authorization, body));
    }
}

async fn handle_login(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    state.record("login", &headers, body.clone());
    if body["password"] == "hunter2" {
        (StatusCode::OK, Json(json!({ "token": "issued-token" })))
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "code": 40001, "message": "invalid credentials" })),
        )
    }
}

async fn handle_logout(State(state): State<ServerState>, headers: HeaderMap) -> StatusCode {
    state.record("logout", &headers, Value::Null);
    StatusCode::NO_CONTENT
}

async fn handle_gateway(State(state): State<ServerState>, headers: HeaderMap) -> Json<Value> {
    state.record("gateway", &headers, Value::Null);
    Json(json!({ "url": "wss://gateway.test/?v=3" }))
}

async fn handle_send_message(
    State(state): State<ServerState>,
    Path(channel_id): Path<u64>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> axum::response::Response {
    state.record("send", &headers, body.clone());
    if channel_id == 404 {
        return (StatusCode::NOT_FOUND, "no such channel").into_response();
    }
    Json(json!({
        "id": "555",
        "channel_id": channel_id.to_string(),
        "author": { "id": "42", "username": "local" },
        "content": body["content"],
        "nonce": body.get("nonce").cloned().unwrap_or(Value::Null),
    }))
    .into_response()
}

async fn spawn_api_server() -> (String, ServerState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let state = ServerState::default();
    let app = Router::new()
        .route("/api/auth/login", post(handle_login))
        .route("/api/auth/logout", post(handle_logout))
        .route("/api/gateway", get(handle_gateway))
        .route("/api/channels/:id/messages", post(handle_send_message))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/api/"), state)
}

#[tokio::test]
async fn login_returns_issued_token() {
    let (api_url, state) = spawn_api_server().await;
    let client = HttpProtocolClient::new(api_url);

    let token = client
        .login("ferris@example.com", "hunter2")
        .await
        .expect("login");

    assert_eq!(token, "issued-token");
    let requests = state.requests.lock();
    assert_eq!(requests[0].0, "login");
    assert_eq!(requests[0].2["email"], "ferris@example.com");
}

#[tokio::test]
async fn rejected_login_surfaces_api_error() {
    let (api_url, _state) = spawn_api_server().await;
    let client = HttpProtocolClient::new(api_url);

    let err = client
        .login("ferris@example.com", "wrong")
        .await
        .expect_err("must fail");

    let api_error = err.downcast_ref::<ApiException>().expect("api exception");
    assert_eq!(api_error.status, 401);
    assert_eq!(api_error.code, 40001);
    assert_eq!(api_error.message, "invalid credentials");
}

#[tokio::test]
async fn token_is_sent_once_set_and_dropped_when_cleared() {
    let (api_url, state) = spawn_api_server().await;
    let client = HttpProtocolClient::new(api_url);

    client.gateway_url().await.expect("anonymous lookup");
    client.set_token(Some("secret".to_string()));
    let url = client.gateway_url().await.expect("gateway url");
    client.logout().await.expect("logout");
    client.set_token(None);
    client.gateway_url().await.expect("anonymous lookup");

    assert_eq!(url, "wss://gateway.test/?v=3");
    let authorizations: Vec<Option<String>> = state
        .requests
        .lock()
        .iter()
        .map(|(_, authorization, _)| authorization.clone())
        .collect();
    assert_eq!(
        authorizations,
        vec![
            None,
            Some("secret".to_string()),
            Some("secret".to_string()),
            None
        ]
    );
}

#[tokio::test]
async fn send_message_carries_nonce_as_string() {
    let (api_url, state) = spawn_api_server().await;
    let client = HttpProtocolClient::new(api_url);
    client.set_token(Some("secret".to_string()));

    let confirmed = client
        .send_message(ChannelId(120), "hello", Some(77))
        .await
        .expect("send");

    assert_eq!(confirmed.id, MessageId(555));
    assert_eq!(confirmed.channel_id, ChannelId(120));
    assert_eq!(confirmed.nonce_value(), Some(77));
    let requests = state.requests.lock();
    assert_eq!(requests[0].2, json!({ "content": "hello", "nonce": "77" }));
}

#[tokio::test]
async fn send_message_without_nonce_omits_field() {
    let (api_url, state) = spawn_api_server().await;
    let client = HttpProtocolClient::new(api_url);

    let confirmed = client
        .send_message(ChannelId(120), "direct", None)
        .await
        .expect("send");

    assert_eq!(confirmed.nonce_value(), None);
    assert_eq!(state.requests.lock()[0].2, json!({ "content": "direct" }));
}

#[tokio::test]
async fn plain_text_error_body_becomes_api_message() {
    let (api_url, _state) = spawn_api_server().await;
    let client = HttpProtocolClient::new(api_url);

    let err = client
        .send_message(ChannelId(404), "lost", None)
        .await
        .expect_err("must fail");

    let api_error = err.downcast_ref::<ApiException>().expect("api exception");
    assert_eq!(api_error.status, 404);
    assert_eq!(api_error.code, 0);
    assert_eq!(api_error.message, "no such channel");
}
