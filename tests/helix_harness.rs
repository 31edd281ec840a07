use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use twitchify_sdk::eventsub::SubscriptionStatus;
use twitchify_sdk::helix::{
    HelixClient, HelixClientOptions, HelixError, SubscriptionApi, SubscriptionRequest,
};
use twitchify_sdk::retry::RetryPolicy;

const TEST_CLIENT_ID: &str = "test-client-id";
const TEST_TOKEN: &str = "test-access-token";

#[derive(Clone, Default)]
struct HelixState {
    create_bodies: Arc<Mutex<Vec<Value>>>,
    deleted: Arc<Mutex<Vec<String>>>,
    /// Number of leading create calls answered with 503.
    fail_creates: Arc<AtomicUsize>,
}

fn options() -> HelixClientOptions {
    HelixClientOptions {
        connect_timeout: Duration::from_secs(2),
        attempt_timeout: Duration::from_secs(2),
        retry_policy: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            jitter: Duration::ZERO,
        },
    }
}

async fn start(state: HelixState) -> (HelixClient, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let app = Router::new()
        .route(
            "/helix/eventsub/subscriptions",
            post(create_handler).delete(delete_handler),
        )
        .route("/oauth2/validate", get(validate_handler))
        .with_state(state);
    let (addr, shutdown, task) = spawn_server(app).await;
    let client = HelixClient::with_options(TEST_CLIENT_ID, options())
        .expect("build helix client")
        .with_base_url(format!("http://{addr}/helix"))
        .with_validate_url(format!("http://{addr}/oauth2/validate"));
    (client, shutdown, task)
}

fn token() -> SecretString {
    SecretString::new(TEST_TOKEN.to_string())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_subscription_posts_websocket_transport() {
    let state = HelixState::default();
    let (client, shutdown, task) = start(state.clone()).await;

    let request = SubscriptionRequest::new("channel.follow", "2")
        .condition("broadcaster_user_id", "1337")
        .condition("moderator_user_id", "1337");
    let subscription = client
        .create_subscription(&token(), &request, "S1")
        .await
        .expect("create subscription");

    assert_eq!(subscription.id, "SUB1");
    assert_eq!(subscription.event_type, "channel.follow");
    assert_eq!(subscription.status, SubscriptionStatus::Enabled);
    assert_eq!(subscription.condition, request.condition);

    let bodies = state.create_bodies.lock().expect("lock").clone();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["type"], "channel.follow");
    assert_eq!(bodies[0]["version"], "2");
    assert_eq!(bodies[0]["condition"]["broadcaster_user_id"], "1337");
    assert_eq!(bodies[0]["transport"]["method"], "websocket");
    assert_eq!(bodies[0]["transport"]["session_id"], "S1");

    let _ = shutdown.send(());
    task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_subscription_retries_server_errors() {
    let state = HelixState::default();
    state.fail_creates.store(2, Ordering::SeqCst);
    let (client, shutdown, task) = start(state.clone()).await;

    let subscription = client
        .create_subscription(&token(), &SubscriptionRequest::new("stream.online", "1"), "S1")
        .await
        .expect("third attempt succeeds");
    assert_eq!(subscription.event_type, "stream.online");
    assert_eq!(state.create_bodies.lock().expect("lock").len(), 1);

    let _ = shutdown.send(());
    task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_token_is_unauthorized() {
    let (client, shutdown, task) = start(HelixState::default()).await;

    let err = client
        .create_subscription(
            &SecretString::new("expired".to_string()),
            &SubscriptionRequest::new("channel.follow", "2"),
            "S1",
        )
        .await
        .expect_err("401");
    match err {
        HelixError::Unauthorized { body } => assert_eq!(body, "Unauthorized: Invalid OAuth token"),
        other => panic!("unexpected error: {other:?}"),
    }

    let _ = shutdown.send(());
    task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_subscription_is_idempotent() {
    let state = HelixState::default();
    let (client, shutdown, task) = start(state.clone()).await;

    client
        .delete_subscription(&token(), "SUB1")
        .await
        .expect("first delete");
    client
        .delete_subscription(&token(), "SUB1")
        .await
        .expect("second delete answers 404 and still succeeds");
    assert_eq!(*state.deleted.lock().expect("lock"), vec!["SUB1".to_string()]);

    let _ = shutdown.send(());
    task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn validate_token_reads_identity() {
    let (client, shutdown, task) = start(HelixState::default()).await;

    let validation = client.validate_token(&token()).await.expect("validate");
    assert_eq!(validation.client_id, TEST_CLIENT_ID);
    assert_eq!(validation.login.as_deref(), Some("cool_user"));
    assert_eq!(validation.user_id.as_deref(), Some("1337"));
    assert_eq!(validation.scopes, vec!["moderator:read:followers".to_string()]);
    assert_eq!(validation.expires_in, 3600);

    let err = client
        .validate_token(&SecretString::new("expired".to_string()))
        .await
        .expect_err("invalid token");
    assert!(matches!(err, HelixError::Unauthorized { .. }));

    let _ = shutdown.send(());
    task.abort();
}

fn bearer_ok(headers: &HeaderMap) -> bool {
    let client_id_ok = headers
        .get("client-id")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == TEST_CLIENT_ID);
    let token_ok = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {TEST_TOKEN}"));
    client_id_ok && token_ok
}

fn unauthorized() -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "Unauthorized", "status": 401, "message": "Invalid OAuth token"})),
    )
}

async fn create_handler(
    State(state): State<HelixState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    if !bearer_ok(&headers) {
        return unauthorized();
    }
    if state
        .fail_creates
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
    {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "Service Unavailable", "status": 503, "message": ""})),
        );
    }

    let mut bodies = state.create_bodies.lock().expect("lock");
    bodies.push(body.clone());
    let id = format!("SUB{}", bodies.len());
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "data": [{
                "id": id,
                "status": "enabled",
                "type": body["type"],
                "version": body["version"],
                "condition": body["condition"],
                "created_at": "2024-02-23T21:12:33.771005262Z",
                "transport": body["transport"],
                "cost": 0
            }],
            "total": 1,
            "total_cost": 0,
            "max_total_cost": 10
        })),
    )
}

async fn delete_handler(
    State(state): State<HelixState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !bearer_ok(&headers) {
        return unauthorized().into_response();
    }
    let Some(id) = query.get("id") else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let mut deleted = state.deleted.lock().expect("lock");
    if deleted.contains(id) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Not Found", "status": 404, "message": "subscription not found"})),
        )
            .into_response();
    }
    deleted.push(id.clone());
    StatusCode::NO_CONTENT.into_response()
}

async fn validate_handler(headers: HeaderMap) -> impl IntoResponse {
    let token_ok = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("OAuth {TEST_TOKEN}"));
    if !token_ok {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"status": 401, "message": "invalid access token"})),
        );
    }
    (
        StatusCode::OK,
        Json(json!({
            "client_id": TEST_CLIENT_ID,
            "login": "cool_user",
            "scopes": ["moderator:read:followers"],
            "user_id": "1337",
            "expires_in": 3600
        })),
    )
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
