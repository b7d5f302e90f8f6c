//! End-to-end tests for session restoration over HTTP.
//!
//! These tests run the real `HttpTransport` against an in-process mock of
//! the portal API, covering restoration, request gating and token renewal.

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use portal_session::{
    keys, ApiRequest, Config, HistoryNavigator, HttpTransport, LocalStorage, SessionError,
    SessionManager, SessionPhase,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

/// In-memory state of the mock API.
#[derive(Default)]
struct MockApi {
    valid_token: Mutex<String>,
    calls: Mutex<Vec<String>>,
    renew_disabled: AtomicBool,
}

impl MockApi {
    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let expected = format!("Bearer {}", self.valid_token.lock().unwrap());
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == expected)
    }

    /// Invalidates the current token so the next request gets a 401.
    fn expire_token(&self) {
        *self.valid_token.lock().unwrap() = "expired".to_string();
    }
}

type Api = Arc<MockApi>;

async fn direct_login(State(api): State<Api>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    api.record("direct-login");
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if bearer != "Bearer T1" || headers.get("device-id").is_none() {
        return (StatusCode::FORBIDDEN, Json(json!({"message": "bad stored session"})));
    }
    *api.valid_token.lock().unwrap() = "T2".to_string();
    (
        StatusCode::OK,
        Json(json!({
            "user": {
                "_id": "U1",
                "role": {"roleName": "Teacher"},
                "isTimezoneSet": true,
                "isFirstLogin": false,
                "name": "Ada"
            },
            "token": "T2"
        })),
    )
}

async fn sync_device(State(api): State<Api>, Json(body): Json<Value>) -> StatusCode {
    api.record("sync-device");
    if body["deviceId"].is_string() {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    }
}

async fn renew_token(State(api): State<Api>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    api.record("renew-token");
    if api.renew_disabled.load(Ordering::SeqCst) || body["userId"] != "U1" {
        return (StatusCode::FORBIDDEN, Json(json!({"message": "renewal refused"})));
    }
    *api.valid_token.lock().unwrap() = "T3".to_string();
    (StatusCode::OK, Json(json!({"token": "T3"})))
}

async fn classes(State(api): State<Api>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    api.record("classes");
    if !api.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"message": "token expired"})));
    }
    (StatusCode::OK, Json(json!([{"id": 1, "title": "Algebra"}])))
}

async fn logout(State(api): State<Api>) -> StatusCode {
    api.record("logout");
    StatusCode::NO_CONTENT
}

/// Helper to find an available port for testing.
fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Spawns the mock API and returns its base URL.
async fn spawn_mock_api(api: Api) -> (String, tokio::task::JoinHandle<()>) {
    let port = find_available_port();
    let addr = format!("127.0.0.1:{port}");

    let router = Router::new()
        .route("/auth/direct-login", post(direct_login))
        .route("/auth/sync-device", post(sync_device))
        .route("/auth/renew-token", post(renew_token))
        .route("/auth/logout", post(logout))
        .route("/classes", get(classes))
        .layer(TraceLayer::new_for_http())
        .with_state(api);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server failed");
    });

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://{addr}"), handle)
}

fn test_config(base_url: &str) -> Config {
    let mut config = Config {
        api_base_url: base_url.to_string(),
        ..Config::default()
    };
    config.timing.restore_debounce_ms = 50;
    config.timing.settle_delay_ms = 10;
    config.timing.queue_timeout_ms = 5_000;
    config.validate().expect("Test config should be valid");
    config
}

fn stored_session() -> LocalStorage {
    let storage = LocalStorage::in_memory();
    for (key, value) in [
        (keys::TOKEN, "T1"),
        (keys::USER_ID, "U1"),
        (keys::DEVICE_ID, "D1"),
        (keys::IS_LOGGED_IN, "true"),
        (keys::LAST_PATH, "/classes"),
    ] {
        storage.set(key, value).expect("Failed to seed storage");
    }
    storage
}

fn session_manager(config: Config, storage: LocalStorage) -> (SessionManager, HistoryNavigator) {
    let transport = HttpTransport::new(&config).expect("Failed to build transport");
    let navigator = HistoryNavigator::new();
    let manager = SessionManager::new(
        config,
        storage,
        Arc::new(transport),
        Arc::new(navigator.clone()),
    );
    (manager, navigator)
}

/// Waits until the manager reaches a terminal phase.
async fn wait_for_restore(manager: &SessionManager) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !manager.phase().is_terminal() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Restoration did not finish");
}

/// Tests that a request issued before restoration is held, then sent with the
/// rotated token once the session is restored.
#[tokio::test]
async fn test_gated_request_waits_for_restoration() {
    let api = Api::default();
    let (base_url, server) = spawn_mock_api(Arc::clone(&api)).await;
    let storage = stored_session();
    let (manager, navigator) = session_manager(test_config(&base_url), storage.clone());

    manager.mount().expect("Failed to mount");
    let gateway = manager.gateway().clone();
    let early = tokio::spawn(async move { gateway.send(ApiRequest::get("/classes")).await });

    let response = early.await.expect("Task panicked").expect("Request failed");
    assert_eq!(response.status, 200);
    assert_eq!(response.body[0]["title"], "Algebra");

    wait_for_restore(&manager).await;
    assert_eq!(manager.phase(), SessionPhase::Authenticated);
    assert_eq!(manager.current_user().map(|u| u.id).as_deref(), Some("U1"));
    assert_eq!(storage.get(keys::TOKEN).as_deref(), Some("T2"));

    let calls = api.calls();
    assert_eq!(calls[0], "direct-login", "restore goes first: {calls:?}");
    assert_eq!(api.count("classes"), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(navigator.current().as_deref(), Some("/classes"));

    server.abort();
}

/// Tests that an expired token is renewed once and the request re-issued.
#[tokio::test]
async fn test_expired_token_is_renewed() {
    let api = Api::default();
    let (base_url, server) = spawn_mock_api(Arc::clone(&api)).await;
    let storage = stored_session();
    let (manager, _navigator) = session_manager(test_config(&base_url), storage.clone());

    manager.mount().expect("Failed to mount");
    manager.restore_session().await.expect("Restore failed");
    api.expire_token();

    let response = manager
        .gateway()
        .send(ApiRequest::get("/classes"))
        .await
        .expect("Request should recover after renewal");

    assert_eq!(response.status, 200);
    assert_eq!(api.count("renew-token"), 1);
    assert_eq!(api.count("classes"), 2);
    assert_eq!(storage.get(keys::TOKEN).as_deref(), Some("T3"));

    server.abort();
}

/// Tests that a refused renewal sends the user to the login route.
#[tokio::test]
async fn test_refused_renewal_redirects_to_login() {
    let api = Api::default();
    let (base_url, server) = spawn_mock_api(Arc::clone(&api)).await;
    let storage = stored_session();
    let (manager, navigator) = session_manager(test_config(&base_url), storage.clone());

    manager.restore_session().await.expect("Restore failed");
    api.expire_token();
    api.renew_disabled.store(true, Ordering::SeqCst);

    let result = manager.gateway().send(ApiRequest::get("/classes")).await;

    assert!(matches!(result, Err(SessionError::RenewalFailed { .. })));
    assert!(result.is_err_and(|e| e.requires_login()));
    assert_eq!(navigator.current().as_deref(), Some("/login"));
    assert_eq!(storage.get(keys::IS_LOGGED_IN).as_deref(), Some("false"));

    server.abort();
}

/// Tests that a stored session the server rejects ends unauthenticated.
#[tokio::test]
async fn test_rejected_session_clears_storage() {
    let api = Api::default();
    let (base_url, server) = spawn_mock_api(Arc::clone(&api)).await;
    let storage = stored_session();
    storage.set(keys::TOKEN, "stale").expect("Failed to seed token");
    let (manager, navigator) = session_manager(test_config(&base_url), storage.clone());

    let result = manager.restore_session().await;

    assert!(matches!(
        result,
        Err(SessionError::ServerError { status: 403, .. })
    ));
    assert_eq!(manager.phase(), SessionPhase::Unauthenticated);
    assert_eq!(storage.get(keys::TOKEN), None);
    assert_eq!(storage.get(keys::DEVICE_ID).as_deref(), Some("D1"));
    assert_eq!(navigator.current().as_deref(), Some("/login"));

    server.abort();
}

/// Tests that logout reaches the server and the file-backed store survives
/// a restart without the session.
#[tokio::test]
async fn test_logout_persists_to_storage_file() {
    let api = Api::default();
    let (base_url, server) = spawn_mock_api(Arc::clone(&api)).await;
    let path = std::env::temp_dir().join(format!(
        "portal-integration-{}-logout.json",
        std::process::id()
    ));
    std::fs::remove_file(&path).ok();

    let storage = LocalStorage::open(&path).expect("Failed to open storage");
    for (key, value) in [
        (keys::TOKEN, "T1"),
        (keys::USER_ID, "U1"),
        (keys::DEVICE_ID, "D1"),
        (keys::IS_LOGGED_IN, "true"),
    ] {
        storage.set(key, value).expect("Failed to seed storage");
    }
    let (manager, _navigator) = session_manager(test_config(&base_url), storage);

    manager.restore_session().await.expect("Restore failed");
    assert!(manager.logout().await.expect("Logout failed"));
    assert_eq!(api.count("logout"), 1);
    drop(manager);

    let reopened = LocalStorage::open(&path).expect("Failed to reopen storage");
    assert_eq!(reopened.get(keys::TOKEN), None);
    assert_eq!(reopened.get(keys::IS_LOGGED_IN).as_deref(), Some("false"));
    assert_eq!(reopened.get(keys::DEVICE_ID).as_deref(), Some("D1"));

    std::fs::remove_file(&path).ok();
    server.abort();
}
