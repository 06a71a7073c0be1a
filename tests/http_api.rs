// Router-level tests for the JSON API and the browser-to-CLI bridge
//
// Requests go through the real axum router with a temporary database. The
// bridge tests stand up a throwaway server on loopback that plays the CLI.

mod helpers;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use envkit::web;
use helpers::{ProjectBuilder, TestDb, UserBuilder};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    bearer: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(v) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

/// Pair `device_id` to `user_id` through the API and return the CLI token
async fn pair(app: &Router, device_id: &str, user_id: &str) -> String {
    let (status, _) = send(
        app,
        "POST",
        "/api/cli/sessions",
        Some(json!({ "deviceId": device_id })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        app,
        "POST",
        "/api/cli/sessions/complete",
        Some(json!({ "deviceId": device_id, "userId": user_id })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health() {
    let test_db = TestDb::new().await;
    let app = web::router(test_db.app_state());

    let (status, body) = send(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

// ============================================================================
// Pairing API
// ============================================================================

#[tokio::test]
async fn test_pairing_over_http() {
    let test_db = TestDb::new().await;
    let app = web::router(test_db.app_state());

    let (status, body) = send(
        &app,
        "POST",
        "/api/cli/sessions",
        Some(json!({ "deviceId": "d1" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deviceId"], "d1");
    let session_id = body["sessionId"].as_str().unwrap().to_string();

    let (_, body) = send(
        &app,
        "GET",
        &format!("/api/cli/sessions/{session_id}"),
        None,
        None,
    )
    .await;
    assert_eq!(body, json!({ "status": "pending" }));

    let (status, completed) = send(
        &app,
        "POST",
        "/api/cli/sessions/complete",
        Some(json!({ "deviceId": "d1", "userId": "u1" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(completed["success"], true);
    assert_eq!(completed["sessionId"], session_id.as_str());

    let (_, body) = send(
        &app,
        "GET",
        &format!("/api/cli/sessions/{session_id}"),
        None,
        None,
    )
    .await;
    assert_eq!(body["status"], "completed");
    assert_eq!(body["userId"], "u1");
    assert_eq!(body["token"], completed["token"]);

    let (_, by_device) = send(&app, "GET", "/api/cli/devices/d1/session", None, None).await;
    assert_eq!(by_device["sessionId"], session_id.as_str());

    let (_, validation) = send(
        &app,
        "POST",
        "/api/cli/tokens/validate",
        Some(json!({ "token": completed["token"] })),
        None,
    )
    .await;
    assert_eq!(validation["valid"], true);
    assert_eq!(validation["deviceId"], "d1");
}

#[tokio::test]
async fn test_malformed_body_gets_json_error() {
    let test_db = TestDb::new().await;
    let app = web::router(test_db.app_state());

    let (status, body) = send(&app, "POST", "/api/cli/sessions", Some(json!({})), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let message = body["error"].as_str().expect("error message is JSON");
    assert!(message.contains("deviceId"));

    let (status, body) = send(
        &app,
        "POST",
        "/api/projects",
        Some(json!({ "name": 42, "userId": "u1" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_complete_without_pending_session_is_not_found() {
    let test_db = TestDb::new().await;
    let app = web::router(test_db.app_state());

    let (status, body) = send(
        &app,
        "POST",
        "/api/cli/sessions/complete",
        Some(json!({ "deviceId": "ghost", "userId": "u1" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "No pending session found for this device");
}

#[tokio::test]
async fn test_unknown_session_and_token() {
    let test_db = TestDb::new().await;
    let app = web::router(test_db.app_state());

    let (status, body) = send(&app, "GET", "/api/cli/sessions/nope", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "not_found" }));

    let (_, body) = send(
        &app,
        "POST",
        "/api/cli/tokens/validate",
        Some(json!({ "token": "nope" })),
        None,
    )
    .await;
    assert_eq!(body, json!({ "valid": false }));

    let (status, body) = send(&app, "POST", "/api/cli/sessions/nope/revoke", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Session not found");
}

// ============================================================================
// Projects, variables and devices
// ============================================================================

#[tokio::test]
async fn test_project_and_variable_endpoints() {
    let test_db = TestDb::new().await;
    let app = web::router(test_db.app_state());

    let (status, user) = send(
        &app,
        "POST",
        "/api/users",
        Some(json!({ "authId": "auth-1", "name": "Ada", "email": "Ada@Example.com" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let user_id = user["userId"].as_str().unwrap().to_string();

    let (_, found) = send(&app, "GET", "/api/users/by-auth/auth-1", None, None).await;
    assert_eq!(found["email"], "ada@example.com");

    let (status, project) = send(
        &app,
        "POST",
        "/api/projects",
        Some(json!({ "name": "api", "userId": user_id })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let project_id = project["id"].as_str().unwrap().to_string();

    let vars_uri = format!("/api/projects/{project_id}/variables");
    let (status, variable) = send(
        &app,
        "POST",
        &vars_uri,
        Some(json!({ "name": "DATABASE_URL", "value": "postgres://db", "stage": "staging" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(variable["stage"], "staging");

    let (status, body) = send(
        &app,
        "POST",
        &vars_uri,
        Some(json!({ "name": "DATABASE_URL", "value": "other" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Variable: DATABASE_URL exists in project: api");

    let (status, _) = send(
        &app,
        "POST",
        &vars_uri,
        Some(json!({ "name": "lower_case", "value": "x" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, listed) = send(&app, "GET", &format!("{vars_uri}?stage=production"), None, None).await;
    assert_eq!(listed, json!([]));

    let (_, full) = send(&app, "GET", &format!("/api/projects/{project_id}"), None, None).await;
    assert_eq!(full["project"]["name"], "api");
    assert_eq!(full["variables"].as_array().unwrap().len(), 1);

    let (_, projects) = send(
        &app,
        "GET",
        &format!("/api/users/{user_id}/projects"),
        None,
        None,
    )
    .await;
    assert_eq!(projects.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_missing_project_is_not_found() {
    let test_db = TestDb::new().await;
    let app = web::router(test_db.app_state());

    let (status, body) = send(&app, "GET", "/api/projects/missing", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "project doesn't exist");

    let (status, _) = send(
        &app,
        "POST",
        "/api/projects/missing/variables",
        Some(json!({ "name": "KEY", "value": "v" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_device_endpoints() {
    let test_db = TestDb::new().await;
    let app = web::router(test_db.app_state());

    let registration = json!({
        "userId": "u1",
        "deviceId": "d1",
        "platform": "darwin",
        "arch": "arm64",
        "username": "ada",
        "runtimeVersion": "v20.11.0",
        "cliVersion": "1.0.0"
    });

    let (status, first) = send(&app, "POST", "/api/devices", Some(registration.clone()), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["updated"], false);

    let (_, second) = send(&app, "POST", "/api/devices", Some(registration), None).await;
    assert_eq!(second["updated"], true);
    assert_eq!(second["deviceId"], first["deviceId"]);

    let (_, device) = send(&app, "GET", "/api/devices/d1", None, None).await;
    assert_eq!(device["platform"], "darwin");

    let (_, missing) = send(&app, "GET", "/api/devices/nope", None, None).await;
    assert_eq!(missing, Value::Null);

    pair(&app, "d1", "u1").await;
    let (_, devices) = send(&app, "GET", "/api/users/u1/devices", None, None).await;
    assert_eq!(devices[0]["deviceId"], "d1");
    assert_eq!(devices[0]["hasActiveSession"], true);
}

// ============================================================================
// Bearer-authenticated CLI endpoints
// ============================================================================

#[tokio::test]
async fn test_cli_endpoints_require_valid_token() {
    let test_db = TestDb::new().await;
    let app = web::router(test_db.app_state());

    let (status, _) = send(&app, "GET", "/api/cli/me", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&app, "GET", "/api/cli/projects", None, Some("bogus")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Invalid token");
}

#[tokio::test]
async fn test_cli_reads_own_projects_only() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let app = web::router(test_db.app_state());

    let ada = UserBuilder::new("auth|ada").create(db).await;
    let bob = UserBuilder::new("auth|bob").create(db).await;
    let mine = ProjectBuilder::new(&ada.id).with_name("mine").create(db).await;
    let theirs = ProjectBuilder::new(&bob.id).with_name("theirs").create(db).await;

    let token = pair(&app, "d1", &ada.id).await;

    let (status, me) = send(&app, "GET", "/api/cli/me", None, Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["userId"], ada.id.as_str());
    assert_eq!(me["deviceId"], "d1");

    let (_, projects) = send(&app, "GET", "/api/cli/projects", None, Some(&token)).await;
    assert_eq!(projects.as_array().unwrap().len(), 1);
    assert_eq!(projects[0]["name"], "mine");

    let (status, _) = send(
        &app,
        "GET",
        &format!("/api/cli/projects/{}/variables", mine.id),
        None,
        Some(&token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        "GET",
        &format!("/api/cli/projects/{}/variables", theirs.id),
        None,
        Some(&token),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_cli_logout_invalidates_token() {
    let test_db = TestDb::new().await;
    let app = web::router(test_db.app_state());

    let token = pair(&app, "d1", "u1").await;

    let (status, body) = send(&app, "POST", "/api/cli/logout", None, Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, _) = send(&app, "GET", "/api/cli/me", None, Some(&token)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// ============================================================================
// Bridge to the local CLI server
// ============================================================================

#[derive(Clone, Default)]
struct FakeCli {
    calls: Arc<Mutex<Vec<(String, String, Option<String>)>>>,
    reject: bool,
    plain_health: bool,
}

async fn fake_health(State(cli): State<FakeCli>) -> Response {
    if cli.plain_health {
        "ready".into_response()
    } else {
        Json(json!({ "status": "waiting" })).into_response()
    }
}

async fn fake_callback(
    State(cli): State<FakeCli>,
    Path((user_id, device_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> StatusCode {
    let agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    cli.calls.lock().unwrap().push((user_id, device_id, agent));
    if cli.reject {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

/// Start a stand-in for the CLI's callback server and return its port
async fn spawn_fake_cli(cli: FakeCli) -> u16 {
    let app = Router::new()
        .route("/auth", get(fake_health))
        .route("/auth/{user_id}/{device_id}", post(fake_callback))
        .with_state(cli);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

#[tokio::test]
async fn test_authorize_cli_success() {
    let test_db = TestDb::new().await;
    let app = web::router(test_db.app_state());

    let cli = FakeCli::default();
    let port = spawn_fake_cli(cli.clone()).await;

    let (status, body) = send(
        &app,
        "POST",
        "/api/cli/authorize",
        Some(json!({
            "userId": "user|1",
            "deviceId": "d 1",
            "port": port,
            "agent": "envkit-cli/1.2.0"
        })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true }));

    let calls = cli.calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![(
            "user|1".to_string(),
            "d 1".to_string(),
            Some("envkit-cli/1.2.0".to_string())
        )]
    );
}

#[tokio::test]
async fn test_authorize_cli_accepts_port_as_string() {
    let test_db = TestDb::new().await;
    let app = web::router(test_db.app_state());

    let cli = FakeCli::default();
    let port = spawn_fake_cli(cli.clone()).await;

    // The browser page forwards the port straight from its query string
    let (status, body) = send(
        &app,
        "POST",
        "/api/cli/authorize",
        Some(json!({ "userId": "u1", "deviceId": "d1", "port": port.to_string() })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true }));
    assert_eq!(cli.calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_authorize_cli_missing_user_with_string_port() {
    let test_db = TestDb::new().await;
    let app = web::router(test_db.app_state());

    let (status, body) = send(
        &app,
        "POST",
        "/api/cli/authorize",
        Some(json!({ "deviceId": "d1", "port": "3001" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "error": "Missing userId or deviceId" }));

    let (status, body) = send(
        &app,
        "POST",
        "/api/cli/authorize",
        Some(json!({ "userId": "u1", "deviceId": "d1", "port": "abc" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "error": "Missing port" }));
}

#[tokio::test]
async fn test_authorize_cli_health_not_json() {
    let test_db = TestDb::new().await;
    let app = web::router(test_db.app_state());

    let cli = FakeCli {
        plain_health: true,
        ..FakeCli::default()
    };
    let port = spawn_fake_cli(cli.clone()).await;

    let (status, body) = send(
        &app,
        "POST",
        "/api/cli/authorize",
        Some(json!({ "userId": "u1", "deviceId": "d1", "port": port })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].is_string());
    // Never reached the callback
    assert!(cli.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_authorize_cli_missing_fields() {
    let test_db = TestDb::new().await;
    let app = web::router(test_db.app_state());

    let (status, body) = send(
        &app,
        "POST",
        "/api/cli/authorize",
        Some(json!({ "deviceId": "d1", "port": 1234 })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "error": "Missing userId or deviceId" }));
}

#[tokio::test]
async fn test_authorize_cli_server_rejects() {
    let test_db = TestDb::new().await;
    let app = web::router(test_db.app_state());

    let port = spawn_fake_cli(FakeCli {
        reject: true,
        ..FakeCli::default()
    })
    .await;

    let (status, body) = send(
        &app,
        "POST",
        "/api/cli/authorize",
        Some(json!({ "userId": "u1", "deviceId": "d1", "port": port })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "CLI server error: Service Unavailable");
}

#[tokio::test]
async fn test_authorize_cli_unreachable() {
    let test_db = TestDb::new().await;
    let app = web::router(test_db.app_state());

    // Grab a free port and release it so nothing is listening there
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let (status, body) = send(
        &app,
        "POST",
        "/api/cli/authorize",
        Some(json!({ "userId": "u1", "deviceId": "d1", "port": port })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].is_string());
}
