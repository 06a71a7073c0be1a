//! HTTP surface of the EnvKit backend.
//!
//! Browser-facing procedures take the signed-in user's id as a parameter; the
//! identity provider in front of the web app owns that session. Routes under
//! `/api/cli` that a paired CLI calls with its bearer token go through
//! [`CliAuth`].
use crate::bridge::{self, AuthorizeRequest};
use crate::errors::EnvkitError;
use crate::settings::Settings;
use crate::storage::{self, NewUser, NewVariable, Stage, VariableFilter};
use axum::body::Body;
use axum::extract::{FromRequest, FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use miette::IntoDiagnostic;
use sea_orm::DatabaseConnection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: DatabaseConnection,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(settings: Settings, db: DatabaseConnection) -> Result<Self, EnvkitError> {
        let http = bridge::client(&settings.bridge)?;
        Ok(Self {
            settings: Arc::new(settings),
            db,
            http,
        })
    }
}

/// `Json` whose rejections answer with the usual `{ "error": .. }` body.
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = EnvkitError;

    async fn from_request(
        req: axum::extract::Request,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(JsonBody(value))
    }
}

// Security headers middleware
async fn security_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    // Tokens travel in response bodies
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    response
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Users
        .route("/api/users", post(create_user))
        .route("/api/users/by-auth/{auth_id}", get(get_user_by_auth_id))
        .route("/api/users/{user_id}/projects", get(list_projects))
        .route("/api/users/{user_id}/devices", get(list_user_devices))
        // Projects and variables
        .route("/api/projects", post(create_project))
        .route("/api/projects/{id}", get(get_project))
        .route(
            "/api/projects/{id}/variables",
            get(list_variables).post(create_variable),
        )
        // Devices
        .route("/api/devices", post(register_device))
        .route("/api/devices/{device_id}", get(get_device))
        // CLI pairing
        .route("/api/cli/sessions", post(init_session))
        .route("/api/cli/sessions/complete", post(complete_auth))
        .route("/api/cli/sessions/{id}", get(session_status))
        .route("/api/cli/sessions/{id}/revoke", post(revoke_session))
        .route("/api/cli/devices/{device_id}/session", get(session_by_device))
        .route("/api/cli/tokens/validate", post(validate_token))
        .route("/api/cli/authorize", post(authorize_cli))
        // Bearer-authenticated CLI endpoints
        .route("/api/cli/me", get(cli_me))
        .route("/api/cli/projects", get(cli_projects))
        .route("/api/cli/projects/{id}/variables", get(cli_variables))
        .route("/api/cli/logout", post(cli_logout))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(settings: Settings, db: DatabaseConnection) -> miette::Result<()> {
    let state = AppState::new(settings, db)?;

    let addr: SocketAddr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    )
    .parse()
    .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    let public_url = state.settings.base_url();
    let app = router(state);

    tracing::info!(%addr, %public_url, "EnvKit API listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .into_diagnostic()?;
    axum::serve(listener, app).await.into_diagnostic()?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// Users

async fn create_user(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<NewUser>,
) -> Result<Json<Value>, EnvkitError> {
    let user_id = storage::create_user(&state.db, input).await?;
    Ok(Json(json!({ "userId": user_id })))
}

async fn get_user_by_auth_id(
    State(state): State<AppState>,
    Path(auth_id): Path<String>,
) -> Result<Json<Option<storage::User>>, EnvkitError> {
    Ok(Json(storage::get_user_by_auth_id(&state.db, &auth_id).await?))
}

// Projects

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateProjectRequest {
    name: String,
    user_id: String,
}

async fn create_project(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<CreateProjectRequest>,
) -> Result<Json<storage::Project>, EnvkitError> {
    let project = storage::create_project(&state.db, &req.name, &req.user_id).await?;
    Ok(Json(project))
}

async fn list_projects(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<storage::Project>>, EnvkitError> {
    Ok(Json(storage::list_projects(&state.db, &user_id).await?))
}

async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<storage::ProjectWithVariables>, EnvkitError> {
    Ok(Json(storage::get_vars_and_project(&state.db, &id).await?))
}

// Variables

#[derive(Debug, Default, Deserialize)]
struct VariablesQuery {
    stage: Option<Stage>,
    branch: Option<String>,
}

impl From<VariablesQuery> for VariableFilter {
    fn from(q: VariablesQuery) -> Self {
        VariableFilter {
            stage: q.stage,
            branch: q.branch.filter(|b| !b.is_empty()),
        }
    }
}

async fn list_variables(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<VariablesQuery>,
) -> Result<Json<Vec<storage::Variable>>, EnvkitError> {
    let project = storage::get_project(&state.db, &id)
        .await?
        .ok_or_else(|| EnvkitError::NotFound("project doesn't exist".to_string()))?;
    let vars = storage::list_variables(&state.db, &project.id, &query.into()).await?;
    Ok(Json(vars))
}

async fn create_variable(
    State(state): State<AppState>,
    Path(id): Path<String>,
    JsonBody(input): JsonBody<NewVariable>,
) -> Result<Json<storage::Variable>, EnvkitError> {
    Ok(Json(storage::create_variable(&state.db, &id, input).await?))
}

// Devices

async fn register_device(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<storage::DeviceRegistration>,
) -> Result<Json<storage::RegisteredDevice>, EnvkitError> {
    Ok(Json(storage::register_device(&state.db, input).await?))
}

async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<Option<storage::Device>>, EnvkitError> {
    Ok(Json(storage::get_device(&state.db, &device_id).await?))
}

async fn list_user_devices(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<storage::DeviceWithSession>>, EnvkitError> {
    Ok(Json(storage::list_user_devices(&state.db, &user_id).await?))
}

// CLI pairing

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitSessionRequest {
    device_id: String,
    user_agent: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitSessionResponse {
    session_id: String,
    device_id: String,
}

async fn init_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(req): JsonBody<InitSessionRequest>,
) -> Result<Json<InitSessionResponse>, EnvkitError> {
    let user_agent = req.user_agent.or_else(|| {
        headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });

    let session = storage::init_session(
        &state.db,
        &req.device_id,
        user_agent,
        state.settings.pairing.pending_ttl_secs,
    )
    .await?;

    Ok(Json(InitSessionResponse {
        session_id: session.id,
        device_id: session.device_id,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteAuthRequest {
    device_id: String,
    user_id: String,
    session_id: Option<String>,
}

async fn complete_auth(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<CompleteAuthRequest>,
) -> Result<Json<storage::CompletedAuth>, EnvkitError> {
    let completed = storage::complete_auth(
        &state.db,
        &req.device_id,
        &req.user_id,
        req.session_id.as_deref(),
        state.settings.pairing.session_ttl_secs,
    )
    .await?;
    Ok(Json(completed))
}

async fn session_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<storage::SessionPoll>, EnvkitError> {
    Ok(Json(storage::get_session_status(&state.db, &id).await?))
}

async fn session_by_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<storage::SessionPoll>, EnvkitError> {
    Ok(Json(
        storage::get_session_by_device(&state.db, &device_id).await?,
    ))
}

async fn revoke_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, EnvkitError> {
    storage::revoke_session(&state.db, &id).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
struct ValidateTokenRequest {
    token: String,
}

async fn validate_token(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<ValidateTokenRequest>,
) -> Result<Json<storage::TokenValidation>, EnvkitError> {
    Ok(Json(storage::validate_token(&state.db, &req.token).await?))
}

async fn authorize_cli(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<AuthorizeRequest>,
) -> Result<Json<Value>, EnvkitError> {
    bridge::authorize_cli(&state.http, &state.settings.bridge, &req).await?;
    Ok(Json(json!({ "success": true })))
}

// Bearer-authenticated CLI endpoints

/// Identity of a paired CLI, taken from `Authorization: Bearer <token>`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CliAuth {
    pub user_id: String,
    pub device_id: String,
    pub session_id: String,
}

impl FromRequestParts<AppState> for CliAuth {
    type Rejection = EnvkitError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or_else(|| EnvkitError::Unauthorized("Missing bearer token".to_string()))?;

        let validation = storage::validate_token(&state.db, token).await?;
        match validation {
            storage::TokenValidation {
                valid: true,
                user_id: Some(user_id),
                device_id: Some(device_id),
                session_id: Some(session_id),
                ..
            } => Ok(CliAuth {
                user_id,
                device_id,
                session_id,
            }),
            storage::TokenValidation {
                reason: Some(reason),
                ..
            } if reason == "expired" => Err(EnvkitError::Unauthorized("Session expired".to_string())),
            _ => Err(EnvkitError::Unauthorized("Invalid token".to_string())),
        }
    }
}

async fn cli_me(auth: CliAuth) -> Json<CliAuth> {
    Json(auth)
}

async fn cli_projects(
    State(state): State<AppState>,
    auth: CliAuth,
) -> Result<Json<Vec<storage::Project>>, EnvkitError> {
    Ok(Json(storage::list_projects(&state.db, &auth.user_id).await?))
}

async fn cli_variables(
    State(state): State<AppState>,
    auth: CliAuth,
    Path(id): Path<String>,
    Query(query): Query<VariablesQuery>,
) -> Result<Json<Vec<storage::Variable>>, EnvkitError> {
    let project = storage::get_project(&state.db, &id)
        .await?
        .ok_or_else(|| EnvkitError::NotFound("project doesn't exist".to_string()))?;

    if project.owner_id != auth.user_id {
        tracing::warn!(project_id = %project.id, user_id = %auth.user_id, "CLI asked for a foreign project");
        return Err(EnvkitError::Forbidden(
            "You do not have access to this project".to_string(),
        ));
    }

    let vars = storage::list_variables(&state.db, &project.id, &query.into()).await?;
    Ok(Json(vars))
}

async fn cli_logout(
    State(state): State<AppState>,
    auth: CliAuth,
) -> Result<Json<Value>, EnvkitError> {
    storage::revoke_session(&state.db, &auth.session_id).await?;
    Ok(Json(json!({ "success": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_security_headers_are_set() {
        use tower::ServiceExt;

        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(middleware::from_fn(security_headers));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), "no-store");
    }

    #[test]
    fn test_variables_query_drops_empty_branch() {
        let filter: VariableFilter = VariablesQuery {
            stage: Some(Stage::Staging),
            branch: Some(String::new()),
        }
        .into();

        assert_eq!(filter.stage, Some(Stage::Staging));
        assert!(filter.branch.is_none());
    }
}
