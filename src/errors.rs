use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum EnvkitError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(envkit::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(envkit::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(envkit::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(envkit::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("HTTP client error: {0}")]
    #[diagnostic(code(envkit::http))]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    #[diagnostic(code(envkit::bad_request))]
    BadRequest(String),

    #[error("{0}")]
    #[diagnostic(code(envkit::not_found))]
    NotFound(String),

    #[error("{0}")]
    #[diagnostic(code(envkit::conflict))]
    Conflict(String),

    #[error("{0}")]
    #[diagnostic(code(envkit::expired))]
    Expired(String),

    #[error("{0}")]
    #[diagnostic(code(envkit::unauthorized))]
    Unauthorized(String),

    #[error("{0}")]
    #[diagnostic(code(envkit::forbidden))]
    Forbidden(String),

    #[error("{0}")]
    #[diagnostic(code(envkit::other))]
    Other(String),
}

impl EnvkitError {
    pub fn status(&self) -> StatusCode {
        match self {
            EnvkitError::BadRequest(_) => StatusCode::BAD_REQUEST,
            EnvkitError::NotFound(_) => StatusCode::NOT_FOUND,
            EnvkitError::Conflict(_) => StatusCode::CONFLICT,
            EnvkitError::Expired(_) => StatusCode::GONE,
            EnvkitError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            EnvkitError::Forbidden(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JsonRejection> for EnvkitError {
    fn from(rejection: JsonRejection) -> Self {
        EnvkitError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for EnvkitError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
