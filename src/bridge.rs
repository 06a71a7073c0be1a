//! Hand-off from the signed-in browser to the CLI's local callback server.
//!
//! While pairing, the CLI listens on a loopback port. Once the browser session
//! knows the user, the web app tells that server which user the device belongs
//! to. The CLI then completes the pairing itself.
use crate::errors::EnvkitError;
use crate::settings::Bridge;
use reqwest::header::USER_AGENT;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    /// The browser page takes the port from its query string, so it may
    /// arrive as a JSON string
    #[serde(default, deserialize_with = "port_from_number_or_string")]
    pub port: Option<u16>,
    /// User-Agent of the CLI, forwarded on the callback
    pub agent: Option<String>,
}

/// Unusable ports (non-numeric, out of range) deserialize to `None`.
fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

pub fn client(cfg: &Bridge) -> Result<reqwest::Client, EnvkitError> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.timeout_secs))
        .build()?)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Probe the CLI's `/auth` endpoint, then post the user and device to it.
pub async fn authorize_cli(
    http: &reqwest::Client,
    cfg: &Bridge,
    req: &AuthorizeRequest,
) -> Result<(), EnvkitError> {
    let (user_id, device_id) = match (non_empty(&req.user_id), non_empty(&req.device_id)) {
        (Some(u), Some(d)) => (u, d),
        _ => {
            return Err(EnvkitError::BadRequest(
                "Missing userId or deviceId".to_string(),
            ))
        }
    };
    let port = req
        .port
        .filter(|p| *p != 0)
        .ok_or_else(|| EnvkitError::BadRequest("Missing port".to_string()))?;

    let base = format!("http://{}:{}", cfg.cli_host, port);

    let health = http.get(format!("{base}/auth")).send().await?;
    if !health.status().is_success() {
        return Err(cli_error(health.status()));
    }
    let body: Value = health.json().await?;
    tracing::debug!(port, health = %body, "CLI callback server is up");

    let url = format!(
        "{base}/auth/{}/{}",
        urlencoding::encode(user_id),
        urlencoding::encode(device_id)
    );
    let mut callback = http.post(url);
    if let Some(agent) = non_empty(&req.agent) {
        callback = callback.header(USER_AGENT, agent);
    }

    let resp = callback.send().await?;
    if !resp.status().is_success() {
        tracing::warn!(port, status = %resp.status(), "CLI rejected authorization");
        return Err(cli_error(resp.status()));
    }

    tracing::info!(device_id, user_id, "Authorized CLI device");
    Ok(())
}

fn cli_error(status: reqwest::StatusCode) -> EnvkitError {
    EnvkitError::Other(format!(
        "CLI server error: {}",
        status.canonical_reason().unwrap_or(status.as_str())
    ))
}
