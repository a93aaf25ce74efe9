//! Shared HTTP plumbing for the remote API clients
//!
//! Uses synchronous HTTP (ureq) to be executor-agnostic. Status codes are
//! not treated as transport errors; every response is classified into an
//! [`ApiError`] so callers can decide whether to retry.

use std::time::Duration;

use serde::de::DeserializeOwned;
use ureq::http::Response;
use ureq::{Agent, Body};

use crate::error::ApiError;

/// Upper bound for a single downloaded message (Office 365 allows 150 MB)
const MAX_BODY_BYTES: u64 = 150 * 1024 * 1024;

/// Longest error body excerpt carried in an error message
const ERROR_EXCERPT_LEN: usize = 200;

/// Thin wrapper around a configured ureq agent
#[derive(Clone)]
pub struct HttpClient {
    agent: Agent,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    pub fn new() -> Self {
        let config = Agent::config_builder()
            .http_status_as_error(false)
            .timeout_connect(Some(Duration::from_secs(30)))
            .timeout_recv_response(Some(Duration::from_secs(120)))
            .build();

        Self {
            agent: config.into(),
        }
    }

    /// Send an authenticated GET request and classify non-success statuses
    pub fn get(&self, url: &str, access_token: &str) -> Result<Response<Body>, ApiError> {
        let response = self
            .agent
            .get(url)
            .header("Authorization", &format!("Bearer {}", access_token))
            .call()?;

        ensure_success(response)
    }

    /// GET and deserialize a JSON body
    pub fn get_json<T: DeserializeOwned>(&self, url: &str, access_token: &str) -> Result<T, ApiError> {
        let bytes = self.get_bytes(url, access_token)?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// GET a raw body, allowing bodies up to the size of a large message
    pub fn get_bytes(&self, url: &str, access_token: &str) -> Result<Vec<u8>, ApiError> {
        let mut response = self.get(url, access_token)?;
        let bytes = response
            .body_mut()
            .with_config()
            .limit(MAX_BODY_BYTES)
            .read_to_vec()?;
        Ok(bytes)
    }

    /// POST a form and return the status together with the body text
    ///
    /// Used by the token endpoint, whose error bodies carry the reason a
    /// grant was rejected.
    pub fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<(u16, String), ApiError> {
        let mut response = self.agent.post(url).send_form(form.iter().copied())?;
        let status = response.status().as_u16();
        let body = response.body_mut().read_to_string()?;
        Ok((status, body))
    }
}

/// Pass successful responses through, turn everything else into an error
fn ensure_success(mut response: Response<Body>) -> Result<Response<Body>, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.body_mut().read_to_string().unwrap_or_default();

    Err(classify_status(status.as_u16(), retry_after, &body))
}

/// Map an HTTP status onto the error taxonomy
pub(crate) fn classify_status(status: u16, retry_after: Option<Duration>, body: &str) -> ApiError {
    let message = excerpt(body);
    match status {
        401 => ApiError::Unauthorized,
        403 => ApiError::PermissionDenied(message),
        404 => ApiError::NotFound(message),
        408 | 429 | 500..=599 => ApiError::Transient {
            message: format!("HTTP {}: {}", status, message),
            retry_after,
        },
        _ => ApiError::Request { status, message },
    }
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(ERROR_EXCERPT_LEN) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

impl From<ureq::Error> for ApiError {
    fn from(e: ureq::Error) -> Self {
        match e {
            ureq::Error::StatusCode(status) => classify_status(status, None, ""),
            ureq::Error::Json(e) => ApiError::Decode(e.to_string()),
            ureq::Error::BodyExceedsLimit(limit) => {
                ApiError::Decode(format!("Response body exceeds {} bytes", limit))
            }
            ureq::Error::BadUri(uri) => ApiError::Request {
                status: 0,
                message: format!("Bad URI: {}", uri),
            },
            // Connection, DNS, TLS and timeout problems are worth retrying
            other => ApiError::transient(other.to_string()),
        }
    }
}
