//! OAuth2 token endpoint access

use log::debug;
use serde::Deserialize;

use super::token::OAuthConfig;
use crate::error::{ApiError, AuthError};
use crate::remote::HttpClient;

/// Token response from the provider
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    pub token_type: Option<String>,
}

impl TokenResponse {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_in: Option<u64>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_in,
            token_type: Some("Bearer".to_string()),
        }
    }
}

/// Error body returned by OAuth2 token endpoints (RFC 6749 section 5.2)
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// The grants a [`super::TokenManager`] needs from a token endpoint
pub trait TokenExchange: Send + Sync {
    /// Exchange an authorization code for tokens
    fn exchange_code(
        &self,
        config: &OAuthConfig,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, AuthError>;

    /// Exchange a refresh token for a new access token
    fn refresh(&self, config: &OAuthConfig, refresh_token: &str) -> Result<TokenResponse, AuthError>;
}

/// Token endpoint client speaking form-encoded HTTP
pub struct HttpTokenExchange {
    http: HttpClient,
}

impl HttpTokenExchange {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    fn post(&self, url: &str, form: &[(&str, &str)]) -> Result<(u16, String), AuthError> {
        self.http.post_form(url, form).map_err(|e| match e {
            ApiError::Transient { message, .. } => AuthError::TokenEndpointUnavailable(message),
            other => AuthError::TokenRequest(other.to_string()),
        })
    }
}

impl TokenExchange for HttpTokenExchange {
    fn exchange_code(
        &self,
        config: &OAuthConfig,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, AuthError> {
        debug!("Exchanging authorization code for tokens");
        let (status, body) = self.post(
            &config.token_url,
            &[
                ("client_id", config.client_id.as_str()),
                ("client_secret", config.client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri),
                ("scope", config.scope.as_str()),
            ],
        )?;

        parse_token_response(status, &body)
            .map_err(|reason| token_error(status, reason, AuthError::TokenRequest))
    }

    fn refresh(&self, config: &OAuthConfig, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        let (status, body) = self.post(
            &config.token_url,
            &[
                ("client_id", config.client_id.as_str()),
                ("client_secret", config.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ],
        )?;

        parse_token_response(status, &body)
            .map_err(|reason| token_error(status, reason, AuthError::RefreshRejected))
    }
}

/// Classify a failed token endpoint reply
///
/// Statuses worth retrying become [`AuthError::TokenEndpointUnavailable`];
/// everything else means the grant itself was refused.
fn token_error(status: u16, reason: String, refused: fn(String) -> AuthError) -> AuthError {
    match status {
        408 | 429 | 500..=599 => AuthError::TokenEndpointUnavailable(reason),
        _ => refused(reason),
    }
}

/// Parse a token endpoint reply, describing failures as text
fn parse_token_response(status: u16, body: &str) -> Result<TokenResponse, String> {
    if (200..300).contains(&status) {
        return serde_json::from_str(body)
            .map_err(|e| format!("Failed to parse token response: {}", e));
    }

    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(err) => Err(match err.error_description {
            Some(description) => format!("{}: {}", err.error, description),
            None => err.error,
        }),
        Err(_) => Err(format!("Token endpoint returned status {}", status)),
    }
}
