//! Access token lifecycle
//!
//! [`TokenManager`] owns the run's [`Credential`]. Reads are shared; refreshes
//! are serialized so that many workers hitting an expired or rejected token
//! cause a single round trip to the token endpoint.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use super::consent::ConsentProvider;
use super::exchange::{TokenExchange, TokenResponse};
use crate::error::AuthError;
use crate::remote::RetryPolicy;

/// Client registration and provider endpoints for the OAuth2 flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub scope: String,
    /// Extra query parameters for the authorization URL
    pub extra_auth_params: Vec<(String, String)>,
}

impl OAuthConfig {
    /// Build the URL the user visits to grant consent
    pub fn authorization_url(&self, redirect_uri: &str, state: &str) -> Result<String, AuthError> {
        let mut params: Vec<(&str, &str)> = vec![
            ("client_id", self.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", self.scope.as_str()),
            ("state", state),
        ];
        params.extend(
            self.extra_auth_params
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );

        url::Url::parse_with_params(&self.auth_url, &params)
            .map(String::from)
            .map_err(|e| AuthError::Consent(format!("Invalid authorization URL: {}", e)))
    }
}

/// OAuth2 access and refresh tokens held for the duration of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// `None` when the provider did not report a lifetime
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Build a credential from a token endpoint response
    ///
    /// Providers may omit the refresh token on refresh; the previous one is
    /// kept in that case.
    pub fn from_response(response: TokenResponse, previous_refresh: Option<String>) -> Self {
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(previous_refresh),
            expires_at: response.expires_in.and_then(expiry_after),
        }
    }

    /// Whether the token is still usable `margin` from `now`
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > now + margin,
            None => true,
        }
    }
}

/// Absolute expiry for a lifetime in seconds; `None` if it is out of range
fn expiry_after(secs: u64) -> Option<DateTime<Utc>> {
    let lifetime = i64::try_from(secs).ok().and_then(chrono::Duration::try_seconds)?;
    Utc::now().checked_add_signed(lifetime)
}

/// Acquires, caches and refreshes the bearer token for a run
pub struct TokenManager {
    config: OAuthConfig,
    exchange: Box<dyn TokenExchange>,
    consent: Box<dyn ConsentProvider>,
    credential: RwLock<Option<Credential>>,
    refresh_lock: Mutex<()>,
    refreshes: AtomicUsize,
    margin: chrono::Duration,
    retry: RetryPolicy,
}

impl TokenManager {
    /// Refresh tokens this close to expiry
    const EXPIRY_MARGIN_SECS: i64 = 60;

    pub fn new(
        config: OAuthConfig,
        exchange: Box<dyn TokenExchange>,
        consent: Box<dyn ConsentProvider>,
    ) -> Self {
        Self {
            config,
            exchange,
            consent,
            credential: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            refreshes: AtomicUsize::new(0),
            margin: chrono::Duration::seconds(Self::EXPIRY_MARGIN_SECS),
            retry: RetryPolicy::default(),
        }
    }

    /// Policy for retrying a refresh while the token endpoint is unavailable
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Start from an existing credential instead of asking for consent
    pub fn with_credential(self, credential: Credential) -> Self {
        *self.credential.write().unwrap_or_else(PoisonError::into_inner) = Some(credential);
        self
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Obtain a usable credential
    ///
    /// Reuses a fresh credential, refreshes a stale one that carries a
    /// refresh token, and otherwise runs the authorization code flow.
    pub fn authorize(&self) -> Result<Credential, AuthError> {
        let _guard = self.refresh_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(current) = self.current() {
            if current.is_fresh(Utc::now(), self.margin) {
                debug!("Reusing existing access token");
                return Ok(current);
            }
            if current.refresh_token.is_some() {
                match self.refresh_locked() {
                    Ok(_) => return self.current().ok_or(AuthError::NotAuthorized),
                    Err(e) => info!("Stored refresh token unusable, re-authorizing: {}", e),
                }
            }
        }

        let code = self.consent.request_code(&self.config)?;
        let response = self
            .exchange
            .exchange_code(&self.config, &code.code, &code.redirect_uri)?;
        let credential = Credential::from_response(response, None);
        if credential.refresh_token.is_none() {
            info!("Token response carried no refresh token; the run cannot outlive this token");
        }

        self.store(credential.clone());
        Ok(credential)
    }

    /// Return an access token that is not about to expire
    pub fn get_valid_token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.fresh_token() {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have refreshed while we waited
        if let Some(token) = self.fresh_token() {
            return Ok(token);
        }
        self.refresh_locked()
    }

    /// Refresh after the server rejected `rejected_token` with a 401
    ///
    /// If another caller already replaced that token, the replacement is
    /// returned without contacting the token endpoint again.
    pub fn refresh_after_unauthorized(&self, rejected_token: &str) -> Result<String, AuthError> {
        let _guard = self.refresh_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.current() {
            Some(current) if current.access_token != rejected_token => Ok(current.access_token),
            Some(_) => self.refresh_locked(),
            None => Err(AuthError::NotAuthorized),
        }
    }

    /// Number of refresh grants performed so far
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn current(&self) -> Option<Credential> {
        self.credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn fresh_token(&self) -> Option<String> {
        let guard = self.credential.read().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .filter(|c| c.is_fresh(Utc::now(), self.margin))
            .map(|c| c.access_token.clone())
    }

    fn store(&self, credential: Credential) {
        *self.credential.write().unwrap_or_else(PoisonError::into_inner) = Some(credential);
    }

    /// Perform a refresh grant; callers must hold `refresh_lock`
    fn refresh_locked(&self) -> Result<String, AuthError> {
        let refresh_token = self
            .current()
            .ok_or(AuthError::NotAuthorized)?
            .refresh_token
            .ok_or(AuthError::MissingRefreshToken)?;

        debug!("Refreshing access token");
        let response = self.request_refresh(&refresh_token)?;
        self.refreshes.fetch_add(1, Ordering::SeqCst);

        let credential = Credential::from_response(response, Some(refresh_token));
        let token = credential.access_token.clone();
        self.store(credential);
        info!("Access token refreshed");
        Ok(token)
    }

    /// Run the refresh grant, retrying while the endpoint is unavailable
    ///
    /// Callers hold `refresh_lock`, so waiting workers see one refresh.
    fn request_refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        let mut retries = 0;
        loop {
            match self.exchange.refresh(&self.config, refresh_token) {
                Err(AuthError::TokenEndpointUnavailable(reason))
                    if retries < self.retry.max_retries =>
                {
                    retries += 1;
                    warn!(
                        "Token endpoint unavailable, retrying ({}/{}): {}",
                        retries, self.retry.max_retries, reason
                    );
                    self.retry.pause(retries, None);
                }
                result => return result,
            }
        }
    }
}
