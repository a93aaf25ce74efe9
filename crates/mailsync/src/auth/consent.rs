//! Interactive user consent for the authorization code grant
//!
//! Uses a local HTTP server to receive the OAuth callback.

use log::{info, warn};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};

use super::token::OAuthConfig;
use crate::error::AuthError;

/// An authorization code together with the redirect URI it was issued for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationCode {
    pub code: String,
    pub redirect_uri: String,
}

/// Obtains an authorization code from the resource owner
pub trait ConsentProvider: Send + Sync {
    fn request_code(&self, config: &OAuthConfig) -> Result<AuthorizationCode, AuthError>;
}

/// Consent through the system browser and a loopback redirect
pub struct LoopbackConsent {
    open_browser: bool,
}

impl Default for LoopbackConsent {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackConsent {
    /// Port range to try for local OAuth callback server
    const PORT_RANGE_START: u16 = 8080;
    const PORT_RANGE_END: u16 = 8090;

    pub fn new() -> Self {
        Self { open_browser: true }
    }

    /// Only print the authorization URL instead of launching a browser
    pub fn without_browser(mut self) -> Self {
        self.open_browser = false;
        self
    }

    /// Start a local TCP server on an available port
    fn start_local_server(&self) -> Result<(TcpListener, u16), AuthError> {
        for port in Self::PORT_RANGE_START..=Self::PORT_RANGE_END {
            if let Ok(listener) = TcpListener::bind(format!("127.0.0.1:{}", port)) {
                return Ok((listener, port));
            }
        }
        Err(AuthError::Consent(format!(
            "Could not bind to any port in range {}-{}",
            Self::PORT_RANGE_START,
            Self::PORT_RANGE_END
        )))
    }

    /// Wait for the OAuth callback and extract the authorization code
    fn wait_for_callback(&self, listener: TcpListener, state: &str) -> Result<String, AuthError> {
        loop {
            let (stream, _) = listener
                .accept()
                .map_err(|e| AuthError::Consent(format!("Failed to accept connection: {}", e)))?;

            // Browsers also ask for /favicon.ico and the like; wait for the real redirect
            if let Some(result) = handle_callback(stream, state)? {
                return result;
            }
        }
    }
}

impl ConsentProvider for LoopbackConsent {
    fn request_code(&self, config: &OAuthConfig) -> Result<AuthorizationCode, AuthError> {
        let (listener, port) = self.start_local_server()?;
        let redirect_uri = format!("http://localhost:{}", port);
        let state = random_state();
        let auth_url = config.authorization_url(&redirect_uri, &state)?;

        info!("Authorization required; visit: {}", auth_url);
        if self.open_browser
            && let Err(e) = open::that(&auth_url)
        {
            warn!("Failed to open browser: {}. Please open the URL manually.", e);
        }

        info!("Waiting for authorization...");
        let code = self.wait_for_callback(listener, &state)?;
        Ok(AuthorizationCode { code, redirect_uri })
    }
}

/// Outcome of one callback request: `None` when the request was not the redirect
type CallbackOutcome = Option<Result<String, AuthError>>;

fn handle_callback(mut stream: TcpStream, expected_state: &str) -> Result<CallbackOutcome, AuthError> {
    let mut request_line = String::new();
    BufReader::new(&stream)
        .read_line(&mut request_line)
        .map_err(|e| AuthError::Consent(format!("Failed to read request: {}", e)))?;

    let outcome = parse_callback(&request_line, expected_state);

    // Send response to browser
    let (status, body) = match &outcome {
        Some(Ok(_)) => ("200 OK", "Authentication successful! You can close this window."),
        Some(Err(_)) => ("400 Bad Request", "Authentication failed. Please try again."),
        None => ("404 Not Found", "Not found."),
    };
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n<html><body><h1>{}</h1></body></html>",
        status, body
    );
    stream.write_all(response.as_bytes()).ok();

    Ok(outcome)
}

/// Parse `GET /?code=AUTH_CODE&state=... HTTP/1.1`
fn parse_callback(request_line: &str, expected_state: &str) -> CallbackOutcome {
    let target = request_line.split_whitespace().nth(1)?;
    let url = url::Url::parse(&format!("http://localhost{}", target)).ok()?;

    let mut code = None;
    let mut error = None;
    let mut state = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(err) = error {
        return Some(Err(AuthError::ConsentDenied(err)));
    }
    let code = code?;
    if state.as_deref() != Some(expected_state) {
        return Some(Err(AuthError::Consent(
            "OAuth state mismatch in callback".to_string(),
        )));
    }
    Some(Ok(code))
}

/// Unguessable value tying the callback to this authorization request
fn random_state() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let high = RandomState::new().build_hasher().finish();
    let low = RandomState::new().build_hasher().finish();
    format!("{:016x}{:016x}", high, low)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_code() {
        let line = "GET /?code=M.R3_BAY%2Fabc&state=s1&session_state=x HTTP/1.1\r\n";
        let outcome = parse_callback(line, "s1").unwrap().unwrap();
        assert_eq!(outcome, "M.R3_BAY/abc");
    }

    #[test]
    fn test_parse_error() {
        let line = "GET /?error=access_denied&state=s1 HTTP/1.1";
        assert!(matches!(
            parse_callback(line, "s1"),
            Some(Err(AuthError::ConsentDenied(e))) if e == "access_denied"
        ));
    }

    #[test]
    fn test_parse_state_mismatch() {
        let line = "GET /?code=abc&state=forged HTTP/1.1";
        assert!(matches!(
            parse_callback(line, "s1"),
            Some(Err(AuthError::Consent(_)))
        ));
    }

    #[test]
    fn test_ignores_unrelated_requests() {
        assert!(parse_callback("GET /favicon.ico HTTP/1.1", "s1").is_none());
        assert!(parse_callback("", "s1").is_none());
    }

    #[test]
    fn test_random_state_differs() {
        let a = random_state();
        let b = random_state();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
