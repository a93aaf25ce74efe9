//! OAuth2 authorization
//!
//! This module provides:
//! - Authorization code flow with a loopback redirect
//! - Token endpoint access (code exchange and refresh grants)
//! - The shared [`TokenManager`] handing out bearer tokens to workers

mod consent;
mod exchange;
mod token;

pub use consent::{AuthorizationCode, ConsentProvider, LoopbackConsent};
pub use exchange::{HttpTokenExchange, TokenExchange, TokenResponse};
pub use token::{Credential, OAuthConfig, TokenManager};
