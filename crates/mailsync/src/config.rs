//! Configuration for backup runs
//!
//! Supports loading OAuth credentials from (in order of priority):
//! 1. Compile-time embedded credentials (for production builds)
//! 2. JSON file (flat, or the "installed"/"web" format of the provider consoles)
//! 3. Runtime environment variables (fallback)

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::auth::OAuthConfig;
use crate::error::ConfigError;
use crate::remote::{GmailApi, GraphApi, HttpClient, ListQuery, MailApi, RetryPolicy};
use crate::sync::SyncOptions;

/// Credentials filename in the Nimbus config directory
const CREDENTIALS_FILE: &str = "credentials.json";

const ENV_CLIENT_ID: &str = "NIMBUS_CLIENT_ID";
const ENV_CLIENT_SECRET: &str = "NIMBUS_CLIENT_SECRET";

/// Remote mail service a backup runs against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Provider {
    /// Office 365 through Microsoft Graph
    #[default]
    Office365,
    Gmail,
}

impl Provider {
    pub fn auth_url(&self) -> &'static str {
        match self {
            Provider::Office365 => "https://login.microsoftonline.com/common/oauth2/v2.0/authorize",
            Provider::Gmail => "https://accounts.google.com/o/oauth2/auth",
        }
    }

    pub fn token_url(&self) -> &'static str {
        match self {
            Provider::Office365 => "https://login.microsoftonline.com/common/oauth2/v2.0/token",
            Provider::Gmail => "https://accounts.google.com/o/oauth2/token",
        }
    }

    pub fn default_scope(&self) -> &'static str {
        match self {
            Provider::Office365 => "offline_access mail.read",
            Provider::Gmail => "https://www.googleapis.com/auth/gmail.readonly",
        }
    }

    /// Authorization URL parameters needed to be issued a refresh token
    fn extra_auth_params(&self) -> Vec<(String, String)> {
        match self {
            // offline_access in the scope covers it
            Provider::Office365 => Vec::new(),
            Provider::Gmail => vec![
                ("access_type".to_string(), "offline".to_string()),
                ("prompt".to_string(), "consent".to_string()),
            ],
        }
    }

    /// Remote API client for this provider
    pub fn api(&self, http: HttpClient) -> Arc<dyn MailApi> {
        match self {
            Provider::Office365 => Arc::new(GraphApi::new(http)),
            Provider::Gmail => Arc::new(GmailApi::new(http)),
        }
    }
}

impl FromStr for Provider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "office365" | "o365" | "outlook" | "graph" => Ok(Provider::Office365),
            "gmail" | "google" => Ok(Provider::Gmail),
            _ => Err(ConfigError::UnknownProvider(s.to_string())),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Office365 => write!(f, "office365"),
            Provider::Gmail => write!(f, "gmail"),
        }
    }
}

/// OAuth client credentials of the registered application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Credential file, either flat or in the provider console format
#[derive(Deserialize)]
struct CredentialFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

#[derive(Deserialize)]
struct ClientSecrets {
    client_id: String,
    client_secret: String,
}

impl OAuthCredentials {
    /// Load credentials using the following priority:
    /// 1. Compile-time embedded credentials (for production builds)
    /// 2. JSON file (~/.config/nimbus/credentials.json)
    /// 3. Runtime environment variables
    pub fn load() -> Result<Self> {
        if let Some(creds) = Self::from_compile_time() {
            return Ok(creds);
        }

        if let Some(creds) = ::config::load_optional_json::<CredentialFile>(CREDENTIALS_FILE)? {
            return Self::from_credential_file(creds);
        }

        Self::from_env()
    }

    /// Load credentials embedded at compile time via environment variables.
    /// Build with: NIMBUS_CLIENT_ID=xxx NIMBUS_CLIENT_SECRET=yyy cargo build --release
    pub fn from_compile_time() -> Option<Self> {
        let client_id = option_env!("NIMBUS_CLIENT_ID")?;
        let client_secret = option_env!("NIMBUS_CLIENT_SECRET")?;

        if client_id.is_empty() || client_secret.is_empty() {
            return None;
        }

        Some(Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }

    /// Load credentials from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let creds: CredentialFile = ::config::load_json_file(path)?;
        Self::from_credential_file(creds)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let creds: CredentialFile =
            serde_json::from_str(json).context("Failed to parse credentials JSON")?;
        Self::from_credential_file(creds)
    }

    fn from_credential_file(creds: CredentialFile) -> Result<Self> {
        if let Some(secrets) = creds.installed.or(creds.web) {
            return Ok(Self {
                client_id: secrets.client_id,
                client_secret: secrets.client_secret,
            });
        }

        match (creds.client_id, creds.client_secret) {
            (Some(client_id), Some(client_secret)) => Ok(Self {
                client_id,
                client_secret,
            }),
            _ => anyhow::bail!(
                "Credentials file needs 'client_id' and 'client_secret' or an 'installed'/'web' section"
            ),
        }
    }

    /// Load credentials from environment variables
    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var(ENV_CLIENT_ID)
            .with_context(|| format!("{} environment variable not set", ENV_CLIENT_ID))?;
        let client_secret = std::env::var(ENV_CLIENT_SECRET)
            .with_context(|| format!("{} environment variable not set", ENV_CLIENT_SECRET))?;

        Ok(Self {
            client_id,
            client_secret,
        })
    }

    /// Get the default credentials file path (~/.config/nimbus/credentials.json)
    pub fn default_credentials_path() -> Option<PathBuf> {
        ::config::config_path(CREDENTIALS_FILE)
    }

    /// Check if credentials are available (compile-time, file, or env vars)
    pub fn is_available() -> bool {
        if Self::from_compile_time().is_some() {
            return true;
        }
        if ::config::config_exists(CREDENTIALS_FILE) {
            return true;
        }
        std::env::var(ENV_CLIENT_ID).is_ok() && std::env::var(ENV_CLIENT_SECRET).is_ok()
    }
}

/// Everything needed to start a backup run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    pub provider: Provider,
    pub client_id: String,
    pub client_secret: String,
    /// Overrides the provider's default scope
    pub scope: Option<String>,
    /// Directory messages are saved to
    pub data_folder: PathBuf,
    /// Provider-specific query expression, passed through verbatim
    pub filter: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub max_connections: usize,
    /// Remove local copies of messages that no longer exist remotely
    pub sync_deletes: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            client_id: String::new(),
            client_secret: String::new(),
            scope: None,
            data_folder: PathBuf::new(),
            filter: None,
            start_date: None,
            end_date: None,
            max_connections: SyncOptions::DEFAULT_MAX_CONNECTIONS,
            sync_deletes: false,
        }
    }
}

impl BackupConfig {
    pub fn with_credentials(mut self, credentials: OAuthCredentials) -> Self {
        self.client_id = credentials.client_id;
        self.client_secret = credentials.client_secret;
        self
    }

    /// Reject configurations a run cannot start with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::MissingClientId);
        }
        if self.client_secret.trim().is_empty() {
            return Err(ConfigError::MissingClientSecret);
        }
        if self.data_folder.as_os_str().is_empty() {
            return Err(ConfigError::MissingDataFolder);
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections);
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date)
            && start > end
        {
            return Err(ConfigError::InvalidDateRange { start, end });
        }
        Ok(())
    }

    pub fn oauth_config(&self) -> OAuthConfig {
        OAuthConfig {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            auth_url: self.provider.auth_url().to_string(),
            token_url: self.provider.token_url().to_string(),
            scope: self
                .scope
                .clone()
                .unwrap_or_else(|| self.provider.default_scope().to_string()),
            extra_auth_params: self.provider.extra_auth_params(),
        }
    }

    pub fn list_query(&self) -> ListQuery {
        ListQuery {
            filter: self.filter.clone().filter(|f| !f.trim().is_empty()),
            start_date: self.start_date,
            end_date: self.end_date,
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            query: self.list_query(),
            max_connections: self.max_connections,
            sync_deletes: self.sync_deletes,
            retry: RetryPolicy::default(),
        }
    }
}

/// Parse a calendar date given as `YYYY/MM/DD` or `YYYY-MM-DD`
pub fn parse_date(s: &str) -> Result<NaiveDate, ConfigError> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y/%m/%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .map_err(|_| ConfigError::InvalidDate(s.to_string()))
}
