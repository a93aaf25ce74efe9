//! Mailsync - Mailbox backup engine
//!
//! This crate backs up a cloud mailbox to local storage:
//! - OAuth2 authorization with transparent token refresh
//! - Paginated listing and download over a provider REST API
//!   (Microsoft Graph for Office 365, or Gmail)
//! - One file per message, written atomically
//! - Bounded parallel downloads with retries and backoff
//! - Optional removal of local copies of remotely deleted messages
//!
//! The engine has no UI dependencies; progress is reported through an
//! [`EventSink`].

pub mod auth;
pub mod config;
pub mod error;
pub mod models;
pub mod remote;
pub mod storage;
pub mod sync;

pub use auth::{LoopbackConsent, OAuthConfig, TokenManager};
pub use crate::config::{BackupConfig, OAuthCredentials, Provider, parse_date};
pub use error::{ApiError, AuthError, ConfigError, FetchError, StorageError, SyncError};
pub use models::{BackupFile, BackupSummary, MessageId, MessageRef, SyncState};
pub use remote::{InMemoryMailbox, ListQuery, MailApi, RetryPolicy};
pub use storage::{FileMessageStore, InMemoryMessageStore, LocalStore};
pub use sync::{CancelHandle, EventSink, NullSink, RecordingSink, SyncEngine, SyncOptions, SyncPhase};
