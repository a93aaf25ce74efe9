//! Integration tests for the mailsync crate
//!
//! These tests run complete backups against the in-memory remote mailbox
//! and a real on-disk store.

use chrono::Utc;
use mailsync::auth::{
    AuthorizationCode, ConsentProvider, Credential, OAuthConfig, TokenExchange, TokenManager,
    TokenResponse,
};
use mailsync::models::{MessageId, MessageRef};
use mailsync::remote::{InMemoryMailbox, ListQuery, MailApi, MessagePage, PageCursor, RetryPolicy};
use mailsync::storage::{FileMessageStore, InMemoryMessageStore, LocalStore};
use mailsync::sync::{CancelHandle, Event, EventSink, RecordingSink, SyncEngine, SyncOptions, SyncPhase};
use mailsync::{ApiError, AuthError, BackupFile, SyncError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Token endpoint double handing out "fresh-N" on every refresh
struct CountingExchange {
    refreshes: Arc<AtomicUsize>,
    reject: bool,
}

impl TokenExchange for CountingExchange {
    fn exchange_code(
        &self,
        _config: &OAuthConfig,
        code: &str,
        _redirect_uri: &str,
    ) -> Result<TokenResponse, AuthError> {
        Ok(TokenResponse::new(
            format!("code-{}", code),
            Some("refresh-token".into()),
            Some(3600),
        ))
    }

    fn refresh(&self, _config: &OAuthConfig, _refresh_token: &str) -> Result<TokenResponse, AuthError> {
        if self.reject {
            return Err(AuthError::RefreshRejected("invalid_grant".into()));
        }
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        std::thread::sleep(Duration::from_millis(10));
        Ok(TokenResponse::new(format!("fresh-{}", n), None, Some(3600)))
    }
}

struct DeniedConsent;

impl ConsentProvider for DeniedConsent {
    fn request_code(&self, _config: &OAuthConfig) -> Result<AuthorizationCode, AuthError> {
        Err(AuthError::ConsentDenied("access_denied".into()))
    }
}

fn oauth_config() -> OAuthConfig {
    OAuthConfig {
        client_id: "client".into(),
        client_secret: "secret".into(),
        auth_url: "https://login.example.test/authorize".into(),
        token_url: "https://login.example.test/token".into(),
        scope: "offline_access mail.read".into(),
        extra_auth_params: Vec::new(),
    }
}

/// Token manager holding a valid "initial" token; returns the refresh counter
fn token_manager(reject_refresh: bool) -> (Arc<TokenManager>, Arc<AtomicUsize>) {
    let refreshes = Arc::new(AtomicUsize::new(0));
    let exchange = CountingExchange {
        refreshes: refreshes.clone(),
        reject: reject_refresh,
    };
    let manager = TokenManager::new(oauth_config(), Box::new(exchange), Box::new(DeniedConsent))
        .with_credential(Credential {
            access_token: "initial".into(),
            refresh_token: Some("refresh-token".into()),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        });
    (Arc::new(manager), refreshes)
}

fn mailbox(ids: &[&str]) -> Arc<InMemoryMailbox> {
    let mailbox = Arc::new(InMemoryMailbox::new().with_page_size(4));
    for id in ids {
        mailbox.add_message(*id, format!("Message-ID: <{}@example.com>\r\n\r\nbody", id));
    }
    mailbox
}

fn options(max_connections: usize, sync_deletes: bool) -> SyncOptions {
    SyncOptions {
        max_connections,
        sync_deletes,
        retry: RetryPolicy::immediate(5),
        ..Default::default()
    }
}

fn file_store() -> (TempDir, Arc<FileMessageStore>) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileMessageStore::new(dir.path().join("backup")).unwrap());
    (dir, store)
}

fn ids(names: &[&str]) -> HashSet<MessageId> {
    names.iter().map(|n| MessageId::new(*n)).collect()
}

#[test]
fn test_end_to_end_backup() {
    let remote = mailbox(&["m1", "m2", "m3"]);
    let (_dir, store) = file_store();
    store.write(&MessageId::new("m1"), b"existing copy").unwrap();
    let sink = Arc::new(RecordingSink::new());
    let (tokens, _) = token_manager(false);

    let engine = SyncEngine::new(tokens, remote, store.clone(), options(5, false))
        .unwrap()
        .with_sink(sink.clone());
    let summary = engine.run().unwrap();

    assert_eq!(summary.discovered, 3);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.backed_up, 2);
    assert_eq!(summary.deleted, 0);
    assert_eq!(store.list_local_ids().unwrap(), ids(&["m1", "m2", "m3"]));

    // The skipped message was left alone
    let m1 = std::fs::read(store.path_for(&MessageId::new("m1"))).unwrap();
    assert_eq!(m1, b"existing copy");
    let m2 = std::fs::read(store.path_for(&MessageId::new("m2"))).unwrap();
    assert_eq!(m2, b"Message-ID: <m2@example.com>\r\n\r\nbody");

    let events = sink.events();
    assert!(events.contains(&Event::BeforeBackup {
        id: MessageId::new("m1"),
        will_skip: true,
    }));
    assert!(events.contains(&Event::EndBackup(summary)));
}

#[test]
fn test_second_run_skips_everything() {
    let remote = mailbox(&["a", "b", "c", "d", "e"]);
    let store = Arc::new(InMemoryMessageStore::new());
    let (tokens, _) = token_manager(false);

    let engine = SyncEngine::new(tokens, remote, store.clone(), options(3, false)).unwrap();
    let first = engine.run().unwrap();
    assert_eq!(first.backed_up, 5);
    assert_eq!(store.write_count(), 5);

    let second = engine.run().unwrap();
    assert_eq!(second.backed_up, 0);
    assert_eq!(second.skipped, 5);
    assert_eq!(second.deleted, 0);
    assert_eq!(store.write_count(), 5);
}

#[test]
fn test_delete_sync_removes_remotely_deleted() {
    let remote = mailbox(&["a", "b", "c"]);
    let (_dir, store) = file_store();
    let (tokens, _) = token_manager(false);
    let engine = SyncEngine::new(tokens, remote.clone(), store.clone(), options(2, true)).unwrap();

    engine.run().unwrap();
    assert_eq!(store.list_local_ids().unwrap(), ids(&["a", "b", "c"]));

    remote.remove_message(&MessageId::new("c"));
    let summary = engine.run().unwrap();

    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.skipped, 2);
    assert_eq!(store.list_local_ids().unwrap(), ids(&["a", "b"]));
    assert!(!store.path_for(&MessageId::new("c")).exists());
}

#[test]
fn test_unusual_ids_round_trip_through_files() {
    let names = ["AAMkAGI2TG93AAA=", "AQMk/x+y==", "18c4f2a9e3b7d001", "with space"];
    let remote = mailbox(&names);
    let (_dir, store) = file_store();
    let (tokens, _) = token_manager(false);

    let engine = SyncEngine::new(tokens, remote, store.clone(), options(2, true)).unwrap();
    let summary = engine.run().unwrap();

    assert_eq!(summary.backed_up, 4);
    // Every stored file maps back to a listed id, so nothing is deleted
    assert_eq!(summary.deleted, 0);
    assert_eq!(store.list_local_ids().unwrap(), ids(&names));
}

#[test]
fn test_leftover_partial_files_are_ignored() {
    let remote = mailbox(&["a"]);
    let (dir, store) = file_store();
    std::fs::write(dir.path().join("backup").join(".partial-Xy12ab.tmp"), b"trunc").unwrap();
    let (tokens, _) = token_manager(false);

    let engine = SyncEngine::new(tokens, remote, store.clone(), options(1, true)).unwrap();
    let summary = engine.run().unwrap();

    assert_eq!(summary.deleted, 0);
    assert_eq!(store.list_local_ids().unwrap(), ids(&["a"]));
}

#[test]
fn test_failures_are_isolated() {
    let remote = mailbox(&["ok-1", "flaky", "private", "ok-2"]);
    remote.fail_fetches("flaky", [ApiError::transient("connection reset")]);
    remote.fail_fetches("private", [ApiError::PermissionDenied("ErrorAccessDenied".into())]);
    let store = Arc::new(InMemoryMessageStore::new());
    let sink = Arc::new(RecordingSink::new());
    let (tokens, _) = token_manager(false);

    let engine = SyncEngine::new(tokens, remote, store.clone(), options(2, false))
        .unwrap()
        .with_sink(sink.clone());
    let summary = engine.run().unwrap();

    assert_eq!(summary.backed_up, 3);
    assert_eq!(summary.failed, 1);
    assert!(!store.exists(&MessageId::new("private")).unwrap());
    assert_eq!(
        sink.errors_for(&MessageId::new("flaky")),
        vec![("TRANSIENT".to_string(), true)]
    );
    assert_eq!(
        sink.errors_for(&MessageId::new("private")),
        vec![("403".to_string(), false)]
    );
}

/// Mailbox that rejects one token for downloads only
struct RevokedForDownloads {
    inner: Arc<InMemoryMailbox>,
    revoked: String,
}

impl MailApi for RevokedForDownloads {
    fn list_page(
        &self,
        access_token: &str,
        query: &ListQuery,
        cursor: Option<&PageCursor>,
    ) -> Result<MessagePage, ApiError> {
        self.inner.list_page(access_token, query, cursor)
    }

    fn get_message(&self, access_token: &str, message: &MessageRef) -> Result<Vec<u8>, ApiError> {
        if access_token == self.revoked {
            return Err(ApiError::Unauthorized);
        }
        self.inner.get_message(access_token, message)
    }
}

#[test]
fn test_revoked_token_refreshed_once_across_workers() {
    let names: Vec<String> = (0..40).map(|i| format!("msg-{:03}", i)).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let inner = mailbox(&refs);
    inner.set_fetch_delay(Duration::from_millis(5));
    let remote = Arc::new(RevokedForDownloads {
        inner: inner.clone(),
        revoked: "initial".into(),
    });
    let store = Arc::new(InMemoryMessageStore::new());
    let (tokens, refreshes) = token_manager(false);

    let engine = SyncEngine::new(tokens.clone(), remote, store.clone(), options(10, false)).unwrap();
    let summary = engine.run().unwrap();

    assert_eq!(summary.backed_up, 40);
    assert_eq!(summary.failed, 0);
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(tokens.refresh_count(), 1);
    assert!(inner.max_concurrent_fetches() <= 10);
}

#[test]
fn test_unauthorized_listing_refreshes_then_succeeds() {
    let remote = mailbox(&["a", "b"]);
    remote.accept_token("fresh-1");
    let store = Arc::new(InMemoryMessageStore::new());
    let (tokens, refreshes) = token_manager(false);

    let engine = SyncEngine::new(tokens, remote.clone(), store, options(2, false)).unwrap();
    let summary = engine.run().unwrap();

    assert_eq!(summary.backed_up, 2);
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_rejected_refresh_is_fatal() {
    let remote = mailbox(&["a", "b"]);
    remote.accept_token("never-issued");
    let store = Arc::new(InMemoryMessageStore::new());
    let (tokens, _) = token_manager(true);

    let engine = SyncEngine::new(tokens, remote, store.clone(), options(2, true)).unwrap();
    let err = engine.run().unwrap_err();

    assert!(matches!(err, SyncError::Auth(AuthError::RefreshRejected(_))));
    assert_eq!(engine.state(), SyncPhase::Failed);
    assert_eq!(store.write_count(), 0);
}

/// Sink that cancels the run after the first message is written
#[derive(Default)]
struct CancelAfterFirst {
    handle: Mutex<Option<CancelHandle>>,
    written: AtomicUsize,
}

impl EventSink for CancelAfterFirst {
    fn on_after_backup(&self, _file: &BackupFile, _progress: usize, _total: usize) {
        self.written.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().as_ref() {
            handle.cancel();
        }
    }
}

#[test]
fn test_cancellation_stops_run() {
    let names: Vec<String> = (0..50).map(|i| format!("m{}", i)).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let remote = mailbox(&refs);
    let (_dir, store) = file_store();
    store.write(&MessageId::new("local-only"), b"x").unwrap();
    let sink = Arc::new(CancelAfterFirst::default());
    let (tokens, _) = token_manager(false);

    let engine = SyncEngine::new(tokens, remote, store.clone(), options(1, true))
        .unwrap()
        .with_sink(sink.clone());
    *sink.handle.lock().unwrap() = Some(engine.cancel_handle());

    let result = engine.run();

    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert_eq!(engine.state(), SyncPhase::Failed);
    let written = sink.written.load(Ordering::SeqCst);
    assert!(written >= 1 && written < 50);
    // Delete pass never ran
    assert!(store.exists(&MessageId::new("local-only")).unwrap());
}
