//! Backup run orchestration
//!
//! A run lists the remote mailbox on the calling thread and hands every
//! message that is not yet stored locally to a pool of workers through a
//! bounded channel. Workers download and write messages; the channel
//! capacity equals the worker count, so listing blocks when workers fall
//! behind. After the listing and all workers finish, local copies of
//! messages that are gone remotely can optionally be deleted.

use crossbeam_channel::{Receiver, Sender};
use log::{Level, debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use super::events::{EventSink, NullSink};
use crate::auth::{ConsentProvider, HttpTokenExchange, TokenManager};
use crate::config::BackupConfig;
use crate::error::{ConfigError, FetchError, SyncError};
use crate::models::{BackupSummary, MessageRef, SyncState};
use crate::remote::{HttpClient, ListQuery, MailApi, MessageFetcher, MessageLister, RetryPolicy};
use crate::storage::{FileMessageStore, LocalStore};

/// Tunables of a backup run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub query: ListQuery,
    /// Number of messages downloaded in parallel
    pub max_connections: usize,
    /// Delete local copies of messages no longer listed remotely
    pub sync_deletes: bool,
    pub retry: RetryPolicy,
}

impl SyncOptions {
    pub const DEFAULT_MAX_CONNECTIONS: usize = 5;
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            query: ListQuery::default(),
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
            sync_deletes: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Authorizing,
    Listing,
    /// Listing continues while workers back up enqueued messages
    BackingUp,
    ReconcilingDeletes,
    Completed,
    Failed,
}

/// Requests a running backup to stop
///
/// Cancellation stops the listing and drops queued work; downloads already
/// in progress finish and are written.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// State shared by the producer and the workers of one run
struct RunContext {
    state: Mutex<SyncState>,
    /// First run-fatal error; once set nothing new is scheduled
    fatal: Mutex<Option<SyncError>>,
    aborted: AtomicBool,
}

impl RunContext {
    fn new() -> Self {
        Self {
            state: Mutex::new(SyncState::new()),
            fatal: Mutex::new(None),
            aborted: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn abort(&self, error: SyncError) {
        let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
        if fatal.is_none() {
            *fatal = Some(error);
        }
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn take_fatal(&self) -> Option<SyncError> {
        self.fatal.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Runs backups of one remote mailbox into one local store
pub struct SyncEngine {
    tokens: Arc<TokenManager>,
    api: Arc<dyn MailApi>,
    store: Arc<dyn LocalStore>,
    sink: Arc<dyn EventSink>,
    options: SyncOptions,
    phase: Mutex<SyncPhase>,
    cancel: CancelHandle,
}

impl SyncEngine {
    pub fn new(
        tokens: Arc<TokenManager>,
        api: Arc<dyn MailApi>,
        store: Arc<dyn LocalStore>,
        options: SyncOptions,
    ) -> Result<Self, SyncError> {
        if options.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections.into());
        }

        Ok(Self {
            tokens,
            api,
            store,
            sink: Arc::new(NullSink),
            options,
            phase: Mutex::new(SyncPhase::Idle),
            cancel: CancelHandle::default(),
        })
    }

    /// Build an engine talking to the configured provider over HTTP and
    /// writing to the configured data folder
    pub fn from_config(
        config: &BackupConfig,
        consent: Box<dyn ConsentProvider>,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let options = config.sync_options();
        let http = HttpClient::new();
        let tokens = TokenManager::new(
            config.oauth_config(),
            Box::new(HttpTokenExchange::new(http.clone())),
            consent,
        )
        .with_retry_policy(options.retry.clone());
        let store = FileMessageStore::new(&config.data_folder)?;

        Self::new(Arc::new(tokens), config.provider.api(http), Arc::new(store), options)
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn state(&self) -> SyncPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run one backup to completion
    ///
    /// Per-message failures are reported through the sink and counted in
    /// the summary. An error is returned only when the run itself could not
    /// finish: authorization failed, the listing was cut short, the worker
    /// pool could not start, or the run was cancelled.
    pub fn run(&self) -> Result<BackupSummary, SyncError> {
        let started = Instant::now();

        match self.run_phases(started) {
            Ok(summary) => {
                self.set_phase(SyncPhase::Completed);
                self.log(
                    Level::Info,
                    &format!(
                        "Backup completed: {} backed up, {} skipped, {} failed",
                        summary.backed_up, summary.skipped, summary.failed
                    ),
                );
                self.sink.on_end_backup(&summary);
                Ok(summary)
            }
            Err(e) => {
                self.set_phase(SyncPhase::Failed);
                self.log(Level::Error, &format!("Backup failed: {}", e));
                Err(e)
            }
        }
    }

    fn run_phases(&self, started: Instant) -> Result<BackupSummary, SyncError> {
        self.set_phase(SyncPhase::Authorizing);
        self.log(Level::Info, "Authorizing");
        self.tokens.authorize()?;
        self.ensure_not_cancelled()?;

        if self.options.sync_deletes && self.options.query.is_restricted() {
            self.log(
                Level::Warn,
                "Delete sync is on with a filter or date range; local messages outside it will be deleted",
            );
        }

        let context = RunContext::new();
        self.set_phase(SyncPhase::Listing);
        self.log(Level::Info, "Retrieving message list");
        self.back_up(&context)?;
        self.ensure_not_cancelled()?;

        if self.options.sync_deletes {
            self.set_phase(SyncPhase::ReconcilingDeletes);
            self.reconcile_deletes(&context)?;
        }

        let state = context.state();
        for (id, retries) in state.failed() {
            debug!("{} was not backed up ({} retries)", id, retries);
        }
        Ok(state.summary(self.options.sync_deletes, started.elapsed()))
    }

    /// List the mailbox and back up every new message
    fn back_up(&self, context: &RunContext) -> Result<(), SyncError> {
        let workers = self.options.max_connections;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("nimbus-worker-{}", i))
            .build()
            .map_err(|e| SyncError::WorkerPool(e.to_string()))?;

        let lister = MessageLister::new(self.api.clone(), self.tokens.clone(), self.options.retry.clone());
        let fetcher = MessageFetcher::new(self.api.clone(), self.tokens.clone(), self.options.retry.clone());
        let (tx, rx) = crossbeam_channel::bounded::<MessageRef>(workers);

        debug!("Starting {} backup workers", workers);
        let fetcher = &fetcher;
        pool.in_place_scope(|scope| {
            for _ in 0..workers {
                let rx = rx.clone();
                scope.spawn(move |_| self.work(rx, fetcher, context));
            }
            drop(rx);

            if let Err(e) = self.produce(&lister, tx, context) {
                context.abort(e);
            }
        });

        match context.take_fatal() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Feed listed messages to the workers. Dropping `tx` on return lets
    /// the workers drain the queue and exit.
    fn produce(
        &self,
        lister: &MessageLister,
        tx: Sender<MessageRef>,
        context: &RunContext,
    ) -> Result<(), SyncError> {
        for item in lister.list(self.options.query.clone()) {
            if self.should_stop(context) {
                break;
            }
            let message = item?;

            if !context.state().discover(&message.id) {
                debug!("Duplicate listing entry for {}, ignoring", message.id);
                continue;
            }

            let path = self.store.path_for(&message.id);
            match self.store.exists(&message.id) {
                Ok(true) => {
                    debug!("Message {} exists locally, skipping", message.id);
                    context.state().mark_skipped(message.id.clone());
                    self.sink.on_before_backup(&message.id, &path, true);
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Could not check local copy of {}: {}", message.id, e);
                    self.sink
                        .on_message_error(&message.id, e.code(), &e.to_string(), false);
                    context.state().mark_failed(message.id.clone(), 0);
                    continue;
                }
            }

            self.sink.on_before_backup(&message.id, &path, false);
            if self.state() == SyncPhase::Listing {
                self.set_phase(SyncPhase::BackingUp);
            }
            if tx.send(message).is_err() {
                // Every worker is gone; nothing left to hand work to
                break;
            }
        }

        let discovered = context.state().discovered();
        info!("Listing finished, {} messages discovered", discovered);
        Ok(())
    }

    /// Worker loop: back up queued messages until the queue closes
    fn work(&self, rx: Receiver<MessageRef>, fetcher: &MessageFetcher, context: &RunContext) {
        for message in rx.iter() {
            // Keep draining after a stop so the producer never blocks on a full queue
            if self.should_stop(context) {
                continue;
            }
            self.back_up_message(&message, fetcher, context);
        }
    }

    fn back_up_message(&self, message: &MessageRef, fetcher: &MessageFetcher, context: &RunContext) {
        let id = &message.id;
        let max_retries = fetcher.retry_policy().max_retries;

        let result = fetcher.fetch(message, |err, retry| {
            warn!(
                "Error backing up {}, retrying ({}/{}): {}",
                id, retry, max_retries, err
            );
            self.sink.on_message_error(id, &err.code(), &err.to_string(), true);
        });

        let content = match result {
            Ok(content) => content,
            Err(FetchError::Auth(e)) => {
                self.sink.on_message_error(id, "AUTH", &e.to_string(), false);
                context.abort(SyncError::Auth(e));
                return;
            }
            Err(e) => {
                let retries = match &e {
                    FetchError::Transient { retries, .. } => *retries,
                    _ => 0,
                };
                warn!("Error backing up {}, skipping: {}", id, e);
                self.sink.on_message_error(id, &e.code(), &e.to_string(), false);
                context.state().mark_failed(id.clone(), retries);
                return;
            }
        };

        match self.store.write(id, &content) {
            Ok(file) => {
                let mut state = context.state();
                if let Some((progress, total)) = state.mark_completed(id.clone()) {
                    debug!("Backed up {} ({}/{})", id, progress, total);
                    // Notify under the lock so progress values arrive in order
                    self.sink.on_after_backup(&file, progress, total);
                }
            }
            Err(e) => {
                warn!("Failed to store {}: {}", id, e);
                self.sink.on_message_error(id, e.code(), &e.to_string(), false);
                context.state().mark_failed(id.clone(), 0);
            }
        }
    }

    /// Delete local messages the listing did not return
    fn reconcile_deletes(&self, context: &RunContext) -> Result<(), SyncError> {
        let local = self.store.list_local_ids()?;
        let mut stale: Vec<_> = {
            let state = context.state();
            local
                .into_iter()
                .filter(|id| !state.seen().contains(id))
                .collect()
        };
        stale.sort();

        if stale.is_empty() {
            debug!("No local messages to delete");
            return Ok(());
        }
        self.log(
            Level::Info,
            &format!("Deleting {} messages no longer present remotely", stale.len()),
        );

        for id in stale {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let path = self.store.path_for(&id);
            self.sink.on_message_delete(&id, &path);
            match self.store.delete(&id) {
                Ok(_) => context.state().record_delete(),
                Err(e) => {
                    warn!("Failed to delete {}: {}", id, e);
                    self.sink.on_message_error(&id, e.code(), &e.to_string(), false);
                    context.state().record_delete_failure();
                }
            }
        }
        Ok(())
    }

    fn should_stop(&self, context: &RunContext) -> bool {
        self.cancel.is_cancelled() || context.is_aborted()
    }

    fn ensure_not_cancelled(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    fn set_phase(&self, phase: SyncPhase) {
        let mut current = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != phase {
            debug!("Backup phase {:?} -> {:?}", *current, phase);
            *current = phase;
        }
    }

    /// Report to the sink and mirror to the log facade
    fn log(&self, level: Level, message: &str) {
        log::log!(level, "{}", message);
        self.sink.on_log(level, message);
    }
}
