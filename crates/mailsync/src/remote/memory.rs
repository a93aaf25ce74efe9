//! In-memory remote mailbox
//!
//! Serves a fixed set of messages through [`MailApi`], with scriptable
//! failures and concurrency accounting. Used by tests and dry runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use super::{ListQuery, MailApi, MessagePage, PageCursor};
use crate::error::ApiError;
use crate::models::{MessageId, MessageRef};

/// In-memory implementation of [`MailApi`]
pub struct InMemoryMailbox {
    messages: RwLock<Vec<(MessageRef, Vec<u8>)>>,
    page_size: usize,
    /// Only this token is accepted when set; anything else gets a 401
    accepted_token: RwLock<Option<String>>,
    list_failures: Mutex<VecDeque<ApiError>>,
    fetch_failures: Mutex<HashMap<MessageId, VecDeque<ApiError>>>,
    fetch_delay: RwLock<Duration>,
    queries: Mutex<Vec<ListQuery>>,
    list_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for InMemoryMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMailbox {
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
            page_size: 100,
            accepted_token: RwLock::new(None),
            list_failures: Mutex::new(VecDeque::new()),
            fetch_failures: Mutex::new(HashMap::new()),
            fetch_delay: RwLock::new(Duration::ZERO),
            queries: Mutex::new(Vec::new()),
            list_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Set how many references each listing page carries
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Add a message; adding an existing id again lists it twice
    pub fn add_message(&self, id: impl Into<MessageId>, content: impl Into<Vec<u8>>) {
        let mut messages = self.messages.write().unwrap_or_else(PoisonError::into_inner);
        messages.push((MessageRef::new(id), content.into()));
    }

    /// Remove every listing entry for a message
    pub fn remove_message(&self, id: &MessageId) {
        let mut messages = self.messages.write().unwrap_or_else(PoisonError::into_inner);
        messages.retain(|(m, _)| &m.id != id);
    }

    /// Reject every token except this one with a 401
    pub fn accept_token(&self, token: impl Into<String>) {
        *self.accepted_token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    /// Fail the next listing requests with these errors, in order
    pub fn fail_list_pages(&self, errors: impl IntoIterator<Item = ApiError>) {
        let mut failures = self.list_failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.extend(errors);
    }

    /// Fail the next downloads of a message with these errors, in order
    pub fn fail_fetches(&self, id: impl Into<MessageId>, errors: impl IntoIterator<Item = ApiError>) {
        let mut failures = self.fetch_failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.entry(id.into()).or_default().extend(errors);
    }

    /// Make every download take at least this long
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.write().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Number of listing requests served (including failed ones)
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of download requests served (including failed ones)
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Highest number of downloads that were ever running at once
    pub fn max_concurrent_fetches(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Queries received by the listing endpoint, oldest first
    pub fn queries(&self) -> Vec<ListQuery> {
        self.queries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn check_token(&self, access_token: &str) -> Result<(), ApiError> {
        let accepted = self.accepted_token.read().unwrap_or_else(PoisonError::into_inner);
        match accepted.as_deref() {
            Some(token) if token != access_token => Err(ApiError::Unauthorized),
            _ => Ok(()),
        }
    }
}

impl MailApi for InMemoryMailbox {
    fn list_page(
        &self,
        access_token: &str,
        query: &ListQuery,
        cursor: Option<&PageCursor>,
    ) -> Result<MessagePage, ApiError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_token(access_token)?;

        if let Some(err) = self
            .list_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            return Err(err);
        }

        if cursor.is_none() {
            self.queries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(query.clone());
        }

        let offset = match cursor {
            Some(c) => c
                .as_str()
                .parse::<usize>()
                .map_err(|_| ApiError::Request {
                    status: 400,
                    message: format!("Invalid page cursor: {}", c.as_str()),
                })?,
            None => 0,
        };

        let messages = self.messages.read().unwrap_or_else(PoisonError::into_inner);
        let end = (offset + self.page_size).min(messages.len());
        let page: Vec<MessageRef> = messages
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|(m, _)| m.clone())
            .collect();
        let next = (end < messages.len()).then(|| PageCursor(end.to_string()));

        Ok(MessagePage {
            messages: page,
            next,
        })
    }

    fn get_message(&self, access_token: &str, message: &MessageRef) -> Result<Vec<u8>, ApiError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let delay = *self.fetch_delay.read().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let result = self.serve_message(access_token, &message.id);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl InMemoryMailbox {
    fn serve_message(&self, access_token: &str, id: &MessageId) -> Result<Vec<u8>, ApiError> {
        self.check_token(access_token)?;

        let scripted = self
            .fetch_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(id)
            .and_then(|queue| queue.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }

        let messages = self.messages.read().unwrap_or_else(PoisonError::into_inner);
        messages
            .iter()
            .find(|(m, _)| &m.id == id)
            .map(|(_, content)| content.clone())
            .ok_or_else(|| ApiError::NotFound(id.to_string()))
    }
}
