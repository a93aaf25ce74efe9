//! Lazy, retrying enumeration of the remote mailbox

use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::Arc;

use super::{ListQuery, MailApi, MessagePage, PageCursor, RetryPolicy};
use crate::auth::TokenManager;
use crate::error::{ApiError, AuthError, SyncError};
use crate::models::MessageRef;

/// Lists remote messages page by page
pub struct MessageLister {
    api: Arc<dyn MailApi>,
    tokens: Arc<TokenManager>,
    retry: RetryPolicy,
}

impl MessageLister {
    pub fn new(api: Arc<dyn MailApi>, tokens: Arc<TokenManager>, retry: RetryPolicy) -> Self {
        Self { api, tokens, retry }
    }

    /// Start a listing from the first page
    ///
    /// Nothing is requested until the stream is polled. A listing cannot be
    /// resumed; call `list` again to start over.
    pub fn list(&self, query: ListQuery) -> MessageStream<'_> {
        MessageStream {
            lister: self,
            query,
            buffer: VecDeque::new(),
            cursor: None,
            started: false,
            finished: false,
            pages: 0,
        }
    }

    /// Fetch one page, refreshing the token once on 401 and retrying
    /// transient failures with backoff
    fn fetch_page(&self, query: &ListQuery, cursor: Option<&PageCursor>) -> Result<MessagePage, SyncError> {
        let mut retries = 0;
        let mut refreshed = false;

        loop {
            let token = self.tokens.get_valid_token()?;
            let err = match self.api.list_page(&token, query, cursor) {
                Ok(page) => return Ok(page),
                Err(e) => e,
            };

            match err {
                ApiError::Unauthorized if !refreshed => {
                    debug!("Listing request unauthorized, refreshing token");
                    refreshed = true;
                    self.tokens.refresh_after_unauthorized(&token)?;
                }
                ApiError::Unauthorized => return Err(AuthError::TokenRejected.into()),
                e if e.is_transient() && retries < self.retry.max_retries => {
                    retries += 1;
                    warn!(
                        "Listing request failed, retrying ({}/{}): {}",
                        retries, self.retry.max_retries, e
                    );
                    self.retry.pause(retries, e.retry_after());
                }
                e if e.is_transient() => {
                    return Err(SyncError::Transient {
                        retries,
                        message: e.to_string(),
                    });
                }
                e => return Err(SyncError::Remote(e)),
            }
        }
    }
}

/// Iterator over the messages of one listing
///
/// Yields at most one error, after which it is exhausted.
pub struct MessageStream<'a> {
    lister: &'a MessageLister,
    query: ListQuery,
    buffer: VecDeque<MessageRef>,
    cursor: Option<PageCursor>,
    started: bool,
    finished: bool,
    pages: usize,
}

impl Iterator for MessageStream<'_> {
    type Item = Result<MessageRef, SyncError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(message) = self.buffer.pop_front() {
                return Some(Ok(message));
            }
            if self.finished || (self.started && self.cursor.is_none()) {
                self.finished = true;
                return None;
            }

            match self.lister.fetch_page(&self.query, self.cursor.as_ref()) {
                Ok(page) => {
                    self.started = true;
                    self.pages += 1;
                    debug!(
                        "Listing page {} returned {} messages",
                        self.pages,
                        page.messages.len()
                    );
                    self.cursor = page.next;
                    self.buffer.extend(page.messages);
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
