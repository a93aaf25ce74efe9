//! Retrying download of individual messages

use log::debug;
use std::sync::Arc;

use super::{MailApi, RetryPolicy};
use crate::auth::TokenManager;
use crate::error::{ApiError, AuthError, FetchError};
use crate::models::MessageRef;

/// Downloads raw message content, shared by all workers of a run
pub struct MessageFetcher {
    api: Arc<dyn MailApi>,
    tokens: Arc<TokenManager>,
    retry: RetryPolicy,
}

impl MessageFetcher {
    pub fn new(api: Arc<dyn MailApi>, tokens: Arc<TokenManager>, retry: RetryPolicy) -> Self {
        Self { api, tokens, retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Download the content of `message`
    ///
    /// `on_retry` is called with the failure and the 1-based retry number
    /// before each retry of a transient failure. A 401 triggers one token
    /// refresh that does not count as a retry.
    pub fn fetch(
        &self,
        message: &MessageRef,
        mut on_retry: impl FnMut(&ApiError, u32),
    ) -> Result<Vec<u8>, FetchError> {
        let mut retries = 0;
        let mut refreshed = false;

        loop {
            let token = self.tokens.get_valid_token()?;
            let err = match self.api.get_message(&token, message) {
                Ok(content) => return Ok(content),
                Err(e) => e,
            };

            match err {
                ApiError::Unauthorized if !refreshed => {
                    debug!("Download of {} unauthorized, refreshing token", message.id);
                    refreshed = true;
                    self.tokens.refresh_after_unauthorized(&token)?;
                }
                ApiError::Unauthorized => return Err(AuthError::TokenRejected.into()),
                e if e.is_transient() && retries < self.retry.max_retries => {
                    retries += 1;
                    on_retry(&e, retries);
                    self.retry.pause(retries, e.retry_after());
                }
                ApiError::Transient { message: reason, .. } => {
                    return Err(FetchError::Transient {
                        retries,
                        message: reason,
                    });
                }
                e => return Err(e.into()),
            }
        }
    }
}
