//! Remote mailbox access
//!
//! This module provides:
//! - The [`MailApi`] abstraction over a paginated list + get-by-id REST API
//! - Provider profiles for Microsoft Graph (Office 365) and Gmail
//! - An in-memory mailbox for tests and dry runs
//! - The retrying [`MessageLister`] and [`MessageFetcher`] used by the engine

mod fetcher;
mod gmail;
mod graph;
mod http;
mod lister;
mod memory;
mod retry;

use chrono::NaiveDate;

use crate::error::ApiError;
use crate::models::MessageRef;

pub use fetcher::MessageFetcher;
pub use gmail::GmailApi;
pub use graph::GraphApi;
pub use http::HttpClient;
pub use lister::{MessageLister, MessageStream};
pub use memory::InMemoryMailbox;
pub use retry::RetryPolicy;

/// Restriction applied to the remote listing
///
/// The filter is a provider-specific expression passed through verbatim.
/// Dates are inclusive calendar days.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub filter: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl ListQuery {
    /// Whether the listing is narrower than the whole mailbox
    pub fn is_restricted(&self) -> bool {
        self.filter.as_deref().is_some_and(|f| !f.trim().is_empty())
            || self.start_date.is_some()
            || self.end_date.is_some()
    }
}

/// Opaque position in a remote listing (a next-page link or page token)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor(pub String);

impl PageCursor {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of a remote listing
#[derive(Debug, Default)]
pub struct MessagePage {
    pub messages: Vec<MessageRef>,
    /// Cursor of the following page, `None` on the last page
    pub next: Option<PageCursor>,
}

/// A remote mailbox reachable with a bearer token
///
/// Implementations perform exactly one request per call; retries, token
/// refresh and backoff are layered on top by the lister and fetcher.
pub trait MailApi: Send + Sync {
    /// Fetch one page of message references
    ///
    /// `cursor` is `None` for the first page.
    fn list_page(
        &self,
        access_token: &str,
        query: &ListQuery,
        cursor: Option<&PageCursor>,
    ) -> Result<MessagePage, ApiError>;

    /// Download the raw RFC 822 content of a message
    fn get_message(&self, access_token: &str, message: &MessageRef) -> Result<Vec<u8>, ApiError>;
}
