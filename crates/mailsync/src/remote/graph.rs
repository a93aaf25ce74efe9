//! Microsoft Graph (Office 365) mailbox profile

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use url::Url;

use super::http::HttpClient;
use super::{ListQuery, MailApi, MessagePage, PageCursor};
use crate::error::ApiError;
use crate::models::MessageRef;

/// Microsoft Graph API client for listing and downloading messages
pub struct GraphApi {
    http: HttpClient,
    base_url: String,
    page_size: u32,
}

/// Response from listing messages
#[derive(Debug, Deserialize)]
struct ListMessagesResponse {
    #[serde(default)]
    value: Vec<GraphMessageRef>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessageRef {
    id: String,
    parent_folder_id: Option<String>,
    last_modified_date_time: Option<DateTime<Utc>>,
}

impl From<GraphMessageRef> for MessageRef {
    fn from(m: GraphMessageRef) -> Self {
        MessageRef {
            id: m.id.into(),
            parent_folder_id: m.parent_folder_id,
            last_modified: m.last_modified_date_time,
        }
    }
}

impl GraphApi {
    /// Graph API base URL
    const BASE_URL: &'static str = "https://graph.microsoft.com/v1.0";

    /// Messages requested per page
    const PAGE_SIZE: u32 = 100;

    pub fn new(http: HttpClient) -> Self {
        Self {
            http,
            base_url: Self::BASE_URL.to_string(),
            page_size: Self::PAGE_SIZE,
        }
    }

    /// Point the client at a different Graph endpoint (national clouds, test servers)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Build the URL of the first listing page
    fn first_page_url(&self, query: &ListQuery) -> Result<Url, ApiError> {
        let mut params = vec![
            (
                "$select".to_string(),
                "id,parentFolderId,lastModifiedDateTime".to_string(),
            ),
            ("$top".to_string(), self.page_size.to_string()),
        ];
        if let Some(filter) = filter_expression(query) {
            params.push(("$filter".to_string(), filter));
        }

        let base = format!("{}/me/messages", self.base_url);
        Url::parse_with_params(&base, &params).map_err(|e| ApiError::Request {
            status: 0,
            message: format!("Invalid list URL: {}", e),
        })
    }
}

impl MailApi for GraphApi {
    fn list_page(
        &self,
        access_token: &str,
        query: &ListQuery,
        cursor: Option<&PageCursor>,
    ) -> Result<MessagePage, ApiError> {
        // Graph hands back a complete URL for the next page
        let url = match cursor {
            Some(next_link) => next_link.as_str().to_string(),
            None => self.first_page_url(query)?.to_string(),
        };

        let list: ListMessagesResponse = self.http.get_json(&url, access_token)?;

        Ok(MessagePage {
            messages: list.value.into_iter().map(MessageRef::from).collect(),
            next: list.next_link.map(PageCursor),
        })
    }

    fn get_message(&self, access_token: &str, message: &MessageRef) -> Result<Vec<u8>, ApiError> {
        let url = format!(
            "{}/me/messages/{}/$value",
            self.base_url,
            urlencoding::encode(message.id.as_str())
        );
        self.http.get_bytes(&url, access_token)
    }
}

/// Combine the user filter with the date bounds into an OData `$filter`
///
/// The user filter is passed through untouched when there are no date
/// bounds, and parenthesized when it has to be joined with them.
pub(crate) fn filter_expression(query: &ListQuery) -> Option<String> {
    let user_filter = query
        .filter
        .as_deref()
        .filter(|f| !f.trim().is_empty());

    let mut date_clauses = Vec::new();
    if let Some(start) = query.start_date {
        date_clauses.push(format!("receivedDateTime ge {}", odata_midnight(start)));
    }
    if let Some(end) = query.end_date.and_then(|d| d.succ_opt()) {
        date_clauses.push(format!("receivedDateTime lt {}", odata_midnight(end)));
    }

    match (user_filter, date_clauses.is_empty()) {
        (None, true) => None,
        (Some(filter), true) => Some(filter.to_string()),
        (None, false) => Some(date_clauses.join(" and ")),
        (Some(filter), false) => Some(format!("({}) and {}", filter, date_clauses.join(" and "))),
    }
}

fn odata_midnight(date: NaiveDate) -> String {
    format!("{}T00:00:00Z", date.format("%Y-%m-%d"))
}
