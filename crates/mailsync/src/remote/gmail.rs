//! Gmail mailbox profile

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde::Deserialize;
use url::Url;

use super::http::HttpClient;
use super::{ListQuery, MailApi, MessagePage, PageCursor};
use crate::error::ApiError;
use crate::models::MessageRef;

/// Gmail sends URL-safe base64 and is inconsistent about padding
const RAW_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Gmail API client for listing and downloading messages
pub struct GmailApi {
    http: HttpClient,
    base_url: String,
}

/// Response from listing messages
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMessagesResponse {
    messages: Option<Vec<GmailMessageRef>>,
    next_page_token: Option<String>,
}

/// Reference to a message (just ID and thread ID)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessageRef {
    id: String,
    thread_id: Option<String>,
}

/// Message fetched with `format=raw`
#[derive(Debug, Deserialize)]
struct RawMessage {
    raw: String,
}

impl GmailApi {
    /// Gmail API base URL
    const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";

    /// Maximum page size accepted by the list endpoint
    const PAGE_SIZE: u32 = 500;

    pub fn new(http: HttpClient) -> Self {
        Self {
            http,
            base_url: Self::BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn page_url(&self, query: &ListQuery, cursor: Option<&PageCursor>) -> Result<Url, ApiError> {
        let mut params = vec![("maxResults".to_string(), Self::PAGE_SIZE.to_string())];
        if let Some(q) = search_query(query) {
            params.push(("q".to_string(), q));
        }
        if let Some(token) = cursor {
            params.push(("pageToken".to_string(), token.as_str().to_string()));
        }

        let base = format!("{}/users/me/messages", self.base_url);
        Url::parse_with_params(&base, &params).map_err(|e| ApiError::Request {
            status: 0,
            message: format!("Invalid list URL: {}", e),
        })
    }
}

impl MailApi for GmailApi {
    fn list_page(
        &self,
        access_token: &str,
        query: &ListQuery,
        cursor: Option<&PageCursor>,
    ) -> Result<MessagePage, ApiError> {
        let url = self.page_url(query, cursor)?;
        let list: ListMessagesResponse = self.http.get_json(url.as_str(), access_token)?;

        let messages = list
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(|m| MessageRef {
                id: m.id.into(),
                parent_folder_id: m.thread_id,
                last_modified: None,
            })
            .collect();

        Ok(MessagePage {
            messages,
            next: list.next_page_token.map(PageCursor),
        })
    }

    fn get_message(&self, access_token: &str, message: &MessageRef) -> Result<Vec<u8>, ApiError> {
        let url = format!(
            "{}/users/me/messages/{}?format=raw",
            self.base_url,
            urlencoding::encode(message.id.as_str())
        );
        let raw: RawMessage = self.http.get_json(&url, access_token)?;
        decode_raw(&raw.raw)
    }
}

/// Combine the user filter with the date bounds into a Gmail search query
pub(crate) fn search_query(query: &ListQuery) -> Option<String> {
    let mut terms = Vec::new();
    if let Some(filter) = query.filter.as_deref().filter(|f| !f.trim().is_empty()) {
        terms.push(filter.to_string());
    }
    if let Some(start) = query.start_date {
        terms.push(format!("after:{}", start.format("%Y/%m/%d")));
    }
    // `before:` is exclusive, the end date is not
    if let Some(end) = query.end_date.and_then(|d| d.succ_opt()) {
        terms.push(format!("before:{}", end.format("%Y/%m/%d")));
    }

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

fn decode_raw(raw: &str) -> Result<Vec<u8>, ApiError> {
    RAW_ENGINE
        .decode(raw.trim())
        .map_err(|e| ApiError::Decode(format!("Invalid raw message encoding: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_search_query() {
        let query = ListQuery {
            filter: Some("in:sent".into()),
            start_date: NaiveDate::from_ymd_opt(2023, 9, 1),
            end_date: NaiveDate::from_ymd_opt(2023, 9, 15),
        };
        assert_eq!(
            search_query(&query).as_deref(),
            Some("in:sent after:2023/09/01 before:2023/09/16")
        );
        assert_eq!(search_query(&ListQuery::default()), None);
    }

    #[test]
    fn test_filter_is_not_rewritten() {
        let query = ListQuery {
            filter: Some("from:alice  subject:\"weekly report\" ".into()),
            ..Default::default()
        };
        assert_eq!(
            search_query(&query).as_deref(),
            Some("from:alice  subject:\"weekly report\" ")
        );

        let blank = ListQuery {
            filter: Some(" ".into()),
            ..Default::default()
        };
        assert_eq!(search_query(&blank), None);
    }

    #[test]
    fn test_page_url_carries_token() {
        let api = GmailApi::new(HttpClient::new());
        let url = api
            .page_url(&ListQuery::default(), Some(&PageCursor("abc123".into())))
            .unwrap();

        let params: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(params.contains(&("pageToken".to_string(), "abc123".to_string())));
        assert!(params.contains(&("maxResults".to_string(), "500".to_string())));
        assert!(!params.iter().any(|(k, _)| k == "q"));
    }

    #[test]
    fn test_parse_list_response() {
        let json = r#"{
            "messages": [
                { "id": "18a4f", "threadId": "18a4e" },
                { "id": "18a50", "threadId": "18a50" }
            ],
            "nextPageToken": "token-2",
            "resultSizeEstimate": 2
        }"#;

        let list: ListMessagesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(list.messages.unwrap().len(), 2);
        assert_eq!(list.next_page_token.as_deref(), Some("token-2"));
    }

    #[test]
    fn test_parse_empty_mailbox() {
        let list: ListMessagesResponse =
            serde_json::from_str(r#"{ "resultSizeEstimate": 0 }"#).unwrap();
        assert!(list.messages.is_none());
    }

    #[test]
    fn test_decode_raw_padding_modes() {
        let body = b"Subject: hi\r\n\r\nhello?>";
        let padded = base64::engine::general_purpose::URL_SAFE.encode(body);
        let unpadded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(body);

        assert_eq!(decode_raw(&padded).unwrap(), body);
        assert_eq!(decode_raw(&unpadded).unwrap(), body);
        assert!(decode_raw("not base64!").is_err());
    }
}
