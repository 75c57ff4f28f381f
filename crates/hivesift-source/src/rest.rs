use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use hivesift_schema::{AuthorRole, Conversation, ConversationFilter, Message, SourceKind};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::{newest_first_truncate, ConversationSource, SourceError};

const DEFAULT_PAGE_SIZE: usize = 50;
const DEFAULT_MAX_PARALLEL: usize = 4;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Request/response backend: a paged search endpoint. Pages after the
/// first are fetched concurrently up to a bounded window and assembled
/// in page order before anything is returned.
#[derive(Debug, Clone)]
pub struct RestSource {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
    page_size: usize,
    max_parallel: usize,
    timeout: Duration,
}

impl RestSource {
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            max_parallel: DEFAULT_MAX_PARALLEL,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    async fn fetch_page(
        &self,
        filter: &ConversationFilter,
        page: usize,
    ) -> Result<ApiPage, SourceError> {
        let url = format!("{}/api/v1/conversations/search", self.api_base);
        let mut query: Vec<(&str, String)> = vec![
            ("start", filter.interval.start.to_rfc3339()),
            ("end", filter.interval.end.to_rfc3339()),
            ("page", page.to_string()),
            ("per_page", self.page_size.to_string()),
        ];
        if let Some(terms) = &filter.terms {
            query.push(("q", terms.clone()));
        }

        let resp = self
            .client
            .get(url)
            .header("authorization", format!("Bearer {}", self.api_key))
            .query(&query)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await.unwrap_or_default();
            let parsed = serde_json::from_str::<ApiError>(&text).ok();
            return Err(format_api_error(status, parsed));
        }

        resp.json::<ApiPage>()
            .await
            .map_err(|e| SourceError::unavailable(SourceKind::Rest, format!("bad payload: {e}")))
    }

    async fn fetch_all(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, SourceError> {
        let first = self.fetch_page(filter, 1).await?;
        let total_pages = first.total_pages.max(1);
        let mut pages = vec![first];

        if total_pages > 1 {
            let results: Vec<Result<ApiPage, SourceError>> = stream::iter(2..=total_pages)
                .map(|page| self.fetch_page(filter, page))
                .buffered(self.max_parallel)
                .collect()
                .await;
            for result in results {
                pages.push(result?);
            }
        }

        let conversations: Vec<Conversation> = pages
            .into_iter()
            .flat_map(|p| p.conversations)
            .map(ApiConversation::into_conversation)
            .collect();
        tracing::debug!(
            pages = total_pages,
            count = conversations.len(),
            "assembled rest pages"
        );
        Ok(newest_first_truncate(conversations, filter.max_count))
    }
}

#[async_trait]
impl ConversationSource for RestSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Rest
    }

    async fn fetch(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, SourceError> {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, self.fetch_all(filter)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::timeout(
                SourceKind::Rest,
                started.elapsed().as_millis() as u64,
            )),
        }
    }
}

fn map_transport_error(err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::timeout(SourceKind::Rest, 0)
    } else if err.is_connect() {
        SourceError::unavailable(SourceKind::Rest, "connect failed")
    } else {
        SourceError::unavailable(SourceKind::Rest, err.to_string())
    }
}

fn format_api_error(status: StatusCode, parsed: Option<ApiError>) -> SourceError {
    let reason = match (status, parsed) {
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => {
            format!("auth rejected ({status})")
        }
        (_, Some(api_error)) => {
            format!("rest api error ({status}): {}", api_error.error.message)
        }
        (_, None) => format!("rest api error ({status})"),
    };
    SourceError::unavailable(SourceKind::Rest, reason)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiPage {
    pub conversations: Vec<ApiConversation>,
    pub page: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiConversation {
    pub id: String,
    #[serde(default)]
    pub customer_email: Option<String>,
    pub messages: Vec<ApiMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub link: String,
}

impl ApiConversation {
    fn into_conversation(self) -> Conversation {
        Conversation {
            id: self.id,
            customer_email: self.customer_email,
            messages: self.messages.into_iter().map(ApiMessage::into_message).collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            link: self.link,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiMessage {
    pub author: String,
    pub body: String,
    pub at: DateTime<Utc>,
}

impl ApiMessage {
    fn into_message(self) -> Message {
        let role = match self.author.as_str() {
            "customer" => AuthorRole::Customer,
            "agent" => AuthorRole::Agent,
            _ => AuthorRole::System,
        };
        Message {
            role,
            text: self.body,
            at: self.at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiError {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiErrorDetail {
    pub message: String,
}
