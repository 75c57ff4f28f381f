use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hivesift_schema::{AuthorRole, Conversation, ConversationFilter, Message, SourceKind};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{matches_terms, newest_first_truncate, ConversationSource, SourceError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Cache-feed backend: a daemon that mirrors the conversation stream
/// and serves snapshots over a session handle. The handle is dialed
/// lazily, reused across requests, and re-dialed at most once per fetch
/// when the daemon reports it expired. A dead daemon surfaces as
/// `Unavailable`, never as a hang. Snapshots may lag the live system;
/// staleness is accepted by contract.
pub struct StreamSource {
    client: reqwest::Client,
    feed_base: String,
    timeout: Duration,
    session: Mutex<Option<String>>,
}

impl StreamSource {
    pub fn new(feed_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            feed_base: feed_base.into().trim_end_matches('/').to_string(),
            timeout: DEFAULT_TIMEOUT,
            session: Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn handshake(&self) -> Result<String, SourceError> {
        let url = format!("{}/feed/handshake", self.feed_base);
        let resp = self
            .client
            .post(url)
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = resp.status();
        if status != StatusCode::OK {
            return Err(SourceError::unavailable(
                SourceKind::Stream,
                format!("handshake rejected ({status})"),
            ));
        }
        let body: Handshake = resp.json().await.map_err(|e| {
            SourceError::unavailable(SourceKind::Stream, format!("bad handshake payload: {e}"))
        })?;
        Ok(body.session)
    }

    async fn current_session(&self) -> Result<String, SourceError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let session = self.handshake().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn drop_session(&self) {
        *self.session.lock().await = None;
    }

    async fn snapshot(
        &self,
        session: &str,
        filter: &ConversationFilter,
    ) -> Result<SnapshotOutcome, SourceError> {
        let url = format!("{}/feed/snapshot", self.feed_base);
        let resp = self
            .client
            .get(url)
            .query(&[
                ("session", session.to_string()),
                ("start", filter.interval.start.to_rfc3339()),
                ("end", filter.interval.end.to_rfc3339()),
            ])
            .send()
            .await
            .map_err(map_transport_error)?;

        match resp.status() {
            StatusCode::OK => {
                let body: FeedSnapshot = resp.json().await.map_err(|e| {
                    SourceError::unavailable(
                        SourceKind::Stream,
                        format!("bad snapshot payload: {e}"),
                    )
                })?;
                Ok(SnapshotOutcome::Ready(body))
            }
            StatusCode::GONE => Ok(SnapshotOutcome::SessionExpired),
            status => Err(SourceError::unavailable(
                SourceKind::Stream,
                format!("snapshot rejected ({status})"),
            )),
        }
    }

    async fn fetch_snapshot(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, SourceError> {
        let session = self.current_session().await?;
        let snapshot = match self.snapshot(&session, filter).await? {
            SnapshotOutcome::Ready(snapshot) => snapshot,
            SnapshotOutcome::SessionExpired => {
                // One re-dial; a second expiry means the daemon is sick.
                tracing::warn!("feed session expired, re-dialing");
                self.drop_session().await;
                let session = self.current_session().await?;
                match self.snapshot(&session, filter).await? {
                    SnapshotOutcome::Ready(snapshot) => snapshot,
                    SnapshotOutcome::SessionExpired => {
                        self.drop_session().await;
                        return Err(SourceError::unavailable(
                            SourceKind::Stream,
                            "feed session expired twice",
                        ));
                    }
                }
            }
        };

        let conversations: Vec<Conversation> = snapshot
            .conversations
            .into_iter()
            .map(FeedConversation::into_conversation)
            .filter(|c| filter.interval.contains(c.created_at))
            .filter(|c| matches_terms(c, filter.terms.as_deref()))
            .collect();
        Ok(newest_first_truncate(conversations, filter.max_count))
    }
}

#[async_trait]
impl ConversationSource for StreamSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Stream
    }

    async fn fetch(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, SourceError> {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, self.fetch_snapshot(filter)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::timeout(
                SourceKind::Stream,
                started.elapsed().as_millis() as u64,
            )),
        }
    }

    async fn health(&self) -> Result<(), SourceError> {
        let url = format!("{}/feed/health", self.feed_base);
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(map_transport_error)?;
        if resp.status() == StatusCode::OK {
            Ok(())
        } else {
            Err(SourceError::unavailable(
                SourceKind::Stream,
                format!("health probe failed ({})", resp.status()),
            ))
        }
    }
}

enum SnapshotOutcome {
    Ready(FeedSnapshot),
    SessionExpired,
}

fn map_transport_error(err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::timeout(SourceKind::Stream, 0)
    } else if err.is_connect() {
        SourceError::unavailable(SourceKind::Stream, "connect failed")
    } else {
        SourceError::unavailable(SourceKind::Stream, err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Handshake {
    pub session: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FeedSnapshot {
    pub conversations: Vec<FeedConversation>,
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FeedConversation {
    pub id: String,
    #[serde(default)]
    pub customer_email: Option<String>,
    pub messages: Vec<FeedMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub link: String,
}

impl FeedConversation {
    fn into_conversation(self) -> Conversation {
        Conversation {
            id: self.id,
            customer_email: self.customer_email,
            messages: self.messages.into_iter().map(FeedMessage::into_message).collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            link: self.link,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FeedMessage {
    pub role: String,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl FeedMessage {
    fn into_message(self) -> Message {
        let role = match self.role.as_str() {
            "customer" => AuthorRole::Customer,
            "agent" => AuthorRole::Agent,
            _ => AuthorRole::System,
        };
        Message {
            role,
            text: self.text,
            at: self.at,
        }
    }
}
