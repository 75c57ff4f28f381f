//! Source selection and fallback.
//!
//! Retry lives here and only here: one retry per source with a short
//! fixed backoff, then the next source in preferred order. The
//! orchestrator never retries on top of this.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hivesift_schema::{Conversation, ConversationFilter, SourceKind};
use hivesift_source::{ConversationSource, SourceError};

pub const RETRY_BACKOFF_MS: u64 = 250;

/// The outcome of one source walk. An empty conversation list is a
/// final answer, not a failure.
#[derive(Debug)]
pub struct Selection {
    pub conversations: Vec<Conversation>,
    pub used: SourceKind,
    pub fell_back: bool,
    pub fetch_elapsed: Duration,
}

/// Every source failed; the last error per attempted source rides
/// along for diagnostics.
#[derive(Debug)]
pub struct AllSourcesExhausted {
    pub attempts: Vec<(SourceKind, SourceError)>,
}

impl std::fmt::Display for AllSourcesExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let summary = self
            .attempts
            .iter()
            .map(|(kind, err)| format!("{kind}: {err}"))
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "all conversation sources exhausted: {summary}")
    }
}

impl std::error::Error for AllSourcesExhausted {}

pub struct SourceSelector {
    sources: Vec<Arc<dyn ConversationSource>>,
    retry_backoff: Duration,
}

impl SourceSelector {
    /// `sources` in preferred order; the default deployment is
    /// `[stream, rest]`.
    pub fn new(sources: Vec<Arc<dyn ConversationSource>>) -> Self {
        Self {
            sources,
            retry_backoff: Duration::from_millis(RETRY_BACKOFF_MS),
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub async fn select(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Selection, AllSourcesExhausted> {
        let started = Instant::now();
        let mut attempts: Vec<(SourceKind, SourceError)> = Vec::new();

        for source in &self.sources {
            match self.fetch_with_retry(source.as_ref(), filter).await {
                Ok(conversations) => {
                    let fell_back = !attempts.is_empty();
                    if fell_back {
                        tracing::info!(used = %source.kind(), "fell back to secondary source");
                    }
                    return Ok(Selection {
                        conversations,
                        used: source.kind(),
                        fell_back,
                        fetch_elapsed: started.elapsed(),
                    });
                }
                Err(err) => {
                    tracing::warn!(source = %source.kind(), error = %err, "source failed");
                    attempts.push((source.kind(), err));
                }
            }
        }

        Err(AllSourcesExhausted { attempts })
    }

    async fn fetch_with_retry(
        &self,
        source: &dyn ConversationSource,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, SourceError> {
        match source.fetch(filter).await {
            Ok(conversations) => Ok(conversations),
            Err(first) => {
                tracing::warn!(source = %source.kind(), error = %first, "retrying once");
                tokio::time::sleep(self.retry_backoff).await;
                source.fetch(filter).await
            }
        }
    }
}
