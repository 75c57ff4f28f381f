//! Per-session retrieval context.
//!
//! A pure state container keyed by session id. Detection of follow-up
//! queries happens upstream in the orchestrator; writes are serialized
//! per session by `SessionLockManager`.

use std::collections::HashMap;

use hivesift_schema::{Corpus, SessionState, TimeInterval};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub state: SessionState,
    /// Retained so a follow-up can re-analyze without re-fetching; the
    /// fingerprint in `state` is the integrity check for this cache.
    pub last_corpus: Option<Corpus>,
}

#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absent means "no prior context", never an error.
    pub async fn get(&self, session_id: &str) -> Option<SessionState> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|r| r.state.clone())
    }

    pub async fn cached_corpus(&self, session_id: &str) -> Option<Corpus> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|r| r.last_corpus.clone())
    }

    pub async fn update(
        &self,
        session_id: &str,
        query: &str,
        interval: TimeInterval,
        corpus: &Corpus,
    ) {
        let state = SessionState {
            session_id: session_id.to_string(),
            last_interval: Some(interval),
            last_fingerprint: Some(corpus.fingerprint()),
            last_query: Some(query.to_string()),
            has_conversations: !corpus.is_empty(),
        };
        let record = SessionRecord {
            state,
            last_corpus: Some(corpus.clone()),
        };
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), record);
    }
}
