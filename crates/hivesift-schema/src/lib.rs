pub mod insight;

pub use insight::*;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorRole {
    Customer,
    Agent,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: AuthorRole,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// One support conversation as returned by a backend. Never mutated
/// after retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub customer_email: Option<String>,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub link: String,
}

impl Conversation {
    pub fn first_message(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeInterval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// Value object built once per query; the retrieval contract for both
/// backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationFilter {
    pub interval: TimeInterval,
    #[serde(default)]
    pub max_count: Option<usize>,
    #[serde(default)]
    pub terms: Option<String>,
}

impl ConversationFilter {
    pub fn for_interval(interval: TimeInterval) -> Self {
        Self {
            interval,
            max_count: None,
            terms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Rest,
    Stream,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Rest => "rest",
            SourceKind::Stream => "stream",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance attached to a fetched corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusMeta {
    pub source: SourceKind,
    pub fetch_elapsed: Duration,
    pub fell_back: bool,
    pub compressed: bool,
}

/// The conversations selected for one query, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Corpus {
    pub conversations: Vec<Conversation>,
    pub meta: CorpusMeta,
}

impl Corpus {
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn message_count(&self) -> usize {
        self.conversations.iter().map(|c| c.messages.len()).sum()
    }

    /// Count plus a hash over sorted conversation ids. Insensitive to
    /// retrieval order so REST and stream results fingerprint alike.
    pub fn fingerprint(&self) -> CorpusFingerprint {
        let mut ids: Vec<&str> = self.conversations.iter().map(|c| c.id.as_str()).collect();
        ids.sort_unstable();
        let mut hasher = Sha256::new();
        for id in &ids {
            hasher.update(id.as_bytes());
            hasher.update(b"\n");
        }
        CorpusFingerprint {
            count: self.conversations.len(),
            ids_sha256: format!("{:x}", hasher.finalize()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusFingerprint {
    pub count: usize,
    pub ids_sha256: String,
}

/// A conversation whose body was excluded from the prompt. Id and link
/// survive so the model can still be answered about it by reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedConversation {
    pub id: String,
    pub link: String,
}

/// Size-bounded rendering of a corpus. Derived from a `Corpus` exactly
/// once; re-rendering under the same budget is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedCorpus {
    pub text: String,
    pub conversation_count: usize,
    pub dropped: Vec<DroppedConversation>,
    pub budget_chars: usize,
    pub compressed: bool,
}

/// Per-session retrieval context. One record per session id; the
/// orchestrator is the sole writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub last_interval: Option<TimeInterval>,
    pub last_fingerprint: Option<CorpusFingerprint>,
    pub last_query: Option<String>,
    pub has_conversations: bool,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            last_interval: None,
            last_fingerprint: None,
            last_query: None,
            has_conversations: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ResolvingTimeframe,
    SelectingSource,
    Fetching,
    Compressing,
    Analyzing,
    UpdatingSession,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ResolvingTimeframe => "resolving_timeframe",
            Stage::SelectingSource => "selecting_source",
            Stage::Fetching => "fetching",
            Stage::Compressing => "compressing",
            Stage::Analyzing => "analyzing",
            Stage::UpdatingSession => "updating_session",
            Stage::Done => "done",
        }
    }

    pub fn percent(&self) -> u8 {
        match self {
            Stage::ResolvingTimeframe => 10,
            Stage::SelectingSource => 25,
            Stage::Fetching => 45,
            Stage::Compressing => 65,
            Stage::Analyzing => 85,
            Stage::UpdatingSession => 95,
            Stage::Done => 100,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AllSourcesExhausted,
    UnstructuredResponse,
    CompressionBudgetUnreachable,
    Cancelled,
    Internal,
}

/// Structured failure surfaced to the caller. Never a raw transport
/// stack trace: stage, kind, session and an action hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryFailure {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub session_id: String,
    pub hint: String,
    pub detail: String,
}

impl std::fmt::Display for QueryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "query failed at {}: {} ({})",
            self.stage, self.detail, self.hint
        )
    }
}

impl std::error::Error for QueryFailure {}

/// Progress boundary payloads: one `StageChanged` per orchestrator
/// transition, terminated by exactly one `Completed` or `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryEvent {
    StageChanged {
        trace_id: Uuid,
        session_id: String,
        stage: Stage,
        message: String,
        percent: u8,
    },
    Completed {
        trace_id: Uuid,
        session_id: String,
        result: AnalysisResult,
    },
    Failed {
        trace_id: Uuid,
        failure: QueryFailure,
    },
}
