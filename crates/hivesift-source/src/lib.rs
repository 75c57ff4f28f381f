pub mod rest;
pub mod stream;

pub use rest::RestSource;
pub use stream::StreamSource;

use async_trait::async_trait;
use hivesift_schema::{Conversation, ConversationFilter, SourceKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{kind} source unavailable: {reason}")]
    Unavailable { kind: SourceKind, reason: String },
    #[error("{kind} source timed out after {waited_ms}ms")]
    Timeout { kind: SourceKind, waited_ms: u64 },
}

impl SourceError {
    pub fn unavailable(kind: SourceKind, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            kind,
            reason: reason.into(),
        }
    }

    pub fn timeout(kind: SourceKind, waited_ms: u64) -> Self {
        Self::Timeout { kind, waited_ms }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Unavailable { kind, .. } | Self::Timeout { kind, .. } => *kind,
        }
    }
}

/// A conversation backend. Exactly two implementations exist and the
/// selector's fallback logic relies on that set staying closed.
///
/// Contract shared by both adapters:
/// - the returned list is newest-first by `created_at` and truncated to
///   `filter.max_count`, so a fallback never changes result shape;
/// - zero matches is `Ok(vec![])`, a final answer rather than an error;
/// - on error nothing partial is returned.
#[async_trait]
pub trait ConversationSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn fetch(&self, filter: &ConversationFilter)
        -> Result<Vec<Conversation>, SourceError>;

    async fn health(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Shared truncation policy: newest first by `created_at`, ties by id
/// so the order is total and both backends agree on it.
pub fn newest_first_truncate(
    mut conversations: Vec<Conversation>,
    max_count: Option<usize>,
) -> Vec<Conversation> {
    conversations.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    if let Some(max) = max_count {
        conversations.truncate(max);
    }
    conversations
}

/// Local term filter used by the snapshot-style backend; the REST
/// backend pushes the same constraint to the server.
pub fn matches_terms(conversation: &Conversation, terms: Option<&str>) -> bool {
    let Some(terms) = terms else { return true };
    let needle = terms.to_lowercase();
    needle.split_whitespace().all(|word| {
        conversation
            .messages
            .iter()
            .any(|m| m.text.to_lowercase().contains(word))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use hivesift_schema::{AuthorRole, Message};

    fn conversation(id: &str, age_hours: i64, text: &str) -> Conversation {
        let at = Utc::now() - Duration::hours(age_hours);
        Conversation {
            id: id.into(),
            customer_email: None,
            messages: vec![Message {
                role: AuthorRole::Customer,
                text: text.into(),
                at,
            }],
            created_at: at,
            updated_at: at,
            link: format!("https://desk.example.com/conversations/{id}"),
        }
    }

    #[test]
    fn truncation_keeps_most_recent() {
        let conversations = vec![
            conversation("old", 48, "a"),
            conversation("new", 1, "b"),
            conversation("mid", 24, "c"),
        ];
        let kept = newest_first_truncate(conversations, Some(2));
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].id, "new");
        assert_eq!(kept[1].id, "mid");
    }

    #[test]
    fn truncation_without_limit_only_sorts() {
        let conversations = vec![conversation("b", 2, "x"), conversation("a", 1, "y")];
        let kept = newest_first_truncate(conversations, None);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].id, "a");
    }

    #[test]
    fn term_filter_requires_all_words() {
        let c = conversation("c1", 1, "the checkout page crashes on submit");
        assert!(matches_terms(&c, Some("checkout crashes")));
        assert!(!matches_terms(&c, Some("checkout billing")));
        assert!(matches_terms(&c, None));
    }

    #[test]
    fn term_filter_is_case_insensitive() {
        let c = conversation("c1", 1, "Refund REQUEST pending");
        assert!(matches_terms(&c, Some("refund request")));
    }

    #[test]
    fn error_display_names_the_source() {
        let e = SourceError::unavailable(SourceKind::Stream, "connect refused");
        assert_eq!(e.to_string(), "stream source unavailable: connect refused");
        let t = SourceError::timeout(SourceKind::Rest, 5000);
        assert!(t.to_string().contains("rest source timed out"));
        assert_eq!(t.kind(), SourceKind::Rest);
    }
}
