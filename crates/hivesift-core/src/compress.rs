//! Corpus compression to a model-context budget.
//!
//! Budget is measured in rendered characters (4 chars ≈ 1 token as a
//! rule of thumb). Applied in order until the rendering fits: exact
//! duplicate message bodies are dropped, conversation middles are
//! excerpted (first and last messages stay verbatim), then whole
//! conversations are dropped lowest-signal-first with their id and
//! link recorded so nothing becomes unreferenceable.

use std::collections::HashSet;

use hivesift_schema::{
    AuthorRole, CompressedCorpus, Conversation, Corpus, DroppedConversation, Message,
};
use thiserror::Error;

const DEFAULT_EXCERPT_CHARS: usize = 240;

#[derive(Debug, Error)]
pub enum CompressError {
    #[error("compression budget {budget} unreachable: smallest remaining conversation needs {needed}")]
    BudgetUnreachable { budget: usize, needed: usize },
}

pub struct CorpusCompressor {
    budget_chars: usize,
    excerpt_chars: usize,
}

impl CorpusCompressor {
    pub fn new(budget_chars: usize) -> Self {
        Self {
            budget_chars,
            excerpt_chars: DEFAULT_EXCERPT_CHARS,
        }
    }

    pub fn with_excerpt_chars(mut self, excerpt_chars: usize) -> Self {
        self.excerpt_chars = excerpt_chars.max(8);
        self
    }

    pub fn budget_chars(&self) -> usize {
        self.budget_chars
    }

    pub fn compress(&self, corpus: &Corpus) -> Result<CompressedCorpus, CompressError> {
        let raw_blocks: Vec<String> = corpus
            .conversations
            .iter()
            .map(|c| render_conversation(c, &c.messages))
            .collect();
        let raw = join_blocks(&raw_blocks);
        if raw.len() <= self.budget_chars {
            return Ok(CompressedCorpus {
                text: raw,
                conversation_count: corpus.conversations.len(),
                dropped: vec![],
                budget_chars: self.budget_chars,
                compressed: false,
            });
        }

        // Dedup then excerpt, per conversation.
        let shaped: Vec<(usize, String)> = corpus
            .conversations
            .iter()
            .enumerate()
            .map(|(idx, c)| {
                let deduped = dedup_messages(&c.messages);
                let excerpted = excerpt_messages(&deduped, self.excerpt_chars);
                (idx, render_conversation(c, &excerpted))
            })
            .collect();

        let mut kept: Vec<(usize, String)> = shaped;
        let mut total: usize = joined_len(kept.iter().map(|(_, b)| b.len()));

        // Drop lowest-signal conversations until the rendering fits.
        let mut drop_order = drop_priority(&corpus.conversations);
        let mut dropped_idx: Vec<usize> = Vec::new();
        while total > self.budget_chars {
            if kept.len() <= 1 {
                return Err(CompressError::BudgetUnreachable {
                    budget: self.budget_chars,
                    needed: total,
                });
            }
            let victim = drop_order
                .iter()
                .copied()
                .find(|idx| kept.iter().any(|(k, _)| k == idx))
                .expect("drop order covers all kept conversations");
            drop_order.retain(|idx| *idx != victim);
            kept.retain(|(idx, _)| *idx != victim);
            dropped_idx.push(victim);
            total = joined_len(kept.iter().map(|(_, b)| b.len()));
        }

        dropped_idx.sort_unstable();
        let dropped = dropped_idx
            .iter()
            .map(|&idx| {
                let c = &corpus.conversations[idx];
                DroppedConversation {
                    id: c.id.clone(),
                    link: c.link.clone(),
                }
            })
            .collect();

        let text = join_blocks(&kept.iter().map(|(_, b)| b.clone()).collect::<Vec<_>>());
        tracing::debug!(
            kept = kept.len(),
            dropped = dropped_idx.len(),
            size = text.len(),
            budget = self.budget_chars,
            "compressed corpus"
        );
        Ok(CompressedCorpus {
            text,
            conversation_count: kept.len(),
            dropped,
            budget_chars: self.budget_chars,
            compressed: true,
        })
    }

    /// A corpus that already went through `compress` is never shaped
    /// again; re-submitting one under the same budget is a no-op.
    pub fn compress_existing(
        &self,
        compressed: CompressedCorpus,
    ) -> Result<CompressedCorpus, CompressError> {
        if compressed.text.len() <= self.budget_chars {
            Ok(compressed)
        } else {
            Err(CompressError::BudgetUnreachable {
                budget: self.budget_chars,
                needed: compressed.text.len(),
            })
        }
    }
}

fn role_tag(role: AuthorRole) -> &'static str {
    match role {
        AuthorRole::Customer => "customer",
        AuthorRole::Agent => "agent",
        AuthorRole::System => "system",
    }
}

fn render_conversation(conversation: &Conversation, messages: &[Message]) -> String {
    let mut out = String::new();
    out.push_str(&format!("## {}\n", conversation.id));
    out.push_str(&format!("link: {}\n", conversation.link));
    if let Some(email) = &conversation.customer_email {
        out.push_str(&format!("customer: {email}\n"));
    }
    for message in messages {
        out.push_str(&format!("- [{}] {}\n", role_tag(message.role), message.text));
    }
    out
}

fn join_blocks(blocks: &[String]) -> String {
    blocks.join("\n")
}

fn joined_len(block_lens: impl Iterator<Item = usize>) -> usize {
    let mut total = 0;
    let mut count = 0;
    for len in block_lens {
        total += len;
        count += 1;
    }
    if count > 1 {
        total += count - 1;
    }
    total
}

/// Keeps the first occurrence of each exact message body.
fn dedup_messages(messages: &[Message]) -> Vec<Message> {
    let mut seen: HashSet<&str> = HashSet::new();
    messages
        .iter()
        .filter(|m| seen.insert(m.text.as_str()))
        .cloned()
        .collect()
}

/// First and last messages stay verbatim (opening issue, resolution);
/// everything between is truncated to the excerpt length. Idempotent:
/// a truncated middle is already within the excerpt length.
fn excerpt_messages(messages: &[Message], excerpt_chars: usize) -> Vec<Message> {
    if messages.len() <= 2 {
        return messages.to_vec();
    }
    let mut out = Vec::with_capacity(messages.len());
    out.push(messages[0].clone());
    for message in &messages[1..messages.len() - 1] {
        out.push(Message {
            role: message.role,
            text: truncate_chars(&message.text, excerpt_chars),
            at: message.at,
        });
    }
    out.push(messages[messages.len() - 1].clone());
    out
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Indices in the order conversations should be sacrificed: no-reply
/// threads first, then by total body length ascending, oldest first on
/// ties.
fn drop_priority(conversations: &[Conversation]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..conversations.len()).collect();
    order.sort_by(|&a, &b| {
        let ca = &conversations[a];
        let cb = &conversations[b];
        let replied_a = ca.messages.iter().any(|m| m.role == AuthorRole::Agent);
        let replied_b = cb.messages.iter().any(|m| m.role == AuthorRole::Agent);
        replied_a
            .cmp(&replied_b)
            .then_with(|| body_len(ca).cmp(&body_len(cb)))
            .then_with(|| ca.created_at.cmp(&cb.created_at))
    });
    order
}

fn body_len(conversation: &Conversation) -> usize {
    conversation.messages.iter().map(|m| m.text.len()).sum()
}
