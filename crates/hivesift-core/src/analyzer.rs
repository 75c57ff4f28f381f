//! Structured insight extraction.
//!
//! One model call with a strict output schema; one corrective retry on
//! a response that fails to parse or validate. Invariant-violating
//! insights are discarded rather than surfaced, and the final ordering
//! is computed here, never trusted from the model.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use hivesift_model::{CompletionRequest, ModelClient};
use hivesift_schema::{
    AnalysisResult, AnalysisSummary, AnalysisUsage, CompressedCorpus, Corpus, CustomerRef, Impact,
    Insight, InsightCategory, Severity,
};
use serde::Deserialize;
use thiserror::Error;

const SYSTEM_PROMPT: &str = "You are an analyst for a customer support team. You read a corpus of \
support conversations and extract the issues that matter, grouped and prioritized. You only ever \
answer with JSON matching the schema you are given.";

const CORRECTIVE_INSTRUCTION: &str = "Your previous reply was not valid JSON matching the schema. \
Return only a single valid JSON object matching the schema, with no surrounding prose.";

const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("model returned unstructured output after corrective retry: {detail}")]
    Unstructured { detail: String },
    #[error("model call timed out after {waited_ms}ms")]
    Timeout { waited_ms: u64 },
    #[error("model call failed: {0}")]
    Model(#[from] anyhow::Error),
}

/// Token prices per million, for the usage block on each result.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

pub struct Analyzer {
    model: Arc<dyn ModelClient>,
    model_id: String,
    max_tokens: u32,
    timeout: Duration,
    pricing: Option<ModelPricing>,
}

impl Analyzer {
    pub fn new(model: Arc<dyn ModelClient>, model_id: impl Into<String>) -> Self {
        Self {
            model,
            model_id: model_id.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout: DEFAULT_TIMEOUT,
            pricing: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = Some(pricing);
        self
    }

    pub async fn analyze(
        &self,
        query: &str,
        compressed: &CompressedCorpus,
        corpus: &Corpus,
    ) -> Result<AnalysisResult, AnalyzeError> {
        let started = Instant::now();

        // A zero-result corpus is a valid outcome; no model call needed.
        if corpus.is_empty() {
            return Ok(AnalysisResult::ordered(
                vec![],
                self.summary_for(corpus),
                AnalysisUsage {
                    elapsed: started.elapsed(),
                    input_tokens: None,
                    output_tokens: None,
                    cost_usd: None,
                },
            ));
        }

        let schema = insight_schema();
        let prompt = build_prompt(query, compressed);

        let mut input_tokens: u32 = 0;
        let mut output_tokens: u32 = 0;
        let mut saw_usage = false;
        let mut last_detail = String::new();

        for attempt in 0..2 {
            let attempt_prompt = if attempt == 0 {
                prompt.clone()
            } else {
                format!("{prompt}\n\n{CORRECTIVE_INSTRUCTION}")
            };
            let request = CompletionRequest {
                model: self.model_id.clone(),
                system: Some(SYSTEM_PROMPT.to_string()),
                prompt: attempt_prompt,
                schema: schema.clone(),
                max_tokens: self.max_tokens,
            };

            let response = match tokio::time::timeout(self.timeout, self.model.complete(request))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(AnalyzeError::Timeout {
                        waited_ms: started.elapsed().as_millis() as u64,
                    })
                }
            };

            if let Some(tokens) = response.input_tokens {
                input_tokens += tokens;
                saw_usage = true;
            }
            if let Some(tokens) = response.output_tokens {
                output_tokens += tokens;
                saw_usage = true;
            }

            match parse_insights(&response.text, corpus.len()) {
                Ok(insights) => {
                    let usage = self.usage_for(started, saw_usage, input_tokens, output_tokens);
                    return Ok(AnalysisResult::ordered(
                        insights,
                        self.summary_for(corpus),
                        usage,
                    ));
                }
                Err(detail) => {
                    tracing::warn!(attempt, %detail, "model response failed validation");
                    last_detail = detail;
                }
            }
        }

        Err(AnalyzeError::Unstructured {
            detail: last_detail,
        })
    }

    fn summary_for(&self, corpus: &Corpus) -> AnalysisSummary {
        AnalysisSummary {
            conversation_count: corpus.len(),
            message_count: corpus.message_count(),
            analyzed_at: Utc::now(),
        }
    }

    fn usage_for(
        &self,
        started: Instant,
        saw_usage: bool,
        input_tokens: u32,
        output_tokens: u32,
    ) -> AnalysisUsage {
        let cost_usd = match (&self.pricing, saw_usage) {
            (Some(pricing), true) => Some(
                input_tokens as f64 / 1_000_000.0 * pricing.input_per_mtok
                    + output_tokens as f64 / 1_000_000.0 * pricing.output_per_mtok,
            ),
            _ => None,
        };
        AnalysisUsage {
            elapsed: started.elapsed(),
            input_tokens: saw_usage.then_some(input_tokens),
            output_tokens: saw_usage.then_some(output_tokens),
            cost_usd,
        }
    }
}

fn build_prompt(query: &str, compressed: &CompressedCorpus) -> String {
    let mut prompt = format!(
        "Question from the team:\n{query}\n\nCorpus of {} support conversations follows.",
        compressed.conversation_count
    );
    if !compressed.dropped.is_empty() {
        prompt.push_str(&format!(
            " {} further conversations matched but are omitted for size; refer to them by id only if asked: {}.",
            compressed.dropped.len(),
            compressed
                .dropped
                .iter()
                .map(|d| d.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    prompt.push_str("\n\n");
    prompt.push_str(&compressed.text);
    prompt
}

/// The JSON contract sent with every request; validation of responses
/// against it stays on this side of the boundary.
fn insight_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["insights"],
        "properties": {
            "insights": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["category", "title", "description", "impact", "priority", "recommendation"],
                    "properties": {
                        "category": {"enum": ["bug", "feature_request", "complaint", "praise", "question", "other"]},
                        "title": {"type": "string"},
                        "description": {"type": "string"},
                        "impact": {
                            "type": "object",
                            "required": ["customer_count", "percentage", "severity"],
                            "properties": {
                                "customer_count": {"type": "integer", "minimum": 0},
                                "percentage": {"type": "number"},
                                "severity": {"enum": ["critical", "high", "medium", "low"]}
                            }
                        },
                        "customers": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "required": ["conversation_id", "link", "issue"],
                                "properties": {
                                    "email": {"type": "string"},
                                    "conversation_id": {"type": "string"},
                                    "link": {"type": "string"},
                                    "issue": {"type": "string"}
                                }
                            }
                        },
                        "priority": {"type": "number", "minimum": 0, "maximum": 10},
                        "recommendation": {"type": "string"}
                    }
                }
            }
        }
    })
}

#[derive(Debug, Deserialize)]
struct WirePayload {
    insights: Vec<WireInsight>,
}

#[derive(Debug, Deserialize)]
struct WireInsight {
    category: String,
    title: String,
    description: String,
    impact: WireImpact,
    #[serde(default)]
    customers: Vec<WireCustomer>,
    priority: f64,
    recommendation: String,
}

#[derive(Debug, Deserialize)]
struct WireImpact {
    customer_count: usize,
    percentage: f64,
    severity: String,
}

#[derive(Debug, Deserialize)]
struct WireCustomer {
    #[serde(default)]
    email: Option<String>,
    conversation_id: String,
    link: String,
    issue: String,
}

/// Parses a model reply into validated insights, or an error detail
/// for the corrective retry. Individual invariant violations discard
/// that insight only; a payload that cannot be parsed at all fails the
/// attempt.
fn parse_insights(text: &str, corpus_len: usize) -> Result<Vec<Insight>, String> {
    let json = extract_json(text).ok_or_else(|| "no JSON object in response".to_string())?;
    let payload: WirePayload =
        serde_json::from_str(json).map_err(|e| format!("schema mismatch: {e}"))?;

    let mut insights = Vec::with_capacity(payload.insights.len());
    for wire in payload.insights {
        let insight = Insight {
            category: parse_category(&wire.category),
            title: wire.title,
            description: wire.description,
            impact: Impact {
                customer_count: wire.impact.customer_count,
                percentage: wire.impact.percentage,
                severity: parse_severity(&wire.impact.severity),
            },
            customers: wire
                .customers
                .into_iter()
                .map(|c| CustomerRef {
                    email: c.email,
                    conversation_id: c.conversation_id,
                    link: c.link,
                    issue: c.issue,
                })
                .collect(),
            priority: wire.priority,
            recommendation: wire.recommendation,
        };
        if insight.within_bounds(corpus_len) {
            insights.push(insight);
        } else {
            tracing::warn!(
                title = %insight.title,
                customer_count = insight.impact.customer_count,
                customers = insight.customers.len(),
                corpus_len,
                "discarding insight with out-of-bounds customer counts"
            );
        }
    }
    Ok(insights)
}

/// Tolerates prose or markdown fences around the object.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end >= start).then(|| &text[start..=end])
}

fn parse_category(raw: &str) -> InsightCategory {
    match raw {
        "bug" => InsightCategory::Bug,
        "feature_request" => InsightCategory::FeatureRequest,
        "complaint" => InsightCategory::Complaint,
        "praise" => InsightCategory::Praise,
        "question" => InsightCategory::Question,
        _ => InsightCategory::Other,
    }
}

fn parse_severity(raw: &str) -> Severity {
    match raw {
        "critical" => Severity::Critical,
        "high" => Severity::High,
        "medium" => Severity::Medium,
        _ => Severity::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use hivesift_model::CompletionResponse;
    use hivesift_schema::{AuthorRole, CorpusMeta, DroppedConversation, Message, SourceKind};
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    struct StubModel {
        replies: Mutex<VecDeque<anyhow::Result<String>>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl StubModel {
        fn new(replies: Vec<anyhow::Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(vec![]),
            })
        }

        async fn request_count(&self) -> usize {
            self.requests.lock().await.len()
        }
    }

    #[async_trait]
    impl ModelClient for StubModel {
        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> anyhow::Result<CompletionResponse> {
            self.requests.lock().await.push(request);
            let reply = self
                .replies
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("stub exhausted")))?;
            Ok(CompletionResponse {
                text: reply,
                input_tokens: Some(1000),
                output_tokens: Some(200),
                stop_reason: Some("end_turn".into()),
            })
        }
    }

    fn corpus(count: usize) -> Corpus {
        let at = Utc.with_ymd_and_hms(2026, 7, 10, 9, 0, 0).unwrap();
        Corpus {
            conversations: (0..count)
                .map(|i| hivesift_schema::Conversation {
                    id: format!("c{i}"),
                    customer_email: None,
                    messages: vec![Message {
                        role: AuthorRole::Customer,
                        text: "the app crashes".into(),
                        at,
                    }],
                    created_at: at,
                    updated_at: at,
                    link: format!("https://desk.example.com/conversations/c{i}"),
                })
                .collect(),
            meta: CorpusMeta {
                source: SourceKind::Stream,
                fetch_elapsed: Duration::from_millis(20),
                fell_back: false,
                compressed: false,
            },
        }
    }

    fn compressed_for(corpus: &Corpus) -> CompressedCorpus {
        CompressedCorpus {
            text: "## c0\nlink: https://desk.example.com/conversations/c0\n- [customer] the app crashes\n".into(),
            conversation_count: corpus.len(),
            dropped: vec![],
            budget_chars: 10_000,
            compressed: false,
        }
    }

    fn insight_json(title: &str, priority: f64, customer_count: usize) -> serde_json::Value {
        serde_json::json!({
            "category": "bug",
            "title": title,
            "description": "crashes at login",
            "impact": {"customer_count": customer_count, "percentage": 25.0, "severity": "high"},
            "customers": [],
            "priority": priority,
            "recommendation": "ship a hotfix"
        })
    }

    fn payload(insights: Vec<serde_json::Value>) -> String {
        serde_json::json!({ "insights": insights }).to_string()
    }

    #[tokio::test]
    async fn valid_response_parses_and_orders() {
        let model = StubModel::new(vec![Ok(payload(vec![
            insight_json("minor", 2.0, 1),
            insight_json("major", 9.0, 3),
        ]))]);
        let analyzer = Analyzer::new(model.clone(), "claude-sonnet-4-5");
        let c = corpus(4);

        let result = analyzer
            .analyze("what is broken?", &compressed_for(&c), &c)
            .await
            .unwrap();
        assert_eq!(result.insights.len(), 2);
        assert_eq!(result.insights[0].title, "major");
        assert_eq!(result.summary.conversation_count, 4);
        assert_eq!(model.request_count().await, 1);
    }

    #[tokio::test]
    async fn fenced_response_is_tolerated() {
        let body = format!("```json\n{}\n```", payload(vec![insight_json("a", 5.0, 1)]));
        let model = StubModel::new(vec![Ok(body)]);
        let analyzer = Analyzer::new(model, "claude-sonnet-4-5");
        let c = corpus(2);

        let result = analyzer
            .analyze("issues?", &compressed_for(&c), &c)
            .await
            .unwrap();
        assert_eq!(result.insights.len(), 1);
    }

    #[tokio::test]
    async fn prose_response_triggers_corrective_retry() {
        let model = StubModel::new(vec![
            Ok("Sure! Here are my thoughts in plain prose.".into()),
            Ok(payload(vec![insight_json("after retry", 4.0, 1)])),
        ]);
        let analyzer = Analyzer::new(model.clone(), "claude-sonnet-4-5");
        let c = corpus(2);

        let result = analyzer
            .analyze("issues?", &compressed_for(&c), &c)
            .await
            .unwrap();
        assert_eq!(result.insights[0].title, "after retry");
        assert_eq!(model.request_count().await, 2);

        let requests = model.requests.lock().await;
        assert!(!requests[0].prompt.contains("previous reply"));
        assert!(requests[1].prompt.contains("previous reply was not valid JSON"));
    }

    #[tokio::test]
    async fn second_failure_is_unstructured() {
        let model = StubModel::new(vec![
            Ok("still prose".into()),
            Ok("and more prose".into()),
        ]);
        let analyzer = Analyzer::new(model.clone(), "claude-sonnet-4-5");
        let c = corpus(2);

        let err = analyzer
            .analyze("issues?", &compressed_for(&c), &c)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzeError::Unstructured { .. }));
        assert_eq!(model.request_count().await, 2);
    }

    #[tokio::test]
    async fn out_of_bounds_insights_are_discarded() {
        // customer_count above corpus size, and a customers list longer
        // than its own count; both violate the result invariants.
        let inflated = insight_json("inflated", 8.0, 50);
        let mut overfull = insight_json("overfull", 7.0, 1);
        overfull["customers"] = serde_json::json!([
            {"conversation_id": "c0", "link": "https://desk.example.com/conversations/c0", "issue": "crash"},
            {"conversation_id": "c1", "link": "https://desk.example.com/conversations/c1", "issue": "crash"}
        ]);
        let ok = insight_json("kept", 3.0, 2);
        let model = StubModel::new(vec![Ok(payload(vec![inflated, overfull, ok]))]);
        let analyzer = Analyzer::new(model, "claude-sonnet-4-5");
        let c = corpus(3);

        let result = analyzer
            .analyze("issues?", &compressed_for(&c), &c)
            .await
            .unwrap();
        assert_eq!(result.insights.len(), 1);
        assert_eq!(result.insights[0].title, "kept");
    }

    #[tokio::test]
    async fn unknown_category_and_severity_fall_back() {
        let mut odd = insight_json("odd", 5.0, 1);
        odd["category"] = serde_json::json!("meta-commentary");
        odd["impact"]["severity"] = serde_json::json!("catastrophic");
        let model = StubModel::new(vec![Ok(payload(vec![odd]))]);
        let analyzer = Analyzer::new(model, "claude-sonnet-4-5");
        let c = corpus(2);

        let result = analyzer
            .analyze("issues?", &compressed_for(&c), &c)
            .await
            .unwrap();
        assert_eq!(result.insights[0].category, InsightCategory::Other);
        assert_eq!(result.insights[0].impact.severity, Severity::Low);
    }

    #[tokio::test]
    async fn empty_corpus_skips_the_model_entirely() {
        let model = StubModel::new(vec![]);
        let analyzer = Analyzer::new(model.clone(), "claude-sonnet-4-5");
        let c = corpus(0);

        let result = analyzer
            .analyze("issues?", &compressed_for(&c), &c)
            .await
            .unwrap();
        assert!(result.insights.is_empty());
        assert_eq!(result.summary.conversation_count, 0);
        assert_eq!(model.request_count().await, 0);
    }

    #[tokio::test]
    async fn usage_and_cost_are_accounted() {
        let model = StubModel::new(vec![Ok(payload(vec![insight_json("a", 5.0, 1)]))]);
        let analyzer = Analyzer::new(model, "claude-sonnet-4-5").with_pricing(ModelPricing {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
        });
        let c = corpus(2);

        let result = analyzer
            .analyze("issues?", &compressed_for(&c), &c)
            .await
            .unwrap();
        assert_eq!(result.usage.input_tokens, Some(1000));
        assert_eq!(result.usage.output_tokens, Some(200));
        let cost = result.usage.cost_usd.unwrap();
        assert!((cost - (0.001 * 3.0 + 0.0002 * 15.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn model_transport_error_propagates() {
        let model = StubModel::new(vec![Err(anyhow!("connect refused"))]);
        let analyzer = Analyzer::new(model, "claude-sonnet-4-5");
        let c = corpus(2);

        let err = analyzer
            .analyze("issues?", &compressed_for(&c), &c)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzeError::Model(_)));
    }

    #[test]
    fn prompt_mentions_dropped_conversations_by_id_only() {
        let compressed = CompressedCorpus {
            text: "## c0\n".into(),
            conversation_count: 1,
            dropped: vec![DroppedConversation {
                id: "c9".into(),
                link: "https://desk.example.com/conversations/c9".into(),
            }],
            budget_chars: 100,
            compressed: true,
        };
        let prompt = build_prompt("what broke?", &compressed);
        assert!(prompt.contains("omitted for size"));
        assert!(prompt.contains("c9"));
    }

    #[test]
    fn extract_json_handles_fences_and_prose() {
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), Some("{\"a\":1}"));
        assert_eq!(extract_json("Here you go: {\"a\":1}."), Some("{\"a\":1}"));
        assert_eq!(extract_json("no json here"), None);
    }
}
