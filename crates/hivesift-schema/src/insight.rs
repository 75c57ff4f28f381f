use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightCategory {
    Bug,
    FeatureRequest,
    Complaint,
    Praise,
    Question,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Impact {
    pub customer_count: usize,
    pub percentage: f64,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerRef {
    #[serde(default)]
    pub email: Option<String>,
    pub conversation_id: String,
    pub link: String,
    pub issue: String,
}

/// One categorized finding extracted from a corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub category: InsightCategory,
    pub title: String,
    pub description: String,
    pub impact: Impact,
    #[serde(default)]
    pub customers: Vec<CustomerRef>,
    pub priority: f64,
    pub recommendation: String,
}

impl Insight {
    /// Bounds from the corpus that produced this insight:
    /// `customers.len() <= impact.customer_count <= corpus size`.
    pub fn within_bounds(&self, corpus_len: usize) -> bool {
        self.impact.customer_count <= corpus_len
            && self.customers.len() <= self.impact.customer_count
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub conversation_count: usize,
    pub message_count: usize,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisUsage {
    pub elapsed: Duration,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub cost_usd: Option<f64>,
}

/// Ordered output of one analyzer call. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub insights: Vec<Insight>,
    pub summary: AnalysisSummary,
    pub usage: AnalysisUsage,
}

impl AnalysisResult {
    /// Builds a result with the deterministic insight ordering applied.
    pub fn ordered(
        mut insights: Vec<Insight>,
        summary: AnalysisSummary,
        usage: AnalysisUsage,
    ) -> Self {
        sort_insights(&mut insights);
        Self {
            insights,
            summary,
            usage,
        }
    }
}

/// Priority descending, ties by customer count descending. Stable, so
/// remaining ties keep discovery order. NaN priorities sink to the end.
pub fn sort_insights(insights: &mut [Insight]) {
    insights.sort_by(|a, b| {
        let by_priority = b
            .priority
            .partial_cmp(&a.priority)
            .unwrap_or_else(|| match (a.priority.is_nan(), b.priority.is_nan()) {
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                _ => Ordering::Equal,
            });
        by_priority.then_with(|| b.impact.customer_count.cmp(&a.impact.customer_count))
    });
}
