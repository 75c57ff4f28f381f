pub mod anthropic;

pub use anthropic::AnthropicClient;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One completion request to the model boundary. `schema` is the JSON
/// shape contract the response must satisfy; it is embedded in the
/// request so the model sees it, but validation stays on our side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub system: Option<String>,
    pub prompt: String,
    pub schema: serde_json::Value,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub stop_reason: Option<String>,
}

/// The single call type the analyzer needs from a language model.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;
}

impl CompletionRequest {
    /// Renders the prompt with the schema contract appended, the form
    /// every backend sends regardless of its wire protocol.
    pub fn rendered_prompt(&self) -> String {
        format!(
            "{}\n\nRespond with a single JSON object matching this schema, and nothing else:\n{}",
            self.prompt, self.schema
        )
    }
}
