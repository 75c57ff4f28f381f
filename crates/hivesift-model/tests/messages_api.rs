use hivesift_model::{AnthropicClient, CompletionRequest, ModelClient};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request() -> CompletionRequest {
    CompletionRequest {
        model: "claude-sonnet-4-5".into(),
        system: Some("You analyze support conversations.".into()),
        prompt: "Extract insights.".into(),
        schema: serde_json::json!({"type": "object", "required": ["insights"]}),
        max_tokens: 2048,
    }
}

fn success_body(text: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "msg_test123",
        "type": "message",
        "role": "assistant",
        "content": [{"type": "text", "text": text}],
        "model": "claude-sonnet-4-5",
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 100, "output_tokens": 40}
    })
}

#[tokio::test]
async fn complete_sends_versioned_request_and_parses_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_body("{\"insights\":[]}")))
        .expect(1)
        .mount(&server)
        .await;

    let client = AnthropicClient::new("test-key", server.uri());
    let resp = client.complete(request()).await.unwrap();

    assert_eq!(resp.text, "{\"insights\":[]}");
    assert_eq!(resp.input_tokens, Some(100));
    assert_eq!(resp.output_tokens, Some(40));
    assert_eq!(resp.stop_reason.as_deref(), Some("end_turn"));
}

#[tokio::test]
async fn complete_surfaces_typed_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(529).set_body_json(serde_json::json!({
            "type": "error",
            "error": {"type": "overloaded_error", "message": "try again shortly"}
        })))
        .mount(&server)
        .await;

    let client = AnthropicClient::new("test-key", server.uri());
    let err = client.complete(request()).await.unwrap_err();
    let text = err.to_string();
    assert!(text.contains("anthropic api error"));
    assert!(text.contains("overloaded_error"));
}

#[tokio::test]
async fn complete_connect_failure_is_an_error() {
    let client = AnthropicClient::new("test-key", "http://127.0.0.1:9");
    assert!(client.complete(request()).await.is_err());
}
