use crate::llm::{AnthropicClient, CompletionRequest, Completer};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(base_url: String) -> AnthropicClient {
    AnthropicClient::with_base_url("test-key".to_string(), "test-model".to_string(), base_url)
}

#[tokio::test]
async fn test_complete_success() {
    let mock_server = MockServer::start().await;

    let expected_response = json!({
        "content": [
            { "type": "text", "text": "Hello from mock Claude!" }
        ],
        "stop_reason": "end_turn"
    });

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(expected_response))
        .mount(&mock_server)
        .await;

    let result = client(mock_server.uri())
        .complete(CompletionRequest::user("Hello"))
        .await;
    assert_eq!(result.unwrap(), "Hello from mock Claude!");
}

#[tokio::test]
async fn test_complete_concatenates_text_blocks() {
    let mock_server = MockServer::start().await;

    let expected_response = json!({
        "content": [
            { "type": "text", "text": "part one " },
            { "type": "thinking", "thinking": "" },
            { "type": "text", "text": "part two" }
        ],
        "stop_reason": "end_turn"
    });

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(expected_response))
        .mount(&mock_server)
        .await;

    let result = client(mock_server.uri())
        .complete(CompletionRequest::user("Hello"))
        .await;
    assert_eq!(result.unwrap(), "part one part two");
}

#[tokio::test]
async fn test_complete_refusal_is_error() {
    let mock_server = MockServer::start().await;

    let expected_response = json!({
        "content": [],
        "stop_reason": "refusal"
    });

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(expected_response))
        .mount(&mock_server)
        .await;

    let result = client(mock_server.uri())
        .complete(CompletionRequest::user("Hello"))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_complete_error_status() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(529).set_body_json(json!({
            "type": "error",
            "error": { "type": "overloaded_error", "message": "Overloaded" }
        })))
        .mount(&mock_server)
        .await;

    let result = client(mock_server.uri())
        .complete(CompletionRequest::user("Hello"))
        .await;
    let err = result.unwrap_err();
    assert!(err.is_retryable());
    assert!(err.to_string().contains("Anthropic API error (529"));
}
