use crate::llm::{CompletionRequest, Completer, Embedder, OpenAIClient};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TEST_MODEL: &str = "test-model";
const TEST_EMBEDDING_MODEL: &str = "test-embedding-model";

fn client(base_url: String) -> OpenAIClient {
    OpenAIClient::new(
        "sk-test".to_string(),
        TEST_MODEL.to_string(),
        TEST_EMBEDDING_MODEL.to_string(),
        Some(base_url),
    )
}

#[tokio::test]
async fn test_complete_success() {
    let mock_server = MockServer::start().await;

    let expected_response = json!({
        "choices": [{
            "message": { "content": "Hello from mock OpenAI!" }
        }]
    });

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(expected_response))
        .mount(&mock_server)
        .await;

    let result = client(mock_server.uri())
        .complete(CompletionRequest::user("Hello"))
        .await;
    assert_eq!(result.unwrap(), "Hello from mock OpenAI!");
}

#[tokio::test]
async fn test_complete_error_status() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "message": "Incorrect API key provided" }
        })))
        .mount(&mock_server)
        .await;

    let result = client(mock_server.uri())
        .complete(CompletionRequest::user("Hello"))
        .await;
    let err = result.unwrap_err().to_string();
    assert!(err.contains("OpenAI API error (401"));
}

#[tokio::test]
async fn test_embed_success() {
    let mock_server = MockServer::start().await;

    let expected_response = json!({
        "data": [{ "embedding": [0.1, 0.2, 0.3] }]
    });

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(expected_response))
        .mount(&mock_server)
        .await;

    let vector = client(mock_server.uri()).embed("some text").await.unwrap();
    assert_eq!(vector, vec![0.1, 0.2, 0.3]);
}

#[tokio::test]
async fn test_embed_batch_order_preserved() {
    let mock_server = MockServer::start().await;

    let expected_response = json!({
        "data": [
            { "embedding": [1.0, 0.0] },
            { "embedding": [0.0, 1.0] }
        ]
    });

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(expected_response))
        .mount(&mock_server)
        .await;

    let vectors = client(mock_server.uri())
        .embed_batch(vec!["a".into(), "b".into()])
        .await
        .unwrap();
    assert_eq!(vectors.len(), 2);
    assert_eq!(vectors[0], vec![1.0, 0.0]);
    assert_eq!(vectors[1], vec![0.0, 1.0]);
}
