use super::{CompletionRequest, Completer, Embedder};
use async_trait::async_trait;
use cortex_common::{CortexError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct EmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

pub struct OpenAIClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    embedding_model: String,
}

impl OpenAIClient {
    pub fn new(
        api_key: String,
        model: String,
        embedding_model: String,
        base_url: Option<String>,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.trim().to_string(),
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: if model.is_empty() {
                DEFAULT_MODEL.to_string()
            } else {
                model
            },
            embedding_model: if embedding_model.is_empty() {
                DEFAULT_EMBEDDING_MODEL.to_string()
            } else {
                embedding_model
            },
        }
    }
}

#[async_trait]
impl Completer for OpenAIClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.user.clone(),
        });

        let body = ChatRequest {
            model: request.model.clone().unwrap_or_else(|| self.model.clone()),
            messages,
            temperature: request.temperature.unwrap_or(0.1),
            response_format: request.json_mode.then(|| json!({ "type": "json_object" })),
        };

        let res = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(CortexError::transport)?;

        let status = res.status();
        let text = res.text().await.map_err(CortexError::transport)?;
        if !status.is_success() {
            return Err(CortexError::transport(format!(
                "OpenAI API error ({status}): {text}"
            )));
        }

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            CortexError::transport(format!("failed to parse OpenAI response: {e} - body: {text}"))
        })?;
        parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| CortexError::transport("no content in OpenAI response"))
    }
}

#[async_trait]
impl Embedder for OpenAIClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.embed_batch(vec![text.to_string()]).await?;
        embeddings
            .pop()
            .ok_or_else(|| CortexError::transport("no embedding in OpenAI response"))
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let body = EmbedRequest {
            model: self.embedding_model.clone(),
            input: texts,
        };

        let res = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(CortexError::transport)?;

        let status = res.status();
        let text = res.text().await.map_err(CortexError::transport)?;
        if !status.is_success() {
            return Err(CortexError::transport(format!(
                "OpenAI embeddings error ({status}): {text}"
            )));
        }

        let parsed: EmbedResponse = serde_json::from_str(&text).map_err(|e| {
            CortexError::transport(format!(
                "failed to parse OpenAI embeddings response: {e} - body: {text}"
            ))
        })?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}
