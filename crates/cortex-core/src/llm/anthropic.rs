use super::{CompletionRequest, Completer};
use async_trait::async_trait;
use cortex_common::{CortexError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_MODEL: &str = "claude-opus-5";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Serialize)]
struct MessageParam {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<MessageParam>,
}

#[derive(Debug, Clone, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

/// Messages-API client. There is no Anthropic embeddings endpoint, so this
/// client only provides completion.
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl AnthropicClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_base_url(api_key, model, "https://api.anthropic.com".to_string())
    }

    pub fn with_base_url(api_key: String, model: String, base_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.trim().to_string(),
            base_url,
            model: if model.is_empty() {
                DEFAULT_MODEL.to_string()
            } else {
                model
            },
        }
    }
}

#[async_trait]
impl Completer for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));

        // json_mode has no dedicated switch on this API; the system prompt
        // carries the instruction instead.
        let system = match (&request.system, request.json_mode) {
            (Some(s), true) => Some(format!("{s}\nRespond with JSON only.")),
            (Some(s), false) => Some(s.clone()),
            (None, true) => Some("Respond with JSON only.".to_string()),
            (None, false) => None,
        };

        let body = MessagesRequest {
            model: request.model.clone().unwrap_or_else(|| self.model.clone()),
            max_tokens: MAX_TOKENS,
            system,
            messages: vec![MessageParam {
                role: "user".to_string(),
                content: request.user.clone(),
            }],
        };

        let res = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(CortexError::transport)?;

        let status = res.status();
        let text = res.text().await.map_err(CortexError::transport)?;
        if !status.is_success() {
            return Err(CortexError::transport(format!(
                "Anthropic API error ({status}): {text}"
            )));
        }

        let parsed: MessagesResponse = serde_json::from_str(&text).map_err(|e| {
            CortexError::transport(format!(
                "failed to parse Anthropic response: {e} - body: {text}"
            ))
        })?;
        if parsed.stop_reason.as_deref() == Some("refusal") {
            return Err(CortexError::transport("Anthropic request was refused"));
        }

        let mut out = String::new();
        for block in parsed.content {
            if let ContentBlock::Text { text } = block {
                out.push_str(&text);
            }
        }
        if out.is_empty() {
            return Err(CortexError::transport("no text content in Anthropic response"));
        }
        Ok(out)
    }
}
