pub mod anthropic;
pub mod openai;

#[cfg(test)]
mod anthropic_tests;
#[cfg(test)]
mod openai_tests;

pub use anthropic::AnthropicClient;
pub use openai::OpenAIClient;

use async_trait::async_trait;
use cortex_common::config::{LlmConfig, LlmProvider};
use cortex_common::Result;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub user: String,
    pub temperature: Option<f32>,
    /// Ask the provider for a JSON object response where supported.
    pub json_mode: bool,
    /// Per-call model override (fact extraction may run on a cheaper model).
    pub model: Option<String>,
}

impl CompletionRequest {
    pub fn user(prompt: impl Into<String>) -> Self {
        Self {
            user: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

/// Chat-completion capability. Failure is degraded operation for callers,
/// never fatal for the surrounding write.
#[async_trait]
pub trait Completer: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String>;
}

/// Embedding capability; vector length is fixed per store.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Batch embed, same order as the input. Defaults to per-item calls.
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(&text).await?);
        }
        Ok(results)
    }
}

pub fn create_completer(config: &LlmConfig) -> Option<Arc<dyn Completer>> {
    match config.provider {
        LlmProvider::OpenAI => config.openai_api_key.clone().map(|key| {
            Arc::new(OpenAIClient::new(
                key,
                config.model.clone(),
                config.embedding_model.clone(),
                None,
            )) as Arc<dyn Completer>
        }),
        LlmProvider::Anthropic => config.anthropic_api_key.clone().map(|key| {
            Arc::new(AnthropicClient::new(key, config.model.clone())) as Arc<dyn Completer>
        }),
    }
}

/// Embeddings always ride on the OpenAI endpoint; the Anthropic API does not
/// serve them. Semantic recall degrades to keyword search when no OpenAI key
/// is configured.
pub fn create_embedder(config: &LlmConfig) -> Option<Arc<dyn Embedder>> {
    config.openai_api_key.clone().map(|key| {
        Arc::new(OpenAIClient::new(
            key,
            config.model.clone(),
            config.embedding_model.clone(),
            None,
        )) as Arc<dyn Embedder>
    })
}

/// Strip markdown code fences from an LLM response before JSON parsing.
pub fn strip_fences(raw: &str) -> &str {
    raw.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_fences("```json\n[1, 2]\n```"), "[1, 2]");
        assert_eq!(strip_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_fences("  plain  "), "plain");
    }

    #[test]
    fn test_factory_requires_key() {
        let config = LlmConfig::default();
        assert!(create_completer(&config).is_none());
        assert!(create_embedder(&config).is_none());

        let with_key = LlmConfig {
            openai_api_key: Some("sk-test".into()),
            ..LlmConfig::default()
        };
        assert!(create_completer(&with_key).is_some());
        assert!(create_embedder(&with_key).is_some());
    }
}
