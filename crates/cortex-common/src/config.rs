use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAI,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub model: String,
    pub embedding_model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::OpenAI,
            openai_api_key: None,
            anthropic_api_key: None,
            model: String::new(),
            embedding_model: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// When false every graph interaction is skipped and reported as such.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub orphan_cleanup: bool,
    pub uri: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            orphan_cleanup: false,
            uri: None,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeliefRevisionConfig {
    pub enabled: bool,
    pub slot_matching: bool,
    pub llm_resolution: bool,
}

impl Default for BeliefRevisionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            slot_matching: true,
            llm_resolution: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactExtractionConfig {
    pub enabled: bool,
    /// Model override for extraction calls; empty means the provider default.
    #[serde(default)]
    pub model: String,
}

impl Default for FactExtractionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartialFailureHandling {
    StorePartial,
    Rollback,
    Retry,
    BestEffort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// How often a partial agent message is committed while streaming.
    pub partial_response_interval_ms: u64,
    /// Accumulated-delta size that triggers a progressive extraction pass.
    pub fact_extraction_threshold: usize,
    pub graph_sync_interval_ms: u64,
    /// No chunk for this long is treated as an upstream error.
    pub stream_timeout_ms: u64,
    pub max_retries: u32,
    pub partial_failure_handling: PartialFailureHandling,
    pub generate_resume_token: bool,
    /// Above this many accumulated bytes the transform drops the text buffer
    /// and switches to incremental hashing.
    pub max_response_length: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            partial_response_interval_ms: 1000,
            fact_extraction_threshold: 2000,
            graph_sync_interval_ms: 2000,
            stream_timeout_ms: 30_000,
            max_retries: 2,
            partial_failure_handling: PartialFailureHandling::StorePartial,
            generate_resume_token: false,
            max_response_length: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Each layer is attempted independently; failures are reported, not
    /// propagated (conversation append excepted).
    BestEffort,
    /// A failed layer deletes the orchestration's earlier writes.
    Rollback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub auth_provider: Option<String>,
    #[serde(default)]
    pub claims: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CortexConfig {
    /// Backing-store endpoint. A plain path or `file://` URL selects the
    /// embedded backend rooted at that directory.
    pub backend_url: String,
    #[serde(default)]
    pub llm: LlmConfig,
    pub embedding_dim: usize,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub belief_revision: BeliefRevisionConfig,
    #[serde(default)]
    pub fact_extraction: FactExtractionConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub auth: Option<AuthContext>,
}

impl Default for CortexConfig {
    fn default() -> Self {
        Self {
            backend_url: "./data".into(),
            llm: LlmConfig::default(),
            embedding_dim: 768,
            graph: GraphConfig::default(),
            belief_revision: BeliefRevisionConfig::default(),
            fact_extraction: FactExtractionConfig::default(),
            streaming: StreamingConfig::default(),
            retry: RetryConfig::default(),
            failure_policy: FailurePolicy::BestEffort,
            auth: None,
        }
    }
}

impl CortexConfig {
    pub fn with_backend_url(url: impl Into<String>) -> Self {
        Self {
            backend_url: url.into(),
            ..Self::default()
        }
    }

    /// Layered load: built-in defaults, then `cortex.toml`, then `CORTEX__*`
    /// environment overrides, then the legacy environment variables the
    /// library honors directly.
    pub fn load() -> Result<Self, ConfigError> {
        let graph_enabled = env::var("CORTEX_GRAPH_SYNC")
            .ok()
            .map(|v| truthy(&v));
        let extraction_enabled = env::var("CORTEX_FACT_EXTRACTION")
            .ok()
            .map(|v| truthy(&v));
        let graph_uri = env::var("NEO4J_URI")
            .or_else(|_| env::var("MEMGRAPH_URI"))
            .ok();
        let graph_username = env::var("NEO4J_USERNAME")
            .or_else(|_| env::var("MEMGRAPH_USERNAME"))
            .ok();
        let graph_password = env::var("NEO4J_PASSWORD")
            .or_else(|_| env::var("MEMGRAPH_PASSWORD"))
            .ok();

        let s = Config::builder()
            .set_default("backend_url", "./data")?
            .set_default("embedding_dim", 768)?
            .set_default("llm.provider", "openai")?
            .set_default("llm.model", "")?
            .set_default("llm.embedding_model", "")?
            .set_default("belief_revision.enabled", true)?
            .set_default("belief_revision.slot_matching", true)?
            .set_default("belief_revision.llm_resolution", true)?
            .set_default("fact_extraction.enabled", true)?
            .set_default("fact_extraction.model", "")?
            .set_default("streaming.partial_response_interval_ms", 1000)?
            .set_default("streaming.fact_extraction_threshold", 2000)?
            .set_default("streaming.graph_sync_interval_ms", 2000)?
            .set_default("streaming.stream_timeout_ms", 30000)?
            .set_default("streaming.max_retries", 2)?
            .set_default("streaming.partial_failure_handling", "store-partial")?
            .set_default("streaming.generate_resume_token", false)?
            .set_default("streaming.max_response_length", 4 * 1024 * 1024)?
            .set_default("retry.max_retries", 3)?
            .set_default("retry.base_delay_ms", 200)?
            .set_default("retry.max_delay_ms", 5000)?
            .set_default("failure_policy", "best-effort")?
            // File: cortex.toml
            .add_source(File::with_name("cortex").required(false))
            // Environment: CORTEX__LLM__PROVIDER=anthropic -> llm.provider.
            // The double-underscore prefix separator keeps the legacy
            // CORTEX_* switches below out of this source.
            .add_source(
                Environment::with_prefix("CORTEX")
                    .prefix_separator("__")
                    .separator("__"),
            )
            // Legacy env overrides honored directly by the library
            .set_override_option("backend_url", env::var("CONVEX_URL").ok())?
            .set_override_option("llm.openai_api_key", env::var("OPENAI_API_KEY").ok())?
            .set_override_option(
                "llm.anthropic_api_key",
                env::var("ANTHROPIC_API_KEY").ok(),
            )?
            .set_override_option("graph.enabled", graph_enabled)?
            .set_override_option("graph.uri", graph_uri)?
            .set_override_option("graph.username", graph_username)?
            .set_override_option("graph.password", graph_password)?
            .set_override_option("fact_extraction.enabled", extraction_enabled)?
            .set_override_option(
                "fact_extraction.model",
                env::var("CORTEX_FACT_EXTRACTION_MODEL").ok(),
            )?
            .build()?;

        s.try_deserialize()
    }

    pub fn active_api_key(&self) -> Option<String> {
        match self.llm.provider {
            LlmProvider::OpenAI => self.llm.openai_api_key.clone(),
            LlmProvider::Anthropic => self.llm.anthropic_api_key.clone(),
        }
    }

    /// Storage root for the embedded backend.
    pub fn storage_root(&self) -> String {
        self.backend_url
            .strip_prefix("file://")
            .unwrap_or(&self.backend_url)
            .to_string()
    }

    pub fn tenant_id(&self) -> String {
        self.auth
            .as_ref()
            .map(|a| a.tenant_id.clone())
            .unwrap_or_else(|| crate::DEFAULT_TENANT.to_string())
    }
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = CortexConfig::default();
        assert_eq!(cfg.embedding_dim, 768);
        assert!(cfg.belief_revision.enabled);
        assert!(cfg.belief_revision.slot_matching);
        assert_eq!(cfg.failure_policy, FailurePolicy::BestEffort);
        assert_eq!(cfg.tenant_id(), crate::DEFAULT_TENANT);
    }

    #[test]
    fn test_storage_root_strips_scheme() {
        let cfg = CortexConfig::with_backend_url("file:///tmp/cortex-data");
        assert_eq!(cfg.storage_root(), "/tmp/cortex-data");
        let cfg = CortexConfig::with_backend_url("./data");
        assert_eq!(cfg.storage_root(), "./data");
    }

    #[test]
    fn test_truthy() {
        assert!(truthy("1"));
        assert!(truthy("TRUE"));
        assert!(!truthy("0"));
        assert!(!truthy("off"));
    }
}
