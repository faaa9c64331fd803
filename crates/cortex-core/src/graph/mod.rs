pub mod embedded;
pub mod sync;

pub use embedded::EmbeddedGraph;
pub use sync::GraphSync;

use async_trait::async_trait;
use cortex_common::Result;
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct GraphCredentials {
    pub uri: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    /// Stable logical key, e.g. `user:u1` or `fact:<id>`. Upserts merge on it.
    pub key: String,
    pub label: String,
    pub properties: Value,
}

impl GraphNode {
    pub fn new(key: impl Into<String>, label: impl Into<String>, properties: Value) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            properties,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub edge_type: String,
    pub properties: Value,
}

impl GraphEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>, edge_type: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            edge_type: edge_type.into(),
            properties: Value::Null,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GraphRecords {
    pub records: Vec<Value>,
}

pub const EDGE_PARTICIPATES_IN: &str = "PARTICIPATES_IN";
pub const EDGE_OWNS: &str = "OWNS";
pub const EDGE_EXTRACTED_FROM: &str = "EXTRACTED_FROM";
pub const EDGE_SUPERSEDES: &str = "SUPERSEDES";

/// Narrow graph capability. The core contains no vendor-specific logic;
/// absence of an adapter is a first-class state and every graph interaction
/// is skipped and reported as such.
#[async_trait]
pub trait GraphAdapter: Send + Sync {
    async fn connect(&self, credentials: &GraphCredentials) -> Result<()>;

    /// Upsert by key; returns the node's storage id.
    async fn create_node(&self, node: GraphNode) -> Result<String>;

    async fn upsert_edge(&self, edge: GraphEdge) -> Result<()>;

    /// Pass-through parameterized query for drivers that speak one.
    async fn query(&self, query: &str, params: Value) -> Result<GraphRecords>;

    async fn find_path(&self, from: &str, to: &str, max_hops: usize) -> Result<Vec<String>>;

    /// One-hop expansion used by recall.
    async fn neighbors(&self, key: &str, limit: usize) -> Result<Vec<GraphNode>>;

    /// Keys of nodes carrying `property == value`; cascade enumeration.
    async fn nodes_with_property(&self, property: &str, value: &str) -> Result<Vec<String>>;

    async fn delete_nodes_with_property(&self, property: &str, value: &str) -> Result<u64>;

    async fn disconnect(&self) -> Result<()>;
}
