//! Data-access port. One store per logical table, all backed by the same
//! embedded storage trio (RocksDB rows, LanceDB vectors, Tantivy keywords).
//! Every mutation is a single row-store write, so it either commits entirely
//! or leaves storage unchanged.

pub mod agents;
pub mod contexts;
pub mod conversations;
pub mod facts;
pub mod memories;
pub mod records;
pub mod spaces;

use crate::storage::index::TextIndex;
use crate::storage::kv::KvStore;
use crate::storage::vector::VectorStore;
use cortex_common::{CortexError, Result};
use std::path::PathBuf;

pub use agents::AgentStore;
pub use contexts::ContextStore;
pub use conversations::ConversationStore;
pub use facts::FactStore;
pub use memories::MemoryStore;
pub use records::RecordStore;
pub use spaces::SpaceStore;

/// Row key for a tenant-scoped table.
pub(crate) fn row_key(table: &str, tenant_id: &str, id: &str) -> String {
    format!("{table}:{tenant_id}:{id}")
}

/// Prefix covering every row of a tenant's table.
pub(crate) fn table_prefix(table: &str, tenant_id: &str) -> String {
    format!("{table}:{tenant_id}:")
}

pub(crate) fn decode_row<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(CortexError::from)
}

pub(crate) fn encode_row<T: serde::Serialize>(row: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(row).map_err(|e| CortexError::invariant(format!("row encode failed: {e}")))
}

/// Bundle of all table stores. The shared handles stay cheap to clone.
#[derive(Clone)]
pub struct DataAccess {
    pub spaces: SpaceStore,
    pub agents: AgentStore,
    pub conversations: ConversationStore,
    pub memories: MemoryStore,
    pub facts: FactStore,
    pub contexts: ContextStore,
    pub records: RecordStore,
}

impl DataAccess {
    pub async fn open(root: impl Into<PathBuf>, embedding_dim: usize) -> Result<Self> {
        let root: PathBuf = root.into();
        std::fs::create_dir_all(&root).map_err(CortexError::transport)?;

        let kv_path = root.join("rocksdb");
        let kv = tokio::task::spawn_blocking(move || KvStore::open(kv_path))
            .await
            .map_err(CortexError::transport)??;

        let vector_path = root.join("lancedb");
        let vector_uri = vector_path
            .to_str()
            .ok_or_else(|| CortexError::validation("storage root is not valid UTF-8"))?
            .to_string();
        let vectors = VectorStore::new(&vector_uri, embedding_dim as i32).await?;

        let index_path = root.join("tantivy");
        let index = tokio::task::spawn_blocking(move || TextIndex::new(index_path))
            .await
            .map_err(CortexError::transport)??;

        Ok(Self {
            spaces: SpaceStore::new(kv.clone()),
            agents: AgentStore::new(kv.clone()),
            conversations: ConversationStore::new(kv.clone()),
            memories: MemoryStore::new(kv.clone(), vectors.clone(), index.clone()),
            facts: FactStore::new(kv.clone(), index.clone()),
            contexts: ContextStore::new(kv.clone()),
            records: RecordStore::new(kv),
        })
    }
}
