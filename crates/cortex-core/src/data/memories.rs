use super::{decode_row, encode_row, row_key, table_prefix};
use crate::storage::index::{DocKind, TextIndex};
use crate::storage::kv::KvStore;
use crate::storage::vector::{build_memory_filter, VectorStore};
use cortex_common::error::{require_id, require_limit};
use cortex_common::{CortexError, Result, VectorMemory};

const TABLE: &str = "mem";

/// Vector-memory store. The KV row is authoritative; LanceDB carries the
/// embedding for ANN search and Tantivy the content for keyword search.
#[derive(Clone)]
pub struct MemoryStore {
    kv: KvStore,
    vectors: VectorStore,
    index: TextIndex,
}

#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub memory: VectorMemory,
    /// Cosine similarity for vector hits, normalized keyword score otherwise.
    pub score: f32,
}

impl MemoryStore {
    pub fn new(kv: KvStore, vectors: VectorStore, index: TextIndex) -> Self {
        Self { kv, vectors, index }
    }

    pub async fn store(&self, memory: &VectorMemory) -> Result<()> {
        require_id(&memory.id, "memoryId")?;
        require_id(&memory.memory_space_id, "memorySpaceId")?;

        let key = row_key(TABLE, &memory.tenant_id, &memory.id);
        self.kv.put(key.as_bytes(), &encode_row(memory)?)?;

        if memory.embedding.is_some() {
            self.vectors.add(std::slice::from_ref(memory)).await?;
        }
        let index = self.index.clone();
        let m = memory.clone();
        tokio::task::spawn_blocking(move || {
            index.upsert(
                DocKind::Memory,
                &m.id,
                &m.tenant_id,
                &m.memory_space_id,
                m.user_id.as_deref(),
                &m.content,
                &m.tags,
                true,
            )
        })
        .await
        .map_err(CortexError::transport)??;
        Ok(())
    }

    pub fn get(&self, tenant_id: &str, id: &str) -> Result<Option<VectorMemory>> {
        require_id(id, "memoryId")?;
        match self.kv.get(row_key(TABLE, tenant_id, id).as_bytes())? {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list(
        &self,
        tenant_id: &str,
        memory_space_id: &str,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<VectorMemory>> {
        require_limit(limit)?;
        let prefix = table_prefix(TABLE, tenant_id);
        let mut memories = Vec::new();
        for (_, bytes) in self.kv.scan(prefix.as_bytes())? {
            let memory: VectorMemory = decode_row(&bytes)?;
            if memory.memory_space_id != memory_space_id {
                continue;
            }
            if let Some(uid) = user_id {
                if memory.user_id.as_deref() != Some(uid) {
                    continue;
                }
            }
            memories.push(memory);
            if memories.len() >= limit {
                break;
            }
        }
        Ok(memories)
    }

    pub fn list_for_user(&self, tenant_id: &str, user_id: &str) -> Result<Vec<VectorMemory>> {
        let prefix = table_prefix(TABLE, tenant_id);
        let mut memories = Vec::new();
        for (_, bytes) in self.kv.scan(prefix.as_bytes())? {
            let memory: VectorMemory = decode_row(&bytes)?;
            if memory.user_id.as_deref() == Some(user_id) {
                memories.push(memory);
            }
        }
        Ok(memories)
    }

    /// Hybrid search: ANN when an embedding is supplied, keyword otherwise.
    /// Both paths apply the same tenant/space/user/importance scoping.
    pub async fn search(
        &self,
        tenant_id: &str,
        memory_space_id: &str,
        query: &str,
        embedding: Option<&[f32]>,
        user_id: Option<&str>,
        min_importance: Option<u8>,
        limit: usize,
    ) -> Result<Vec<MemoryHit>> {
        require_limit(limit)?;
        let scored: Vec<(String, f32)> = match embedding {
            Some(vector) => {
                let filter =
                    build_memory_filter(tenant_id, memory_space_id, user_id, min_importance);
                match self.vectors.search(vector, limit * 2, Some(filter)).await {
                    Ok(hits) => hits,
                    Err(e) => {
                        // A fresh store with no vectors yet is not an error
                        // worth failing recall over.
                        tracing::warn!("vector search degraded to keyword: {e}");
                        self.keyword_hits(tenant_id, memory_space_id, query, limit)?
                    }
                }
            }
            None => self.keyword_hits(tenant_id, memory_space_id, query, limit)?,
        };

        let mut hits = Vec::new();
        for (id, score) in scored {
            let Some(memory) = self.get(tenant_id, &id)? else {
                continue;
            };
            if let Some(uid) = user_id {
                if memory.user_id.as_deref() != Some(uid) {
                    continue;
                }
            }
            if let Some(min) = min_importance {
                if memory.importance < min {
                    continue;
                }
            }
            hits.push(MemoryHit { memory, score });
            if hits.len() >= limit {
                break;
            }
        }
        Ok(hits)
    }

    fn keyword_hits(
        &self,
        tenant_id: &str,
        memory_space_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(String, f32)>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.index
            .search(DocKind::Memory, tenant_id, memory_space_id, query, limit * 2, false)
    }

    pub async fn delete(&self, tenant_id: &str, id: &str) -> Result<()> {
        require_id(id, "memoryId")?;
        self.kv.delete(row_key(TABLE, tenant_id, id).as_bytes())?;
        self.vectors.delete_by_id(id).await?;
        let index = self.index.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || index.delete(&id))
            .await
            .map_err(CortexError::transport)??;
        Ok(())
    }

    pub async fn delete_many(&self, tenant_id: &str, ids: &[String]) -> Result<usize> {
        let mut deleted = 0;
        for id in ids {
            if self.get(tenant_id, id)?.is_some() {
                self.delete(tenant_id, id).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Remove every memory in a space. Returns the number of rows deleted.
    pub async fn purge_all(&self, tenant_id: &str, memory_space_id: &str) -> Result<usize> {
        let prefix = table_prefix(TABLE, tenant_id);
        let mut ids = Vec::new();
        for (_, bytes) in self.kv.scan(prefix.as_bytes())? {
            let memory: VectorMemory = decode_row(&bytes)?;
            if memory.memory_space_id == memory_space_id {
                ids.push(memory.id);
            }
        }
        self.delete_many(tenant_id, &ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::index::TextIndex;
    use cortex_common::MemorySource;
    use tempfile::tempdir;

    async fn store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempdir().expect("tempdir");
        let kv = KvStore::open(dir.path().join("kv")).expect("kv");
        let vectors = VectorStore::new(dir.path().join("lance").to_str().unwrap(), 4)
            .await
            .expect("vectors");
        let index = TextIndex::new(dir.path().join("tantivy")).expect("index");
        (dir, MemoryStore::new(kv, vectors, index))
    }

    #[tokio::test]
    async fn test_keyword_search_without_embedder() -> anyhow::Result<()> {
        let (_dir, store) = store().await;
        let memory = VectorMemory::new(
            "s1".into(),
            "Alice mentioned she works at Acme".into(),
            MemorySource::Conversation,
        );
        store.store(&memory).await?;

        let hits = store
            .search(&memory.tenant_id, "s1", "works acme", None, None, None, 10)
            .await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory.id, memory.id);
        Ok(())
    }

    #[tokio::test]
    async fn test_min_importance_filters() -> anyhow::Result<()> {
        let (_dir, store) = store().await;
        let mut low = VectorMemory::new("s1".into(), "low value note".into(), MemorySource::Tool);
        low.importance = 10;
        let mut high = VectorMemory::new("s1".into(), "high value note".into(), MemorySource::Tool);
        high.importance = 90;
        store.store(&low).await?;
        store.store(&high).await?;

        let hits = store
            .search(&low.tenant_id, "s1", "value note", None, None, Some(50), 10)
            .await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory.id, high.id);
        Ok(())
    }

    #[tokio::test]
    async fn test_purge_all_scoped_to_space() -> anyhow::Result<()> {
        let (_dir, store) = store().await;
        let a = VectorMemory::new("s1".into(), "one".into(), MemorySource::System);
        let b = VectorMemory::new("s1".into(), "two".into(), MemorySource::System);
        let c = VectorMemory::new("s2".into(), "three".into(), MemorySource::System);
        for m in [&a, &b, &c] {
            store.store(m).await?;
        }

        let deleted = store.purge_all(&a.tenant_id, "s1").await?;
        assert_eq!(deleted, 2);
        assert!(store.get(&a.tenant_id, &a.id)?.is_none());
        assert!(store.get(&c.tenant_id, &c.id)?.is_some());
        Ok(())
    }
}
