use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, StringArray, UInt8Array,
};
use arrow_schema::{DataType, Field, Schema};
use cortex_common::{CortexError, Result, VectorMemory};
use futures::StreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Connection};
use std::sync::Arc;

pub const MEMORIES_TABLE: &str = "memories";

/// ANN index over vector memories. The KV row store stays authoritative;
/// this table only serves similarity search.
#[derive(Clone)]
pub struct VectorStore {
    conn: Connection,
    dim: i32,
}

fn escape_sql_string(s: &str) -> String {
    s.replace('\'', "''")
}

/// Build a LanceDB filter expression scoped to a tenant and space, with
/// optional user and importance narrowing.
pub fn build_memory_filter(
    tenant_id: &str,
    memory_space_id: &str,
    user_id: Option<&str>,
    min_importance: Option<u8>,
) -> String {
    let mut conditions = vec![
        format!("tenant_id = '{}'", escape_sql_string(tenant_id)),
        format!(
            "memory_space_id = '{}'",
            escape_sql_string(memory_space_id)
        ),
    ];
    if let Some(uid) = user_id {
        conditions.push(format!("user_id = '{}'", escape_sql_string(uid)));
    }
    if let Some(min) = min_importance {
        conditions.push(format!("importance >= {min}"));
    }
    conditions.join(" AND ")
}

impl VectorStore {
    pub async fn new(path: &str, dim: i32) -> Result<Self> {
        let conn = connect(path)
            .execute()
            .await
            .map_err(CortexError::transport)?;
        let store = Self { conn, dim };
        store.ensure_table().await?;
        Ok(store)
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("tenant_id", DataType::Utf8, false),
            Field::new("memory_space_id", DataType::Utf8, false),
            Field::new("user_id", DataType::Utf8, false),
            Field::new("content", DataType::Utf8, false),
            Field::new("importance", DataType::UInt8, false),
            Field::new("created_at", DataType::Int64, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dim,
                ),
                false,
            ),
        ]))
    }

    async fn ensure_table(&self) -> Result<()> {
        let tables = self
            .conn
            .table_names()
            .execute()
            .await
            .map_err(CortexError::transport)?;
        if tables.contains(&MEMORIES_TABLE.to_string()) {
            return Ok(());
        }
        self.conn
            .create_empty_table(MEMORIES_TABLE, self.schema())
            .execute()
            .await
            .map_err(CortexError::transport)?;
        Ok(())
    }

    pub async fn add(&self, memories: &[VectorMemory]) -> Result<()> {
        let with_embeddings: Vec<&VectorMemory> =
            memories.iter().filter(|m| m.embedding.is_some()).collect();
        if with_embeddings.is_empty() {
            return Ok(());
        }

        let table = self
            .conn
            .open_table(MEMORIES_TABLE)
            .execute()
            .await
            .map_err(CortexError::transport)?;

        let mut ids = Vec::new();
        let mut tenants = Vec::new();
        let mut spaces = Vec::new();
        let mut users = Vec::new();
        let mut contents = Vec::new();
        let mut importances = Vec::new();
        let mut created = Vec::new();
        let mut vectors_flat = Vec::new();

        for memory in &with_embeddings {
            ids.push(memory.id.clone());
            tenants.push(memory.tenant_id.clone());
            spaces.push(memory.memory_space_id.clone());
            users.push(memory.user_id.clone().unwrap_or_default());
            contents.push(memory.content.clone());
            importances.push(memory.importance);
            created.push(memory.created_at);

            let emb = memory.embedding.as_ref().expect("filtered above");
            if emb.len() != self.dim as usize {
                let mut e = emb.clone();
                e.resize(self.dim as usize, 0.0);
                vectors_flat.extend(e);
            } else {
                vectors_flat.extend(emb.iter().copied());
            }
        }

        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let values = Arc::new(Float32Array::from(vectors_flat));
        let vector_array = Arc::new(FixedSizeListArray::new(field, self.dim, values, None));

        let schema = table.schema().await.map_err(CortexError::transport)?;
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(ids)) as Arc<dyn Array>,
                Arc::new(StringArray::from(tenants)) as Arc<dyn Array>,
                Arc::new(StringArray::from(spaces)) as Arc<dyn Array>,
                Arc::new(StringArray::from(users)) as Arc<dyn Array>,
                Arc::new(StringArray::from(contents)) as Arc<dyn Array>,
                Arc::new(UInt8Array::from(importances)) as Arc<dyn Array>,
                Arc::new(Int64Array::from(created)) as Arc<dyn Array>,
                vector_array as Arc<dyn Array>,
            ],
        )
        .map_err(CortexError::transport)?;

        let batch_iter =
            arrow_array::RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema);
        table
            .add(batch_iter)
            .execute()
            .await
            .map_err(CortexError::transport)?;
        Ok(())
    }

    /// Nearest-neighbour search returning `(memory id, similarity)` pairs.
    /// Distances collapse to `1 / (1 + d)` so higher is better.
    pub async fn search(
        &self,
        query_vector: &[f32],
        limit: usize,
        filter: Option<String>,
    ) -> Result<Vec<(String, f32)>> {
        let table = self
            .conn
            .open_table(MEMORIES_TABLE)
            .execute()
            .await
            .map_err(CortexError::transport)?;

        let mut q = query_vector.to_vec();
        q.resize(self.dim as usize, 0.0);

        let mut query = table
            .query()
            .nearest_to(q.as_slice())
            .map_err(CortexError::transport)?
            .limit(limit);
        if let Some(f) = filter {
            query = query.only_if(f);
        }

        let mut stream = query.execute().await.map_err(CortexError::transport)?;
        let mut results = Vec::new();
        while let Some(batch_res) = stream.next().await {
            let batch: RecordBatch = batch_res.map_err(CortexError::transport)?;
            let id_col = batch
                .column_by_name("id")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                .ok_or_else(|| CortexError::invariant("vector table missing id column"))?;
            let dist_col = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| CortexError::invariant("vector search missing _distance"))?;

            for i in 0..id_col.len() {
                let score = 1.0 / (1.0 + dist_col.value(i));
                results.push((id_col.value(i).to_string(), score));
            }
        }
        Ok(results)
    }

    pub async fn delete_by_id(&self, id: &str) -> Result<()> {
        let table = self
            .conn
            .open_table(MEMORIES_TABLE)
            .execute()
            .await
            .map_err(CortexError::transport)?;
        table
            .delete(&format!("id = '{}'", escape_sql_string(id)))
            .await
            .map_err(CortexError::transport)?;
        Ok(())
    }

    pub async fn delete_where(&self, predicate: &str) -> Result<()> {
        let table = self
            .conn
            .open_table(MEMORIES_TABLE)
            .execute()
            .await
            .map_err(CortexError::transport)?;
        table
            .delete(predicate)
            .await
            .map_err(CortexError::transport)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_common::MemorySource;
    use tempfile::tempdir;

    fn memory_with_embedding(space: &str, content: &str, embedding: Vec<f32>) -> VectorMemory {
        let mut m = VectorMemory::new(space.into(), content.into(), MemorySource::Conversation);
        m.embedding = Some(embedding);
        m
    }

    #[tokio::test]
    async fn test_add_and_search() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let store = VectorStore::new(temp_dir.path().to_str().unwrap(), 8).await?;

        let mut embedding = vec![0.0; 8];
        embedding[0] = 1.0;
        let memory = memory_with_embedding("s1", "vector test", embedding.clone());
        store.add(std::slice::from_ref(&memory)).await?;

        let filter = build_memory_filter(&memory.tenant_id, "s1", None, None);
        let results = store.search(&embedding, 5, Some(filter)).await?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, memory.id);
        assert!(results[0].1 > 0.99);
        Ok(())
    }

    #[tokio::test]
    async fn test_filter_isolates_spaces() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let store = VectorStore::new(temp_dir.path().to_str().unwrap(), 4).await?;

        let embedding = vec![0.5, 0.5, 0.0, 0.0];
        let a = memory_with_embedding("space-a", "alpha", embedding.clone());
        let b = memory_with_embedding("space-b", "beta", embedding.clone());
        store.add(&[a.clone(), b]).await?;

        let filter = build_memory_filter(&a.tenant_id, "space-a", None, None);
        let results = store.search(&embedding, 10, Some(filter)).await?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, a.id);
        Ok(())
    }

    #[test]
    fn test_filter_escapes_quotes() {
        let filter = build_memory_filter("t'1", "s1", Some("u'x"), Some(30));
        assert!(filter.contains("t''1"));
        assert!(filter.contains("u''x"));
        assert!(filter.contains("importance >= 30"));
    }
}
