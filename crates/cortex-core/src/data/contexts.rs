use super::{decode_row, encode_row, row_key, table_prefix};
use crate::storage::kv::KvStore;
use cortex_common::error::require_id;
use cortex_common::{new_id, now_ms, ContextNode, CortexError, Result};
use serde_json::Value;

const TABLE: &str = "ctx";

/// Context-chain store. Nodes form a forest per space; links are created by
/// parent pointer only, so cycles cannot be introduced.
#[derive(Clone)]
pub struct ContextStore {
    kv: KvStore,
}

impl ContextStore {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    pub fn create(
        &self,
        tenant_id: &str,
        memory_space_id: &str,
        parent_id: Option<&str>,
        payload: Value,
    ) -> Result<ContextNode> {
        require_id(memory_space_id, "memorySpaceId")?;
        let now = now_ms();
        let node = ContextNode {
            id: new_id(),
            memory_space_id: memory_space_id.to_string(),
            parent_id: parent_id.map(str::to_string),
            children_ids: Vec::new(),
            payload,
            tenant_id: tenant_id.to_string(),
            created_at: now,
            updated_at: now,
        };

        if let Some(pid) = parent_id {
            let mut parent = self
                .get(tenant_id, pid)?
                .ok_or_else(|| CortexError::not_found(format!("context {pid}")))?;
            if parent.memory_space_id != memory_space_id {
                return Err(CortexError::validation(
                    "parent context belongs to a different memory space",
                ));
            }
            parent.children_ids.push(node.id.clone());
            parent.updated_at = now;
            let parent_key = row_key(TABLE, tenant_id, pid);
            let node_key = row_key(TABLE, tenant_id, &node.id);
            self.kv.write_batch(
                vec![
                    (parent_key.into_bytes(), encode_row(&parent)?),
                    (node_key.into_bytes(), encode_row(&node)?),
                ],
                Vec::new(),
            )?;
        } else {
            let key = row_key(TABLE, tenant_id, &node.id);
            self.kv.put(key.as_bytes(), &encode_row(&node)?)?;
        }
        Ok(node)
    }

    pub fn get(&self, tenant_id: &str, id: &str) -> Result<Option<ContextNode>> {
        require_id(id, "contextId")?;
        match self.kv.get(row_key(TABLE, tenant_id, id).as_bytes())? {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    /// A node plus its ancestor chain, root last.
    pub fn get_with_chain(&self, tenant_id: &str, id: &str) -> Result<Vec<ContextNode>> {
        let mut chain = Vec::new();
        let mut cursor = Some(id.to_string());
        while let Some(current_id) = cursor {
            let node = self
                .get(tenant_id, &current_id)?
                .ok_or_else(|| CortexError::not_found(format!("context {current_id}")))?;
            cursor = node.parent_id.clone();
            chain.push(node);
            if chain.len() > 10_000 {
                return Err(CortexError::invariant("context chain exceeds 10000 nodes"));
            }
        }
        Ok(chain)
    }

    pub fn update_payload(&self, tenant_id: &str, id: &str, payload: Value) -> Result<ContextNode> {
        let mut node = self
            .get(tenant_id, id)?
            .ok_or_else(|| CortexError::not_found(format!("context {id}")))?;
        node.payload = payload;
        node.updated_at = now_ms();
        let key = row_key(TABLE, tenant_id, id);
        self.kv.put(key.as_bytes(), &encode_row(&node)?)?;
        Ok(node)
    }

    pub fn children(&self, tenant_id: &str, id: &str) -> Result<Vec<ContextNode>> {
        let node = self
            .get(tenant_id, id)?
            .ok_or_else(|| CortexError::not_found(format!("context {id}")))?;
        let mut children = Vec::with_capacity(node.children_ids.len());
        for child_id in &node.children_ids {
            if let Some(child) = self.get(tenant_id, child_id)? {
                children.push(child);
            }
        }
        Ok(children)
    }

    pub fn delete(&self, tenant_id: &str, id: &str) -> Result<()> {
        let node = self
            .get(tenant_id, id)?
            .ok_or_else(|| CortexError::not_found(format!("context {id}")))?;
        // Detach from the parent so its child list stays accurate.
        if let Some(pid) = &node.parent_id {
            if let Some(mut parent) = self.get(tenant_id, pid)? {
                parent.children_ids.retain(|c| c != id);
                parent.updated_at = now_ms();
                let key = row_key(TABLE, tenant_id, pid);
                self.kv.put(key.as_bytes(), &encode_row(&parent)?)?;
            }
        }
        self.kv.delete(row_key(TABLE, tenant_id, id).as_bytes())
    }

    pub fn list_for_space(&self, tenant_id: &str, memory_space_id: &str) -> Result<Vec<ContextNode>> {
        let prefix = table_prefix(TABLE, tenant_id);
        let mut nodes = Vec::new();
        for (_, bytes) in self.kv.scan(prefix.as_bytes())? {
            let node: ContextNode = decode_row(&bytes)?;
            if node.memory_space_id == memory_space_id {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    pub fn list_for_user(&self, tenant_id: &str, user_id: &str) -> Result<Vec<ContextNode>> {
        let prefix = table_prefix(TABLE, tenant_id);
        let mut nodes = Vec::new();
        for (_, bytes) in self.kv.scan(prefix.as_bytes())? {
            let node: ContextNode = decode_row(&bytes)?;
            if node.payload.get("userId").and_then(Value::as_str) == Some(user_id) {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, ContextStore) {
        let dir = tempdir().expect("tempdir");
        let kv = KvStore::open(dir.path()).expect("kv");
        (dir, ContextStore::new(kv))
    }

    #[test]
    fn test_chain_walks_to_root() -> anyhow::Result<()> {
        let (_dir, store) = store();
        let root = store.create("t1", "s1", None, json!({"name": "root"}))?;
        let child = store.create("t1", "s1", Some(&root.id), json!({"name": "child"}))?;
        let leaf = store.create("t1", "s1", Some(&child.id), json!({"name": "leaf"}))?;

        let chain = store.get_with_chain("t1", &leaf.id)?;
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].id, leaf.id);
        assert_eq!(chain[2].id, root.id);

        let children = store.children("t1", &root.id)?;
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, child.id);
        Ok(())
    }

    #[test]
    fn test_delete_detaches_from_parent() -> anyhow::Result<()> {
        let (_dir, store) = store();
        let root = store.create("t1", "s1", None, json!({}))?;
        let child = store.create("t1", "s1", Some(&root.id), json!({}))?;

        store.delete("t1", &child.id)?;
        let root = store.get("t1", &root.id)?.unwrap();
        assert!(root.children_ids.is_empty());
        Ok(())
    }

    #[test]
    fn test_cross_space_parent_rejected() -> anyhow::Result<()> {
        let (_dir, store) = store();
        let root = store.create("t1", "s1", None, json!({}))?;
        let result = store.create("t1", "s2", Some(&root.id), json!({}));
        assert!(matches!(result, Err(CortexError::Validation(_))));
        Ok(())
    }
}
