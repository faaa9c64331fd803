use super::{
    GraphAdapter, GraphEdge, GraphNode, EDGE_EXTRACTED_FROM, EDGE_OWNS, EDGE_PARTICIPATES_IN,
    EDGE_SUPERSEDES,
};
use cortex_common::{Fact, Result, VectorMemory};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;

pub fn user_key(user_id: &str) -> String {
    format!("user:{user_id}")
}

pub fn agent_key(agent_id: &str) -> String {
    format!("agent:{agent_id}")
}

pub fn space_key(space_id: &str) -> String {
    format!("space:{space_id}")
}

pub fn fact_key(fact_id: &str) -> String {
    format!("fact:{fact_id}")
}

pub fn memory_key(memory_id: &str) -> String {
    format!("memory:{memory_id}")
}

/// Projects turns into the knowledge graph. Writes are serialized per
/// adapter instance; reads go straight through.
#[derive(Clone)]
pub struct GraphSync {
    adapter: Arc<dyn GraphAdapter>,
    write_lock: Arc<Mutex<()>>,
}

impl GraphSync {
    pub fn new(adapter: Arc<dyn GraphAdapter>) -> Self {
        Self {
            adapter,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn adapter(&self) -> &Arc<dyn GraphAdapter> {
        &self.adapter
    }

    /// Upsert the turn's node/edge projection: participants, the space, new
    /// memories and facts, and the supersession edges revision introduced.
    pub async fn sync_turn(
        &self,
        memory_space_id: &str,
        user_id: &str,
        agent_id: &str,
        memories: &[VectorMemory],
        facts: &[Fact],
        supersessions: &[(String, String)],
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        self.adapter
            .create_node(GraphNode::new(
                space_key(memory_space_id),
                "MemorySpace",
                json!({ "memorySpaceId": memory_space_id }),
            ))
            .await?;
        self.adapter
            .create_node(GraphNode::new(
                user_key(user_id),
                "User",
                json!({ "userId": user_id }),
            ))
            .await?;
        self.adapter
            .create_node(GraphNode::new(
                agent_key(agent_id),
                "Agent",
                json!({ "agentId": agent_id }),
            ))
            .await?;

        self.adapter
            .upsert_edge(GraphEdge::new(
                user_key(user_id),
                space_key(memory_space_id),
                EDGE_PARTICIPATES_IN,
            ))
            .await?;
        self.adapter
            .upsert_edge(GraphEdge::new(
                agent_key(agent_id),
                space_key(memory_space_id),
                EDGE_PARTICIPATES_IN,
            ))
            .await?;

        for memory in memories {
            self.adapter
                .create_node(GraphNode::new(
                    memory_key(&memory.id),
                    "Memory",
                    json!({
                        "memoryId": memory.id,
                        "memorySpaceId": memory.memory_space_id,
                        "userId": memory.user_id,
                        "content": memory.content,
                    }),
                ))
                .await?;
            self.adapter
                .upsert_edge(GraphEdge::new(
                    space_key(memory_space_id),
                    memory_key(&memory.id),
                    EDGE_OWNS,
                ))
                .await?;
        }

        for fact in facts {
            self.sync_fact_locked(fact).await?;
        }

        for (new_id, old_id) in supersessions {
            self.adapter
                .upsert_edge(GraphEdge::new(
                    fact_key(new_id),
                    fact_key(old_id),
                    EDGE_SUPERSEDES,
                ))
                .await?;
        }
        Ok(())
    }

    pub async fn sync_fact(&self, fact: &Fact) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.sync_fact_locked(fact).await
    }

    async fn sync_fact_locked(&self, fact: &Fact) -> Result<()> {
        self.adapter
            .create_node(GraphNode::new(
                fact_key(&fact.id),
                "Fact",
                json!({
                    "factId": fact.id,
                    "memorySpaceId": fact.memory_space_id,
                    "userId": fact.user_id,
                    "subject": fact.subject,
                    "statement": fact.statement,
                }),
            ))
            .await?;
        self.adapter
            .upsert_edge(GraphEdge::new(
                space_key(&fact.memory_space_id),
                fact_key(&fact.id),
                EDGE_OWNS,
            ))
            .await?;
        if let Some(user_id) = &fact.user_id {
            self.adapter
                .upsert_edge(GraphEdge::new(
                    fact_key(&fact.id),
                    user_key(user_id),
                    EDGE_EXTRACTED_FROM,
                ))
                .await?;
        }
        Ok(())
    }

    pub async fn delete_user_nodes(&self, user_id: &str) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        self.adapter
            .delete_nodes_with_property("userId", user_id)
            .await
    }

    pub async fn delete_space_nodes(&self, memory_space_id: &str) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        self.adapter
            .delete_nodes_with_property("memorySpaceId", memory_space_id)
            .await
    }

    pub async fn count_user_nodes(&self, user_id: &str) -> Result<usize> {
        Ok(self
            .adapter
            .nodes_with_property("userId", user_id)
            .await?
            .len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EmbeddedGraph;
    use cortex_common::{FactKind, MemorySource};

    fn fact(space: &str, user: &str) -> Fact {
        let now = cortex_common::now_ms();
        Fact {
            id: cortex_common::new_id(),
            memory_space_id: space.into(),
            user_id: Some(user.into()),
            statement: "user likes blue".into(),
            kind: FactKind::Preference {
                predicate: "favorite color".into(),
                object: "blue".into(),
            },
            subject: "user".into(),
            confidence: 90,
            valid_from: now,
            valid_until: None,
            superseded_by: None,
            category: None,
            search_aliases: Vec::new(),
            semantic_context: None,
            entities: Vec::new(),
            relations: Vec::new(),
            extensions: Default::default(),
            tenant_id: cortex_common::DEFAULT_TENANT.into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_sync_turn_projects_all_layers() -> anyhow::Result<()> {
        let graph = EmbeddedGraph::new();
        let sync = GraphSync::new(Arc::new(graph.clone()));

        let memory = VectorMemory::new("s1".into(), "hello".into(), MemorySource::Conversation);
        let f = fact("s1", "u1");
        sync.sync_turn("s1", "u1", "a1", &[memory], std::slice::from_ref(&f), &[])
            .await?;

        // space + user + agent + memory + fact
        assert_eq!(graph.node_count().await, 5);
        assert_eq!(sync.count_user_nodes("u1").await?, 1);

        let deleted = sync.delete_user_nodes("u1").await?;
        assert_eq!(deleted, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_supersession_edges() -> anyhow::Result<()> {
        let graph = EmbeddedGraph::new();
        let sync = GraphSync::new(Arc::new(graph.clone()));

        let old = fact("s1", "u1");
        let new = fact("s1", "u1");
        sync.sync_turn(
            "s1",
            "u1",
            "a1",
            &[],
            &[old.clone(), new.clone()],
            &[(new.id.clone(), old.id.clone())],
        )
        .await?;

        let path = graph
            .find_path(&fact_key(&new.id), &fact_key(&old.id), 1)
            .await?;
        assert_eq!(path.len(), 2);
        Ok(())
    }
}
