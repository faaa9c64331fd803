use crate::data::DataAccess;
use crate::graph::GraphSync;
use cortex_common::error::require_id;
use cortex_common::Result;
use serde::Serialize;

pub const USER_RECORD_TYPE: &str = "user";

#[derive(Debug, Clone, Default, Serialize)]
pub struct CascadeVerification {
    pub complete: bool,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UserCascadeSummary {
    pub user_id: String,
    pub dry_run: bool,
    pub conversations_deleted: usize,
    pub vector_memories_deleted: usize,
    pub facts_deleted: usize,
    pub contexts_deleted: usize,
    pub mutable_records_deleted: usize,
    pub immutable_records_deleted: usize,
    pub user_profile_deleted: bool,
    pub graph_nodes_deleted: u64,
    pub total_deleted: usize,
    pub deleted_layers: Vec<String>,
    pub verification: CascadeVerification,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SpaceCascadeSummary {
    pub memory_space_id: String,
    pub dry_run: bool,
    pub conversations_deleted: usize,
    pub vector_memories_deleted: usize,
    pub facts_deleted: usize,
    pub contexts_deleted: usize,
    pub graph_nodes_deleted: u64,
    pub total_deleted: usize,
    pub verification: CascadeVerification,
}

/// Deletes a user or a memory space across every layer in dependency order,
/// then re-counts to verify. A failing layer is recorded in the verification
/// issues and the remaining layers still run.
#[derive(Clone)]
pub struct CascadeCoordinator {
    data: DataAccess,
    graph: Option<GraphSync>,
}

impl CascadeCoordinator {
    pub fn new(data: DataAccess, graph: Option<GraphSync>) -> Self {
        Self { data, graph }
    }

    /// GDPR sweep: every row carrying the user id, in dependency order
    /// (conversations, memories, facts, contexts, mutable, immutable, the
    /// profile itself, then graph nodes). `dry_run` only enumerates.
    pub async fn delete_user(&self, tenant_id: &str, user_id: &str, dry_run: bool) -> Result<UserCascadeSummary> {
        require_id(user_id, "userId")?;
        let mut summary = UserCascadeSummary {
            user_id: user_id.to_string(),
            dry_run,
            ..UserCascadeSummary::default()
        };
        let issues = &mut summary.verification.issues;

        // 1-2. Enumerate per layer.
        let conversations = self
            .data
            .conversations
            .list(tenant_id, None, Some(user_id), 1000)
            .unwrap_or_else(|e| {
                issues.push(format!("conversations enumeration failed: {e}"));
                Vec::new()
            });
        let memories = self
            .data
            .memories
            .list_for_user(tenant_id, user_id)
            .unwrap_or_else(|e| {
                issues.push(format!("memories enumeration failed: {e}"));
                Vec::new()
            });
        let facts = self
            .data
            .facts
            .list_for_user(tenant_id, user_id)
            .unwrap_or_else(|e| {
                issues.push(format!("facts enumeration failed: {e}"));
                Vec::new()
            });
        let contexts = self
            .data
            .contexts
            .list_for_user(tenant_id, user_id)
            .unwrap_or_else(|e| {
                issues.push(format!("contexts enumeration failed: {e}"));
                Vec::new()
            });
        let mutable = self
            .data
            .records
            .mutable_list_for_user(tenant_id, user_id)
            .unwrap_or_else(|e| {
                issues.push(format!("mutable enumeration failed: {e}"));
                Vec::new()
            });
        let immutable = self
            .data
            .records
            .immutable_list_for_user(tenant_id, user_id, Some(USER_RECORD_TYPE))
            .unwrap_or_else(|e| {
                issues.push(format!("immutable enumeration failed: {e}"));
                Vec::new()
            });
        let has_profile = self
            .data
            .records
            .immutable_get(tenant_id, USER_RECORD_TYPE, user_id)
            .unwrap_or(None)
            .is_some();
        let graph_nodes = match &self.graph {
            Some(graph) => graph.count_user_nodes(user_id).await.unwrap_or_else(|e| {
                issues.push(format!("graph enumeration failed: {e}"));
                0
            }),
            None => 0,
        };

        summary.conversations_deleted = conversations.len();
        summary.vector_memories_deleted = memories.len();
        summary.facts_deleted = facts.len();
        summary.contexts_deleted = contexts.len();
        summary.mutable_records_deleted = mutable.len();
        summary.immutable_records_deleted = immutable.len();
        summary.user_profile_deleted = has_profile;
        summary.graph_nodes_deleted = graph_nodes as u64;

        if dry_run {
            summary.total_deleted = summary.conversations_deleted
                + summary.vector_memories_deleted
                + summary.facts_deleted
                + summary.contexts_deleted
                + summary.mutable_records_deleted
                + summary.immutable_records_deleted
                + usize::from(has_profile);
            summary.verification.complete = issues.is_empty();
            return Ok(summary);
        }

        // 3. Delete in dependency order, continuing past failures.
        for conversation in &conversations {
            if let Err(e) = self.data.conversations.delete(tenant_id, &conversation.id) {
                issues.push(format!("conversation {} delete failed: {e}", conversation.id));
            }
        }
        summary.deleted_layers.push("conversations".into());
        for memory in &memories {
            if let Err(e) = self.data.memories.delete(tenant_id, &memory.id).await {
                issues.push(format!("memory {} delete failed: {e}", memory.id));
            }
        }
        summary.deleted_layers.push("vectorMemories".into());
        for fact in &facts {
            if let Err(e) = self.data.facts.delete(tenant_id, &fact.id).await {
                issues.push(format!("fact {} delete failed: {e}", fact.id));
            }
        }
        summary.deleted_layers.push("facts".into());
        for context in &contexts {
            if let Err(e) = self.data.contexts.delete(tenant_id, &context.id) {
                issues.push(format!("context {} delete failed: {e}", context.id));
            }
        }
        summary.deleted_layers.push("contexts".into());
        for record in &mutable {
            if let Err(e) =
                self.data
                    .records
                    .mutable_delete(tenant_id, &record.namespace, &record.key)
            {
                issues.push(format!(
                    "mutable {}/{} delete failed: {e}",
                    record.namespace, record.key
                ));
            }
        }
        summary.deleted_layers.push("mutable".into());
        for record in &immutable {
            if let Err(e) =
                self.data
                    .records
                    .immutable_purge(tenant_id, &record.record_type, &record.id)
            {
                issues.push(format!(
                    "immutable {}/{} delete failed: {e}",
                    record.record_type, record.id
                ));
            }
        }
        summary.deleted_layers.push("immutable".into());
        if has_profile {
            if let Err(e) = self
                .data
                .records
                .immutable_purge(tenant_id, USER_RECORD_TYPE, user_id)
            {
                issues.push(format!("user profile delete failed: {e}"));
            }
        }
        summary.deleted_layers.push("userProfile".into());
        if let Some(graph) = &self.graph {
            match graph.delete_user_nodes(user_id).await {
                Ok(count) => summary.graph_nodes_deleted = count,
                Err(e) => issues.push(format!("graph delete failed: {e}")),
            }
            summary.deleted_layers.push("graph".into());
        }

        summary.total_deleted = summary.conversations_deleted
            + summary.vector_memories_deleted
            + summary.facts_deleted
            + summary.contexts_deleted
            + summary.mutable_records_deleted
            + summary.immutable_records_deleted
            + usize::from(has_profile);

        // 4. Verification: re-count every layer.
        self.verify_user_gone(tenant_id, user_id, &mut summary).await;
        Ok(summary)
    }

    async fn verify_user_gone(
        &self,
        tenant_id: &str,
        user_id: &str,
        summary: &mut UserCascadeSummary,
    ) {
        let issues = &mut summary.verification.issues;
        let leftover_conversations = self
            .data
            .conversations
            .list(tenant_id, None, Some(user_id), 1000)
            .map(|c| c.len())
            .unwrap_or(0);
        if leftover_conversations > 0 {
            issues.push(format!("{leftover_conversations} conversations remain"));
        }
        let leftover_memories = self
            .data
            .memories
            .list_for_user(tenant_id, user_id)
            .map(|m| m.len())
            .unwrap_or(0);
        if leftover_memories > 0 {
            issues.push(format!("{leftover_memories} vector memories remain"));
        }
        let leftover_facts = self
            .data
            .facts
            .list_for_user(tenant_id, user_id)
            .map(|f| f.len())
            .unwrap_or(0);
        if leftover_facts > 0 {
            issues.push(format!("{leftover_facts} facts remain"));
        }
        let leftover_profile = self
            .data
            .records
            .immutable_get(tenant_id, USER_RECORD_TYPE, user_id)
            .unwrap_or(None)
            .is_some();
        if leftover_profile {
            issues.push("user profile remains".into());
        }
        if let Some(graph) = &self.graph {
            let leftover_nodes = graph.count_user_nodes(user_id).await.unwrap_or(0);
            if leftover_nodes > 0 {
                issues.push(format!("{leftover_nodes} graph nodes remain"));
            }
        }
        summary.verification.complete = issues.is_empty();
    }

    /// Space cascade: same sweep scoped to one memory space. User profiles
    /// are untouched; a user is orthogonal to spaces.
    pub async fn delete_space(
        &self,
        tenant_id: &str,
        memory_space_id: &str,
        dry_run: bool,
    ) -> Result<SpaceCascadeSummary> {
        require_id(memory_space_id, "memorySpaceId")?;
        let mut summary = SpaceCascadeSummary {
            memory_space_id: memory_space_id.to_string(),
            dry_run,
            ..SpaceCascadeSummary::default()
        };
        let issues = &mut summary.verification.issues;

        let conversations = self
            .data
            .conversations
            .list(tenant_id, Some(memory_space_id), None, 1000)
            .unwrap_or_else(|e| {
                issues.push(format!("conversations enumeration failed: {e}"));
                Vec::new()
            });
        let memories = self
            .data
            .memories
            .list(tenant_id, memory_space_id, None, 1000)
            .unwrap_or_else(|e| {
                issues.push(format!("memories enumeration failed: {e}"));
                Vec::new()
            });
        let facts = self
            .data
            .facts
            .list(tenant_id, memory_space_id, false, 1000)
            .unwrap_or_else(|e| {
                issues.push(format!("facts enumeration failed: {e}"));
                Vec::new()
            });
        let contexts = self
            .data
            .contexts
            .list_for_space(tenant_id, memory_space_id)
            .unwrap_or_else(|e| {
                issues.push(format!("contexts enumeration failed: {e}"));
                Vec::new()
            });

        summary.conversations_deleted = conversations.len();
        summary.vector_memories_deleted = memories.len();
        summary.facts_deleted = facts.len();
        summary.contexts_deleted = contexts.len();

        if dry_run {
            summary.total_deleted = summary.conversations_deleted
                + summary.vector_memories_deleted
                + summary.facts_deleted
                + summary.contexts_deleted;
            summary.verification.complete = issues.is_empty();
            return Ok(summary);
        }

        for conversation in &conversations {
            if let Err(e) = self.data.conversations.delete(tenant_id, &conversation.id) {
                issues.push(format!("conversation {} delete failed: {e}", conversation.id));
            }
        }
        if let Err(e) = self.data.memories.purge_all(tenant_id, memory_space_id).await {
            issues.push(format!("memory purge failed: {e}"));
        }
        if let Err(e) = self.data.facts.purge_all(tenant_id, memory_space_id).await {
            issues.push(format!("fact purge failed: {e}"));
        }
        for context in &contexts {
            if let Err(e) = self.data.contexts.delete(tenant_id, &context.id) {
                issues.push(format!("context {} delete failed: {e}", context.id));
            }
        }
        if let Err(e) = self.data.spaces.delete(tenant_id, memory_space_id) {
            issues.push(format!("space row delete failed: {e}"));
        }
        if let Some(graph) = &self.graph {
            match graph.delete_space_nodes(memory_space_id).await {
                Ok(count) => summary.graph_nodes_deleted = count,
                Err(e) => issues.push(format!("graph delete failed: {e}")),
            }
        }

        summary.total_deleted = summary.conversations_deleted
            + summary.vector_memories_deleted
            + summary.facts_deleted
            + summary.contexts_deleted;

        let leftover = self
            .data
            .memories
            .list(tenant_id, memory_space_id, None, 1000)
            .map(|m| m.len())
            .unwrap_or(0)
            + self
                .data
                .facts
                .list(tenant_id, memory_space_id, false, 1000)
                .map(|f| f.len())
                .unwrap_or(0);
        if leftover > 0 {
            issues.push(format!("{leftover} rows remain in space"));
        }
        summary.verification.complete = issues.is_empty();
        Ok(summary)
    }
}
