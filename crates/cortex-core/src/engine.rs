use crate::cascade::{CascadeCoordinator, SpaceCascadeSummary, UserCascadeSummary, USER_RECORD_TYPE};
use crate::data::facts::FactHit;
use crate::data::DataAccess;
use crate::graph::{EmbeddedGraph, GraphAdapter, GraphCredentials, GraphSync};
use crate::llm::{create_completer, create_embedder, Completer, Embedder};
use crate::observer::{ObserverHub, OrchestrationObserver};
use crate::orchestrator::{MemoryOrchestrator, RememberInput, RememberResult};
use crate::recall::{RecallPlanner, RecallRequest, RecallResult};
use crate::revision::RevisionEngine;
use crate::stream::{ChunkStream, ResumeToken, StreamHooks, StreamInput, StreamOrchestrator, StreamSession};
use cortex_common::config::CortexConfig;
use cortex_common::{
    Conversation, ConversationType, ContextNode, CortexError, Fact, ImmutableRecord, MemorySpace,
    Message, MutableRecord, Participants, Result, SpaceType, VectorMemory,
};
use serde_json::Value;
use std::sync::Arc;

/// One constructed library instance: owns its storage handles, ports and
/// orchestrators. Callers wanting process-wide sharing wrap one instance in
/// their own singleton; there is no global state here.
pub struct CortexEngine {
    tenant_id: String,
    data: DataAccess,
    orchestrator: Arc<MemoryOrchestrator>,
    stream: StreamOrchestrator,
    recall: RecallPlanner,
    cascade: CascadeCoordinator,
}

impl CortexEngine {
    /// Construct from configuration alone: ports are created from the
    /// configured providers, and the graph defaults to the embedded adapter
    /// when sync is enabled.
    pub async fn connect(config: CortexConfig) -> Result<Self> {
        let completer = create_completer(&config.llm);
        let embedder = create_embedder(&config.llm);
        let graph_adapter: Option<Arc<dyn GraphAdapter>> = config
            .graph
            .enabled
            .then(|| Arc::new(EmbeddedGraph::new()) as Arc<dyn GraphAdapter>);
        Self::connect_with(config, completer, embedder, graph_adapter, None).await
    }

    /// Construct with explicit capabilities; the seam tests and embedders
    /// of custom providers use.
    pub async fn connect_with(
        config: CortexConfig,
        completer: Option<Arc<dyn Completer>>,
        embedder: Option<Arc<dyn Embedder>>,
        graph_adapter: Option<Arc<dyn GraphAdapter>>,
        observer: Option<Arc<dyn OrchestrationObserver>>,
    ) -> Result<Self> {
        if config.backend_url.trim().is_empty() {
            return Err(CortexError::validation("backend_url must not be empty"));
        }
        let data = DataAccess::open(config.storage_root(), config.embedding_dim).await?;

        let graph = match graph_adapter {
            None => None,
            Some(adapter) => {
                if let Some(uri) = &config.graph.uri {
                    adapter
                        .connect(&GraphCredentials {
                            uri: uri.clone(),
                            username: config.graph.username.clone().unwrap_or_default(),
                            password: config.graph.password.clone().unwrap_or_default(),
                        })
                        .await?;
                }
                Some(GraphSync::new(adapter))
            }
        };

        let tenant_id = config.tenant_id();
        let revision = RevisionEngine::new(config.belief_revision.clone());
        let observers = ObserverHub::new(observer);
        let orchestrator = Arc::new(MemoryOrchestrator::new(
            data.clone(),
            completer,
            embedder.clone(),
            graph.clone(),
            revision,
            config.fact_extraction.clone(),
            config.failure_policy,
            config.retry.clone(),
            observers,
        ));
        let stream = StreamOrchestrator::new(orchestrator.clone(), config.streaming.clone());
        let recall = RecallPlanner::new(data.clone(), embedder, graph.clone());
        let cascade = CascadeCoordinator::new(data.clone(), graph);

        Ok(Self {
            tenant_id,
            data,
            orchestrator,
            stream,
            recall,
            cascade,
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn memory(&self) -> MemoryApi<'_> {
        MemoryApi { engine: self }
    }

    pub fn facts(&self) -> FactsApi<'_> {
        FactsApi { engine: self }
    }

    pub fn conversations(&self) -> ConversationsApi<'_> {
        ConversationsApi { engine: self }
    }

    pub fn users(&self) -> UsersApi<'_> {
        UsersApi { engine: self }
    }

    pub fn memory_spaces(&self) -> SpacesApi<'_> {
        SpacesApi { engine: self }
    }

    pub fn contexts(&self) -> ContextsApi<'_> {
        ContextsApi { engine: self }
    }

    pub fn immutable(&self) -> ImmutableApi<'_> {
        ImmutableApi { engine: self }
    }

    pub fn mutable(&self) -> MutableApi<'_> {
        MutableApi { engine: self }
    }
}

// ── memory.* ────────────────────────────────────────────────────

pub struct MemoryApi<'a> {
    engine: &'a CortexEngine,
}

impl MemoryApi<'_> {
    pub async fn remember(&self, input: RememberInput) -> Result<RememberResult> {
        self.engine
            .orchestrator
            .remember(&self.engine.tenant_id, input)
            .await
    }

    pub async fn recall(&self, request: RecallRequest) -> Result<RecallResult> {
        self.engine
            .recall
            .recall(&self.engine.tenant_id, request)
            .await
    }

    pub fn remember_stream(
        &self,
        input: StreamInput,
        hooks: Option<Arc<dyn StreamHooks>>,
    ) -> Result<StreamSession> {
        self.engine
            .stream
            .remember_stream(&self.engine.tenant_id, input, hooks)
    }

    pub async fn resume_stream(
        &self,
        token: &ResumeToken,
        continuation: ChunkStream,
    ) -> Result<String> {
        self.engine
            .stream
            .resume(&self.engine.tenant_id, token, continuation)
            .await
    }

    /// Direct vector-memory writes for non-conversation sources (system
    /// notes, tool output, agent-to-agent traffic).
    pub async fn store(&self, mut memory: VectorMemory) -> Result<VectorMemory> {
        memory.tenant_id = self.engine.tenant_id.clone();
        self.engine
            .data
            .spaces
            .ensure_writable(&self.engine.tenant_id, &memory.memory_space_id)?;
        self.engine.data.memories.store(&memory).await?;
        Ok(memory)
    }

    pub fn get(&self, id: &str) -> Result<Option<VectorMemory>> {
        self.engine.data.memories.get(&self.engine.tenant_id, id)
    }

    pub fn list(
        &self,
        memory_space_id: &str,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<VectorMemory>> {
        self.engine
            .data
            .memories
            .list(&self.engine.tenant_id, memory_space_id, user_id, limit)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.engine.data.memories.delete(&self.engine.tenant_id, id).await
    }

    pub async fn delete_many(&self, ids: &[String]) -> Result<usize> {
        self.engine
            .data
            .memories
            .delete_many(&self.engine.tenant_id, ids)
            .await
    }

    pub async fn purge_all(&self, memory_space_id: &str) -> Result<usize> {
        self.engine
            .data
            .memories
            .purge_all(&self.engine.tenant_id, memory_space_id)
            .await
    }
}

// ── facts.* ─────────────────────────────────────────────────────

pub struct FactsApi<'a> {
    engine: &'a CortexEngine,
}

impl FactsApi<'_> {
    pub async fn store(&self, mut fact: Fact) -> Result<Fact> {
        fact.tenant_id = self.engine.tenant_id.clone();
        self.engine
            .data
            .spaces
            .ensure_writable(&self.engine.tenant_id, &fact.memory_space_id)?;
        self.engine.data.facts.store(&fact).await?;
        Ok(fact)
    }

    pub fn get(&self, id: &str) -> Result<Fact> {
        self.engine
            .data
            .facts
            .get(&self.engine.tenant_id, id)?
            .ok_or_else(|| CortexError::not_found(format!("fact {id}")))
    }

    pub fn list(&self, memory_space_id: &str, active_only: bool, limit: usize) -> Result<Vec<Fact>> {
        self.engine
            .data
            .facts
            .list(&self.engine.tenant_id, memory_space_id, active_only, limit)
    }

    pub async fn search(&self, memory_space_id: &str, query: &str, limit: usize) -> Result<Vec<FactHit>> {
        self.engine
            .data
            .facts
            .search(&self.engine.tenant_id, memory_space_id, query, limit)
            .await
    }

    pub async fn update(&self, fact: &Fact, expected_updated_at: i64) -> Result<Fact> {
        self.engine.data.facts.update(fact, expected_updated_at).await
    }

    pub async fn supersede(&self, old_id: &str, mut replacement: Fact) -> Result<Fact> {
        replacement.tenant_id = self.engine.tenant_id.clone();
        let (_, stored) = self.engine.data.facts.supersede(old_id, &replacement).await?;
        Ok(stored)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.engine.data.facts.delete(&self.engine.tenant_id, id).await
    }

    pub fn history(
        &self,
        memory_space_id: &str,
        subject: &str,
        predicate: Option<&str>,
    ) -> Result<Vec<Fact>> {
        self.engine
            .data
            .facts
            .history(&self.engine.tenant_id, memory_space_id, subject, predicate)
    }

    pub fn supersession_chain(&self, id: &str) -> Result<Vec<Fact>> {
        self.engine
            .data
            .facts
            .supersession_chain(&self.engine.tenant_id, id)
    }

    pub async fn purge_all(&self, memory_space_id: &str) -> Result<usize> {
        self.engine
            .data
            .facts
            .purge_all(&self.engine.tenant_id, memory_space_id)
            .await
    }
}

// ── conversations.* ─────────────────────────────────────────────

pub struct ConversationsApi<'a> {
    engine: &'a CortexEngine,
}

impl ConversationsApi<'_> {
    pub fn create(
        &self,
        id: &str,
        memory_space_id: &str,
        conversation_type: ConversationType,
        participants: Participants,
    ) -> Result<Conversation> {
        self.engine
            .data
            .spaces
            .ensure_writable(&self.engine.tenant_id, memory_space_id)?;
        self.engine.data.conversations.create(
            &self.engine.tenant_id,
            id,
            memory_space_id,
            conversation_type,
            participants,
        )
    }

    pub fn get(&self, id: &str) -> Result<Option<Conversation>> {
        self.engine.data.conversations.get(&self.engine.tenant_id, id)
    }

    pub async fn add_messages(&self, id: &str, messages: Vec<Message>) -> Result<Vec<String>> {
        self.engine
            .data
            .conversations
            .add_messages(&self.engine.tenant_id, id, messages)
            .await
    }

    pub fn list(
        &self,
        memory_space_id: Option<&str>,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Conversation>> {
        self.engine
            .data
            .conversations
            .list(&self.engine.tenant_id, memory_space_id, user_id, limit)
    }

    pub fn count(&self, memory_space_id: Option<&str>) -> Result<usize> {
        self.engine
            .data
            .conversations
            .count(&self.engine.tenant_id, memory_space_id)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.engine.data.conversations.delete(&self.engine.tenant_id, id)
    }
}

// ── users.* ─────────────────────────────────────────────────────

pub struct UsersApi<'a> {
    engine: &'a CortexEngine,
}

impl UsersApi<'_> {
    pub fn create(&self, user_id: &str, data: Value) -> Result<ImmutableRecord> {
        self.engine.data.records.immutable_store(
            &self.engine.tenant_id,
            USER_RECORD_TYPE,
            user_id,
            data,
            Some(user_id),
        )
    }

    /// Appends version N+1; the prior payload joins `previous_versions`.
    pub fn update(&self, user_id: &str, data: Value) -> Result<ImmutableRecord> {
        self.create(user_id, data)
    }

    pub fn get(&self, user_id: &str) -> Result<Option<ImmutableRecord>> {
        self.engine
            .data
            .records
            .immutable_get(&self.engine.tenant_id, USER_RECORD_TYPE, user_id)
    }

    pub fn get_version(&self, user_id: &str, version: u32) -> Result<Value> {
        self.engine.data.records.immutable_get_version(
            &self.engine.tenant_id,
            USER_RECORD_TYPE,
            user_id,
            version,
        )
    }

    /// GDPR sweep across every layer. `cascade == false` removes only the
    /// profile row.
    pub async fn delete(&self, user_id: &str, cascade: bool, dry_run: bool) -> Result<UserCascadeSummary> {
        if cascade {
            return self
                .engine
                .cascade
                .delete_user(&self.engine.tenant_id, user_id, dry_run)
                .await;
        }
        let existed = self.get(user_id)?.is_some();
        if !dry_run && existed {
            self.engine.data.records.immutable_purge(
                &self.engine.tenant_id,
                USER_RECORD_TYPE,
                user_id,
            )?;
        }
        Ok(UserCascadeSummary {
            user_id: user_id.to_string(),
            dry_run,
            user_profile_deleted: existed,
            total_deleted: usize::from(existed),
            verification: crate::cascade::CascadeVerification {
                complete: true,
                issues: Vec::new(),
            },
            ..UserCascadeSummary::default()
        })
    }
}

// ── memorySpaces.* ──────────────────────────────────────────────

pub struct SpacesApi<'a> {
    engine: &'a CortexEngine,
}

impl SpacesApi<'_> {
    pub fn register(&self, id: &str, space_type: SpaceType) -> Result<MemorySpace> {
        self.engine
            .data
            .spaces
            .register(&self.engine.tenant_id, id, space_type)
    }

    pub fn get(&self, id: &str) -> Result<Option<MemorySpace>> {
        self.engine.data.spaces.get(&self.engine.tenant_id, id)
    }

    pub fn list(&self) -> Result<Vec<MemorySpace>> {
        self.engine.data.spaces.list(&self.engine.tenant_id)
    }

    pub fn archive(&self, id: &str) -> Result<MemorySpace> {
        self.engine.data.spaces.archive(&self.engine.tenant_id, id)
    }

    pub fn reactivate(&self, id: &str) -> Result<MemorySpace> {
        self.engine.data.spaces.reactivate(&self.engine.tenant_id, id)
    }

    pub async fn delete(&self, id: &str, dry_run: bool) -> Result<SpaceCascadeSummary> {
        self.engine
            .cascade
            .delete_space(&self.engine.tenant_id, id, dry_run)
            .await
    }
}

// ── contexts.* ──────────────────────────────────────────────────

pub struct ContextsApi<'a> {
    engine: &'a CortexEngine,
}

impl ContextsApi<'_> {
    pub fn create(
        &self,
        memory_space_id: &str,
        parent_id: Option<&str>,
        payload: Value,
    ) -> Result<ContextNode> {
        self.engine
            .data
            .spaces
            .ensure_writable(&self.engine.tenant_id, memory_space_id)?;
        self.engine
            .data
            .contexts
            .create(&self.engine.tenant_id, memory_space_id, parent_id, payload)
    }

    pub fn get(&self, id: &str, include_chain: bool) -> Result<Vec<ContextNode>> {
        if include_chain {
            self.engine.data.contexts.get_with_chain(&self.engine.tenant_id, id)
        } else {
            Ok(self
                .engine
                .data
                .contexts
                .get(&self.engine.tenant_id, id)?
                .into_iter()
                .collect())
        }
    }

    pub fn update(&self, id: &str, payload: Value) -> Result<ContextNode> {
        self.engine
            .data
            .contexts
            .update_payload(&self.engine.tenant_id, id, payload)
    }

    pub fn children(&self, id: &str) -> Result<Vec<ContextNode>> {
        self.engine.data.contexts.children(&self.engine.tenant_id, id)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.engine.data.contexts.delete(&self.engine.tenant_id, id)
    }
}

// ── immutable.* / mutable.* ─────────────────────────────────────

pub struct ImmutableApi<'a> {
    engine: &'a CortexEngine,
}

impl ImmutableApi<'_> {
    pub fn store(
        &self,
        record_type: &str,
        id: &str,
        data: Value,
        user_id: Option<&str>,
    ) -> Result<ImmutableRecord> {
        self.engine
            .data
            .records
            .immutable_store(&self.engine.tenant_id, record_type, id, data, user_id)
    }

    pub fn get(&self, record_type: &str, id: &str) -> Result<Option<ImmutableRecord>> {
        self.engine
            .data
            .records
            .immutable_get(&self.engine.tenant_id, record_type, id)
    }

    pub fn list(&self, record_type: &str) -> Result<Vec<ImmutableRecord>> {
        self.engine
            .data
            .records
            .immutable_list(&self.engine.tenant_id, record_type)
    }

    pub fn purge(&self, record_type: &str, id: &str) -> Result<()> {
        self.engine
            .data
            .records
            .immutable_purge(&self.engine.tenant_id, record_type, id)
    }
}

pub struct MutableApi<'a> {
    engine: &'a CortexEngine,
}

impl MutableApi<'_> {
    pub fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        user_id: Option<&str>,
    ) -> Result<MutableRecord> {
        self.engine
            .data
            .records
            .mutable_set(&self.engine.tenant_id, namespace, key, value, user_id)
    }

    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<MutableRecord>> {
        self.engine
            .data
            .records
            .mutable_get(&self.engine.tenant_id, namespace, key)
    }

    pub fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        self.engine
            .data
            .records
            .mutable_delete(&self.engine.tenant_id, namespace, key)
    }

    pub fn purge_namespace(&self, namespace: &str) -> Result<usize> {
        self.engine
            .data
            .records
            .mutable_purge_namespace(&self.engine.tenant_id, namespace)
    }
}
