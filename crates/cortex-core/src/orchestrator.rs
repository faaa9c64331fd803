use crate::data::DataAccess;
use crate::extraction::{FactCandidate, FactExtractor};
use crate::graph::GraphSync;
use crate::llm::{Completer, Embedder};
use crate::observer::{Layer, LayerEvent, LayerStatus, ObserverHub, OrchestrationSummary};
use crate::retry::with_backoff;
use crate::revision::{RevisionDecision, RevisionEngine};
use cortex_common::config::{FactExtractionConfig, FailurePolicy, RetryConfig};
use cortex_common::error::require_id;
use cortex_common::{
    new_id, now_ms, ConversationType, CortexError, Fact, FactKind, Message, MemorySource,
    Participants, Result, VectorMemory,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct RememberInput {
    pub memory_space_id: String,
    pub conversation_id: String,
    pub user_message: String,
    pub agent_response: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub agent_id: String,
    pub participant_id: Option<String>,
    pub generate_embedding: bool,
    pub extract_facts: bool,
    pub importance: u8,
    pub tags: Vec<String>,
}

impl RememberInput {
    pub fn new(
        memory_space_id: impl Into<String>,
        conversation_id: impl Into<String>,
        user_message: impl Into<String>,
        agent_response: impl Into<String>,
        user_id: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            memory_space_id: memory_space_id.into(),
            conversation_id: conversation_id.into(),
            user_message: user_message.into(),
            agent_response: agent_response.into(),
            user_id: user_id.into(),
            user_name: None,
            agent_id: agent_id.into(),
            participant_id: None,
            generate_embedding: true,
            extract_facts: true,
            importance: 50,
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FactRevisionRecord {
    pub decision: String,
    pub fact_id: String,
    pub previous_fact_id: Option<String>,
}

/// What one extraction pass produced. `restorable` holds the pre-write state
/// of facts the pass touched, for the rollback policy.
#[derive(Debug, Clone, Default)]
pub struct ExtractionOutcome {
    pub facts: Vec<Fact>,
    pub revisions: Vec<FactRevisionRecord>,
    pub supersessions: Vec<(String, String)>,
    pub restorable: Vec<Fact>,
}

#[derive(Debug, Clone)]
pub struct RememberResult {
    pub conversation_id: String,
    pub message_ids: Vec<String>,
    pub memories: Vec<VectorMemory>,
    pub facts: Vec<Fact>,
    pub fact_revisions: Vec<FactRevisionRecord>,
}

/// Per-turn write path: conversation append, vector store, fact extraction
/// with belief revision, then graph sync. Layers after the conversation
/// append are attempted independently under the best-effort policy; the
/// rollback policy deletes this orchestration's writes when a layer fails.
#[derive(Clone)]
pub struct MemoryOrchestrator {
    data: DataAccess,
    completer: Option<Arc<dyn Completer>>,
    embedder: Option<Arc<dyn Embedder>>,
    graph: Option<GraphSync>,
    revision: RevisionEngine,
    extraction: FactExtractionConfig,
    failure_policy: FailurePolicy,
    retry: RetryConfig,
    observers: ObserverHub,
}

impl MemoryOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data: DataAccess,
        completer: Option<Arc<dyn Completer>>,
        embedder: Option<Arc<dyn Embedder>>,
        graph: Option<GraphSync>,
        revision: RevisionEngine,
        extraction: FactExtractionConfig,
        failure_policy: FailurePolicy,
        retry: RetryConfig,
        observers: ObserverHub,
    ) -> Self {
        Self {
            data,
            completer,
            embedder,
            graph,
            revision,
            extraction,
            failure_policy,
            retry,
            observers,
        }
    }

    pub fn data(&self) -> &DataAccess {
        &self.data
    }

    pub fn graph(&self) -> Option<&GraphSync> {
        self.graph.as_ref()
    }

    pub fn completer(&self) -> Option<&Arc<dyn Completer>> {
        self.completer.as_ref()
    }

    fn validate(input: &RememberInput) -> Result<()> {
        require_id(&input.memory_space_id, "memorySpaceId")?;
        require_id(&input.conversation_id, "conversationId")?;
        require_id(&input.user_id, "userId")?;
        require_id(&input.agent_id, "agentId")?;
        if input.importance > 100 {
            return Err(CortexError::validation(format!(
                "importance must be within [0, 100], got {}",
                input.importance
            )));
        }
        Ok(())
    }

    pub async fn remember(&self, tenant_id: &str, input: RememberInput) -> Result<RememberResult> {
        Self::validate(&input)?;
        let orchestration_id = new_id();
        let started = Instant::now();
        self.observers.orchestration_start(&orchestration_id).await;

        let mut created_ids: BTreeMap<String, Vec<String>> = BTreeMap::new();

        // Space gate first; an archived space rejects the whole turn.
        self.emit(&orchestration_id, Layer::MemorySpace, LayerStatus::Pending, None, vec![])
            .await;
        if let Err(e) = self.data.spaces.ensure_writable(tenant_id, &input.memory_space_id) {
            self.emit(
                &orchestration_id,
                Layer::MemorySpace,
                LayerStatus::Error,
                Some(e.to_string()),
                vec![],
            )
            .await;
            return Err(e);
        }
        self.emit(&orchestration_id, Layer::MemorySpace, LayerStatus::Complete, None, vec![])
            .await;

        // Conversation append is fatal: later layers reference the messages.
        self.emit(&orchestration_id, Layer::Conversation, LayerStatus::Pending, None, vec![])
            .await;
        let message_ids = match self.append_turn(tenant_id, &input).await {
            Ok(ids) => ids,
            Err(e) => {
                self.emit(
                    &orchestration_id,
                    Layer::Conversation,
                    LayerStatus::Error,
                    Some(e.to_string()),
                    vec![],
                )
                .await;
                return Err(e);
            }
        };
        self.emit(
            &orchestration_id,
            Layer::Conversation,
            LayerStatus::Complete,
            None,
            message_ids.clone(),
        )
        .await;
        created_ids.insert("messages".into(), message_ids.clone());

        // Vector layer.
        self.emit(&orchestration_id, Layer::Vector, LayerStatus::Pending, None, vec![])
            .await;
        let memories = match self.store_vector_memories(tenant_id, &input).await {
            Ok(memories) => {
                self.emit(
                    &orchestration_id,
                    Layer::Vector,
                    LayerStatus::Complete,
                    None,
                    memories.iter().map(|m| m.id.clone()).collect(),
                )
                .await;
                memories
            }
            Err(e) => {
                self.emit(
                    &orchestration_id,
                    Layer::Vector,
                    LayerStatus::Error,
                    Some(e.to_string()),
                    vec![],
                )
                .await;
                if self.failure_policy == FailurePolicy::Rollback {
                    self.rollback(tenant_id, &input, &message_ids, &[], &[], &[]).await;
                    return Err(e);
                }
                Vec::new()
            }
        };
        created_ids.insert("memories".into(), memories.iter().map(|m| m.id.clone()).collect());

        // Fact extraction + belief revision.
        let mut facts: Vec<Fact> = Vec::new();
        let mut revisions: Vec<FactRevisionRecord> = Vec::new();
        let mut supersessions: Vec<(String, String)> = Vec::new();
        let mut restorable: Vec<Fact> = Vec::new();
        let run_extraction =
            input.extract_facts && self.extraction.enabled && self.completer.is_some();
        if run_extraction {
            self.emit(&orchestration_id, Layer::Facts, LayerStatus::Pending, None, vec![])
                .await;
            match self
                .extract_and_revise(tenant_id, &input, &mut facts, &mut revisions, &mut supersessions, &mut restorable)
                .await
            {
                Ok(()) => {
                    self.emit(
                        &orchestration_id,
                        Layer::Facts,
                        LayerStatus::Complete,
                        None,
                        facts.iter().map(|f| f.id.clone()).collect(),
                    )
                    .await;
                }
                Err(e) => {
                    self.emit(
                        &orchestration_id,
                        Layer::Facts,
                        LayerStatus::Error,
                        Some(e.to_string()),
                        vec![],
                    )
                    .await;
                    if self.failure_policy == FailurePolicy::Rollback {
                        self.rollback(tenant_id, &input, &message_ids, &memories, &facts, &restorable)
                            .await;
                        return Err(e);
                    }
                    facts.clear();
                    revisions.clear();
                    supersessions.clear();
                }
            }
        } else {
            self.emit(&orchestration_id, Layer::Facts, LayerStatus::Skipped, None, vec![])
                .await;
        }
        created_ids.insert("facts".into(), facts.iter().map(|f| f.id.clone()).collect());

        // Graph sync; absence of an adapter is a first-class skipped state.
        match &self.graph {
            None => {
                self.emit(&orchestration_id, Layer::Graph, LayerStatus::Skipped, None, vec![])
                    .await;
            }
            Some(graph) => {
                self.emit(&orchestration_id, Layer::Graph, LayerStatus::Pending, None, vec![])
                    .await;
                let result = graph
                    .sync_turn(
                        &input.memory_space_id,
                        &input.user_id,
                        &input.agent_id,
                        &memories,
                        &facts,
                        &supersessions,
                    )
                    .await;
                match result {
                    Ok(()) => {
                        self.emit(&orchestration_id, Layer::Graph, LayerStatus::Complete, None, vec![])
                            .await;
                    }
                    Err(e) => {
                        self.emit(
                            &orchestration_id,
                            Layer::Graph,
                            LayerStatus::Error,
                            Some(e.to_string()),
                            vec![],
                        )
                        .await;
                        if self.failure_policy == FailurePolicy::Rollback {
                            self.rollback(tenant_id, &input, &message_ids, &memories, &facts, &restorable)
                                .await;
                            return Err(e);
                        }
                    }
                }
            }
        }

        self.observers
            .orchestration_complete(OrchestrationSummary {
                orchestration_id,
                total_latency_ms: started.elapsed().as_millis() as u64,
                created_ids,
            })
            .await;

        Ok(RememberResult {
            conversation_id: input.conversation_id,
            message_ids,
            memories,
            facts,
            fact_revisions: revisions,
        })
    }

    async fn append_turn(&self, tenant_id: &str, input: &RememberInput) -> Result<Vec<String>> {
        self.data
            .agents
            .register(tenant_id, &input.agent_id, None)?;
        // First turn on a fresh conversation id creates the log.
        if self.data.conversations.get(tenant_id, &input.conversation_id)?.is_none() {
            self.data.conversations.create(
                tenant_id,
                &input.conversation_id,
                &input.memory_space_id,
                ConversationType::UserAgent,
                Participants {
                    user_id: Some(input.user_id.clone()),
                    agent_id: Some(input.agent_id.clone()),
                    participant_ids: input.participant_id.iter().cloned().collect(),
                },
            )?;
        }

        let mut user_message = Message::user(input.user_message.clone());
        user_message.participant_id = input.participant_id.clone();
        let agent_message = Message::agent(input.agent_response.clone(), input.agent_id.clone());
        self.data
            .conversations
            .add_messages(tenant_id, &input.conversation_id, vec![user_message, agent_message])
            .await
    }

    async fn store_vector_memories(
        &self,
        tenant_id: &str,
        input: &RememberInput,
    ) -> Result<Vec<VectorMemory>> {
        let mut memories = Vec::new();
        for (content, role) in [
            (&input.user_message, "user"),
            (&input.agent_response, "agent"),
        ] {
            if content.trim().is_empty() {
                continue;
            }
            let mut memory = VectorMemory::new(
                input.memory_space_id.clone(),
                content.clone(),
                MemorySource::Conversation,
            );
            memory.tenant_id = tenant_id.to_string();
            memory.user_id = Some(input.user_id.clone());
            memory.importance = input.importance;
            memory.tags = input.tags.clone();
            memory.tags.push(format!("role:{role}"));

            if input.generate_embedding {
                if let Some(embedder) = &self.embedder {
                    let text = content.clone();
                    let embedder = embedder.clone();
                    match with_backoff(&self.retry, "embed", || {
                        let embedder = embedder.clone();
                        let text = text.clone();
                        async move { embedder.embed(&text).await }
                    })
                    .await
                    {
                        Ok(vector) => memory.embedding = Some(vector),
                        Err(e) => {
                            // Keyword search still works without the vector.
                            tracing::warn!("embedding failed, storing without vector: {e}");
                        }
                    }
                }
            }
            self.data.memories.store(&memory).await?;
            memories.push(memory);
        }
        Ok(memories)
    }

    fn candidate_to_fact(
        &self,
        tenant_id: &str,
        memory_space_id: &str,
        user_id: &str,
        candidate: &FactCandidate,
    ) -> Fact {
        let now = now_ms();
        Fact {
            id: new_id(),
            memory_space_id: memory_space_id.to_string(),
            user_id: Some(user_id.to_string()),
            statement: candidate.fact.clone(),
            kind: FactKind::from_parts(
                &candidate.fact_type,
                candidate.resolved_predicate(),
                candidate.resolved_object(),
            ),
            subject: candidate.resolved_subject(),
            confidence: candidate.confidence.min(100),
            valid_from: now,
            valid_until: None,
            superseded_by: None,
            category: candidate.category.clone(),
            search_aliases: candidate.search_aliases.clone(),
            semantic_context: candidate.semantic_context.clone(),
            entities: candidate.entities.clone(),
            relations: candidate.relations.clone(),
            extensions: Default::default(),
            tenant_id: tenant_id.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn extract_and_revise(
        &self,
        tenant_id: &str,
        input: &RememberInput,
        facts: &mut Vec<Fact>,
        revisions: &mut Vec<FactRevisionRecord>,
        supersessions: &mut Vec<(String, String)>,
        restorable: &mut Vec<Fact>,
    ) -> Result<()> {
        let user_name = input.user_name.as_deref().unwrap_or(&input.user_id);
        let turn = format!(
            "{user_name}: {}\nassistant: {}",
            input.user_message, input.agent_response
        );
        let outcome = self
            .extract_from_text(tenant_id, &input.memory_space_id, &input.user_id, &turn)
            .await?;
        facts.extend(outcome.facts);
        revisions.extend(outcome.revisions);
        supersessions.extend(outcome.supersessions);
        restorable.extend(outcome.restorable);
        Ok(())
    }

    /// Extraction plus belief revision over one chunk of text; shared by the
    /// per-turn and streaming write paths.
    pub(crate) async fn extract_from_text(
        &self,
        tenant_id: &str,
        memory_space_id: &str,
        user_id: &str,
        text: &str,
    ) -> Result<ExtractionOutcome> {
        let Some(completer) = self.completer.as_ref() else {
            return Ok(ExtractionOutcome::default());
        };
        let model = (!self.extraction.model.is_empty()).then(|| self.extraction.model.clone());
        let extractor = FactExtractor::new(completer.clone(), model);

        let candidates = with_backoff(&self.retry, "fact extraction", || {
            let extractor = extractor.clone();
            let text = text.to_string();
            async move { extractor.extract(&text).await }
        })
        .await?;

        let mut outcome = ExtractionOutcome::default();
        let facts = &mut outcome.facts;
        let revisions = &mut outcome.revisions;
        let supersessions = &mut outcome.supersessions;
        let restorable = &mut outcome.restorable;
        for candidate in candidates {
            let fact = self.candidate_to_fact(tenant_id, memory_space_id, user_id, &candidate);
            let existing =
                self.data
                    .facts
                    .active_for_subject(tenant_id, memory_space_id, &fact.subject)?;
            let decision = self
                .revision
                .decide(&fact, &existing, self.completer.as_ref())
                .await;

            let record = match decision {
                RevisionDecision::Create => {
                    self.data.facts.store(&fact).await?;
                    let record = FactRevisionRecord {
                        decision: "create".into(),
                        fact_id: fact.id.clone(),
                        previous_fact_id: None,
                    };
                    facts.push(fact);
                    record
                }
                RevisionDecision::Update { target_id } => {
                    let target = self.data.facts.require(tenant_id, &target_id)?;
                    restorable.push(target.clone());
                    let mut merged = target.clone();
                    for alias in &fact.search_aliases {
                        if !merged.search_aliases.contains(alias) {
                            merged.search_aliases.push(alias.clone());
                        }
                    }
                    if merged.semantic_context.is_none() {
                        merged.semantic_context = fact.semantic_context.clone();
                    }
                    merged.confidence = merged.confidence.max(fact.confidence);
                    let updated = self.data.facts.update(&merged, target.updated_at).await?;
                    let record = FactRevisionRecord {
                        decision: "update".into(),
                        fact_id: updated.id.clone(),
                        previous_fact_id: Some(target_id),
                    };
                    facts.push(updated);
                    record
                }
                RevisionDecision::Supersede { target_id } => {
                    let (old, stored) = self.data.facts.supersede(&target_id, &fact).await?;
                    restorable.push({
                        let mut pre = old;
                        pre.valid_until = None;
                        pre.superseded_by = None;
                        pre
                    });
                    supersessions.push((stored.id.clone(), target_id.clone()));
                    let record = FactRevisionRecord {
                        decision: "supersede".into(),
                        fact_id: stored.id.clone(),
                        previous_fact_id: Some(target_id),
                    };
                    facts.push(stored);
                    record
                }
                RevisionDecision::SkipDuplicate { target_id } => {
                    let bumped = self.data.facts.bump_confidence(tenant_id, &target_id).await?;
                    FactRevisionRecord {
                        decision: "skip-duplicate".into(),
                        fact_id: bumped.id,
                        previous_fact_id: None,
                    }
                }
            };
            revisions.push(record);
        }
        Ok(outcome)
    }

    /// Undo this orchestration's writes after a layer failure under the
    /// rollback policy. Failures here only log; the original error wins.
    async fn rollback(
        &self,
        tenant_id: &str,
        input: &RememberInput,
        message_ids: &[String],
        memories: &[VectorMemory],
        facts: &[Fact],
        restorable: &[Fact],
    ) {
        for message_id in message_ids {
            if let Err(e) = self
                .data
                .conversations
                .remove_message(tenant_id, &input.conversation_id, message_id)
                .await
            {
                tracing::error!("rollback: failed to remove message {message_id}: {e}");
            }
        }
        for memory in memories {
            if let Err(e) = self.data.memories.delete(tenant_id, &memory.id).await {
                tracing::error!("rollback: failed to delete memory {}: {e}", memory.id);
            }
        }
        for fact in facts {
            if let Err(e) = self.data.facts.delete(tenant_id, &fact.id).await {
                tracing::error!("rollback: failed to delete fact {}: {e}", fact.id);
            }
        }
        // Superseded and updated facts get their pre-turn rows back.
        for fact in restorable {
            if let Err(e) = self.data.facts.store(fact).await {
                tracing::error!("rollback: failed to restore fact {}: {e}", fact.id);
            }
        }
    }

    async fn emit(
        &self,
        orchestration_id: &str,
        layer: Layer,
        status: LayerStatus,
        detail: Option<String>,
        created_ids: Vec<String>,
    ) {
        self.observers
            .layer(LayerEvent {
                orchestration_id: orchestration_id.to_string(),
                layer,
                status,
                detail,
                created_ids,
            })
            .await;
    }
}
