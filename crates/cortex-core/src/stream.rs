use crate::orchestrator::MemoryOrchestrator;
use cortex_common::config::{PartialFailureHandling, StreamingConfig};
use cortex_common::error::require_id;
use cortex_common::{CortexError, Fact, MemorySource, Message, Result, VectorMemory};
use futures::Stream;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Factory for re-invoking the upstream under the `retry` failure handling.
/// Without one, retry degrades to storing the partial.
pub type StreamRestart = Box<dyn Fn() -> ChunkStream + Send + Sync>;

pub struct StreamInput {
    pub memory_space_id: String,
    pub conversation_id: String,
    pub user_message: String,
    pub user_id: String,
    pub agent_id: String,
    pub response_stream: ChunkStream,
    pub restart: Option<StreamRestart>,
    pub importance: u8,
    pub tags: Vec<String>,
}

impl StreamInput {
    pub fn new(
        memory_space_id: impl Into<String>,
        conversation_id: impl Into<String>,
        user_message: impl Into<String>,
        user_id: impl Into<String>,
        agent_id: impl Into<String>,
        response_stream: ChunkStream,
    ) -> Self {
        Self {
            memory_space_id: memory_space_id.into(),
            conversation_id: conversation_id.into(),
            user_message: user_message.into(),
            user_id: user_id.into(),
            agent_id: agent_id.into(),
            response_stream,
            restart: None,
            importance: 50,
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StreamMetrics {
    pub first_chunk_ms: Option<u64>,
    pub total_ms: u64,
    pub chunks: u64,
    pub bytes: u64,
    pub estimated_tokens: u64,
    pub throughput_bytes_per_sec: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PerformanceBreakdown {
    pub streaming_ms: u64,
    pub fact_extraction_ms: u64,
    pub storage_ms: u64,
    pub finalization_ms: u64,
}

/// Continuation handle for an interrupted stream: the partial agent message
/// plus the byte offset the next segment should resume from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeToken {
    pub conversation_id: String,
    pub message_id: String,
    pub byte_offset: u64,
}

#[derive(Debug, Clone)]
pub struct StreamCompletion {
    pub full_response: Option<String>,
    pub total_chunks: u64,
    pub duration_ms: u64,
    pub facts_extracted: usize,
}

#[derive(Debug, Clone)]
pub struct StreamOutcome {
    /// The concatenation of all forwarded chunks, unless the rolling window
    /// overflowed and the transform fell back to hashing.
    pub full_response: Option<String>,
    /// SHA-256 of the full response when the text buffer was dropped.
    pub response_hash: Option<String>,
    pub total_chunks: u64,
    pub completed: bool,
    pub message_id: Option<String>,
    pub facts: Vec<Fact>,
    pub resume_token: Option<ResumeToken>,
    pub metrics: StreamMetrics,
    pub performance: PerformanceBreakdown,
}

/// Streaming-time hooks. Synchronous by design: they run inline in the
/// forward path, so implementations should be quick.
pub trait StreamHooks: Send + Sync {
    fn on_chunk(&self, _chunk: &str) {}
    fn on_progress(&self, _bytes: u64, _chunks: u64) {}
    fn on_complete(&self, _completion: &StreamCompletion) {}
    fn on_error(&self, _error: &CortexError, _recoverable: bool, _resume_token: Option<&ResumeToken>) {
    }
}

struct NoHooks;
impl StreamHooks for NoHooks {}

/// Handle returned by `remember_stream`. The forward stream yields chunks in
/// source order; the outcome resolves after finalization. Dropping the
/// forward stream early cancels the background work.
pub struct StreamSession {
    pub stream: ReceiverStream<String>,
    outcome: tokio::task::JoinHandle<Result<StreamOutcome>>,
}

impl StreamSession {
    pub fn into_parts(
        self,
    ) -> (
        ReceiverStream<String>,
        tokio::task::JoinHandle<Result<StreamOutcome>>,
    ) {
        (self.stream, self.outcome)
    }

    /// Drain the forward stream and wait for the outcome.
    pub async fn drain(self) -> Result<StreamOutcome> {
        let (mut stream, outcome) = self.into_parts();
        while stream.next().await.is_some() {}
        outcome.await.map_err(CortexError::transport)?
    }
}

/// Streaming write path: a passthrough forwarder plus background extraction,
/// storage and graph work, joined before completion.
#[derive(Clone)]
pub struct StreamOrchestrator {
    inner: Arc<MemoryOrchestrator>,
    config: StreamingConfig,
}

struct DriverState {
    accumulated: String,
    hasher: Option<Sha256>,
    chunks: u64,
    bytes: u64,
    first_chunk_at: Option<Instant>,
    message_id: Option<String>,
    last_partial_commit: Instant,
    last_extract_offset: usize,
    last_graph_sync: Instant,
    facts: Vec<Fact>,
    supersessions: Vec<(String, String)>,
    extraction_ms: u64,
    storage_ms: u64,
}

impl StreamOrchestrator {
    pub fn new(inner: Arc<MemoryOrchestrator>, config: StreamingConfig) -> Self {
        Self { inner, config }
    }

    pub fn remember_stream(
        &self,
        tenant_id: &str,
        input: StreamInput,
        hooks: Option<Arc<dyn StreamHooks>>,
    ) -> Result<StreamSession> {
        require_id(&input.memory_space_id, "memorySpaceId")?;
        require_id(&input.conversation_id, "conversationId")?;
        require_id(&input.user_id, "userId")?;
        require_id(&input.agent_id, "agentId")?;

        let (tx, rx) = mpsc::channel::<String>(32);
        let orchestrator = self.clone();
        let tenant = tenant_id.to_string();
        let hooks = hooks.unwrap_or_else(|| Arc::new(NoHooks));
        let outcome = tokio::spawn(async move {
            orchestrator.drive(tenant, input, tx, hooks).await
        });

        Ok(StreamSession {
            stream: ReceiverStream::new(rx),
            outcome,
        })
    }

    async fn drive(
        &self,
        tenant_id: String,
        mut input: StreamInput,
        tx: mpsc::Sender<String>,
        hooks: Arc<dyn StreamHooks>,
    ) -> Result<StreamOutcome> {
        let started = Instant::now();
        let mut state = DriverState {
            accumulated: String::new(),
            hasher: None,
            chunks: 0,
            bytes: 0,
            first_chunk_at: None,
            message_id: None,
            last_partial_commit: started,
            last_extract_offset: 0,
            last_graph_sync: started,
            facts: Vec::new(),
            supersessions: Vec::new(),
            extraction_ms: 0,
            storage_ms: 0,
        };
        let mut retries_left = self.config.max_retries;
        let timeout = Duration::from_millis(self.config.stream_timeout_ms.max(1));

        let placeholder: ChunkStream = Box::pin(futures::stream::empty());
        let mut upstream = std::mem::replace(&mut input.response_stream, placeholder);
        let error = loop {
            let next = tokio::time::timeout(timeout, upstream.next()).await;
            let item = match next {
                Err(_) => Some(Err(CortexError::transport(format!(
                    "no chunk within {}ms",
                    self.config.stream_timeout_ms
                )))),
                Ok(item) => item,
            };
            match item {
                None => break None,
                Some(Err(e)) => {
                    // Retry handling re-invokes the upstream from scratch
                    // when the caller provided a restart factory.
                    let retryable = self.config.partial_failure_handling
                        == PartialFailureHandling::Retry
                        || self.config.partial_failure_handling
                            == PartialFailureHandling::BestEffort;
                    if retryable && retries_left > 0 {
                        if let Some(restart) = &input.restart {
                            retries_left -= 1;
                            tracing::warn!(
                                "stream failed ({e}), re-invoking upstream ({} retries left)",
                                retries_left
                            );
                            upstream = restart();
                            self.reset_for_restart(&tenant_id, &input, &mut state).await;
                            continue;
                        }
                    }
                    break Some(e);
                }
                Some(Ok(chunk)) => {
                    if state.first_chunk_at.is_none() {
                        state.first_chunk_at = Some(Instant::now());
                    }
                    state.chunks += 1;
                    state.bytes += chunk.len() as u64;
                    hooks.on_chunk(&chunk);
                    if state.chunks % 8 == 0 {
                        hooks.on_progress(state.bytes, state.chunks);
                    }

                    // Forward first; the downstream consumer never waits on
                    // side work. A closed receiver means cancellation.
                    if tx.send(chunk.clone()).await.is_err() {
                        tracing::debug!("downstream consumer gone, cancelling stream work");
                        return Ok(self.cancelled_outcome(state, started));
                    }

                    self.absorb_chunk(&tenant_id, &input, &mut state, &chunk).await?;
                }
            }
        };
        drop(tx);

        let streaming_ms = started.elapsed().as_millis() as u64;
        match error {
            None => {
                let outcome = self
                    .finalize(&tenant_id, &mut input, state, started, streaming_ms, &hooks)
                    .await?;
                Ok(outcome)
            }
            Some(e) => {
                self.handle_failure(&tenant_id, &input, state, started, streaming_ms, e, &hooks)
                    .await
            }
        }
    }

    /// Progressive storage, extraction and graph sync for one chunk.
    async fn absorb_chunk(
        &self,
        tenant_id: &str,
        input: &StreamInput,
        state: &mut DriverState,
        chunk: &str,
    ) -> Result<()> {
        match &mut state.hasher {
            Some(hasher) => {
                hasher.update(chunk.as_bytes());
                return Ok(());
            }
            None => {
                state.accumulated.push_str(chunk);
                if state.accumulated.len() > self.config.max_response_length {
                    tracing::warn!(
                        "stream exceeded {} bytes, dropping text buffer for incremental hashing",
                        self.config.max_response_length
                    );
                    let mut hasher = Sha256::new();
                    hasher.update(state.accumulated.as_bytes());
                    state.hasher = Some(hasher);
                    state.accumulated.clear();
                    return Ok(());
                }
            }
        }

        // First chunk opens the transcript: the user message plus a partial
        // agent message that later commits overwrite in place. A stream that
        // emits no chunks leaves the conversation unchanged.
        let storage_started = Instant::now();
        if state.message_id.is_none() {
            self.ensure_conversation(tenant_id, input).await?;
            let user_message = Message::user(input.user_message.clone());
            let agent_message = Message::agent(state.accumulated.clone(), input.agent_id.clone());
            let agent_id = agent_message.id.clone();
            self.inner
                .data()
                .conversations
                .add_messages(
                    tenant_id,
                    &input.conversation_id,
                    vec![user_message, agent_message],
                )
                .await?;
            state.message_id = Some(agent_id);
            state.last_partial_commit = Instant::now();
        } else if state.last_partial_commit.elapsed()
            >= Duration::from_millis(self.config.partial_response_interval_ms)
        {
            if let Some(message_id) = &state.message_id {
                self.inner
                    .data()
                    .conversations
                    .replace_message(
                        tenant_id,
                        &input.conversation_id,
                        message_id,
                        &state.accumulated,
                    )
                    .await?;
            }
            state.last_partial_commit = Instant::now();
        }
        state.storage_ms += storage_started.elapsed().as_millis() as u64;

        // Progressive fact extraction on the accumulated delta.
        if self.inner.completer().is_some()
            && state.accumulated.len() - state.last_extract_offset
                >= self.config.fact_extraction_threshold
        {
            let delta = state.accumulated[state.last_extract_offset..].to_string();
            state.last_extract_offset = state.accumulated.len();
            let extraction_started = Instant::now();
            match self
                .inner
                .extract_from_text(tenant_id, &input.memory_space_id, &input.user_id, &delta)
                .await
            {
                Ok(outcome) => {
                    state.facts.extend(outcome.facts);
                    state.supersessions.extend(outcome.supersessions);
                }
                Err(e) => tracing::warn!("progressive extraction failed: {e}"),
            }
            state.extraction_ms += extraction_started.elapsed().as_millis() as u64;
        }

        // Progressive graph sync, rate limited.
        if let Some(graph) = self.inner.graph() {
            if !state.facts.is_empty()
                && state.last_graph_sync.elapsed()
                    >= Duration::from_millis(self.config.graph_sync_interval_ms)
            {
                state.last_graph_sync = Instant::now();
                if let Err(e) = graph
                    .sync_turn(
                        &input.memory_space_id,
                        &input.user_id,
                        &input.agent_id,
                        &[],
                        &state.facts,
                        &state.supersessions,
                    )
                    .await
                {
                    tracing::warn!("progressive graph sync failed: {e}");
                }
            }
        }
        Ok(())
    }

    async fn ensure_conversation(&self, tenant_id: &str, input: &StreamInput) -> Result<()> {
        self.inner.data().agents.register(tenant_id, &input.agent_id, None)?;
        if self
            .inner
            .data()
            .conversations
            .get(tenant_id, &input.conversation_id)?
            .is_none()
        {
            self.inner.data().conversations.create(
                tenant_id,
                &input.conversation_id,
                &input.memory_space_id,
                cortex_common::ConversationType::UserAgent,
                cortex_common::Participants {
                    user_id: Some(input.user_id.clone()),
                    agent_id: Some(input.agent_id.clone()),
                    participant_ids: Vec::new(),
                },
            )?;
        }
        Ok(())
    }

    async fn reset_for_restart(
        &self,
        tenant_id: &str,
        input: &StreamInput,
        state: &mut DriverState,
    ) {
        if let Some(message_id) = &state.message_id {
            if let Err(e) = self
                .inner
                .data()
                .conversations
                .replace_message(tenant_id, &input.conversation_id, message_id, "")
                .await
            {
                tracing::warn!("failed to clear partial message before restart: {e}");
            }
        }
        state.accumulated.clear();
        state.hasher = None;
        state.last_extract_offset = 0;
    }

    fn metrics(&self, state: &DriverState, started: Instant) -> StreamMetrics {
        let total_ms = started.elapsed().as_millis() as u64;
        StreamMetrics {
            first_chunk_ms: state
                .first_chunk_at
                .map(|t| t.duration_since(started).as_millis() as u64),
            total_ms,
            chunks: state.chunks,
            bytes: state.bytes,
            estimated_tokens: state.bytes / 4,
            throughput_bytes_per_sec: if total_ms == 0 {
                0.0
            } else {
                state.bytes as f64 * 1000.0 / total_ms as f64
            },
        }
    }

    fn cancelled_outcome(&self, state: DriverState, started: Instant) -> StreamOutcome {
        let metrics = self.metrics(&state, started);
        StreamOutcome {
            full_response: state.hasher.is_none().then(|| state.accumulated.clone()),
            response_hash: state.hasher.map(|h| hex(&h.finalize())),
            total_chunks: state.chunks,
            completed: false,
            message_id: state.message_id,
            facts: state.facts,
            resume_token: None,
            metrics,
            performance: PerformanceBreakdown {
                streaming_ms: started.elapsed().as_millis() as u64,
                fact_extraction_ms: state.extraction_ms,
                storage_ms: state.storage_ms,
                finalization_ms: 0,
            },
        }
    }

    async fn finalize(
        &self,
        tenant_id: &str,
        input: &mut StreamInput,
        mut state: DriverState,
        started: Instant,
        streaming_ms: u64,
        hooks: &Arc<dyn StreamHooks>,
    ) -> Result<StreamOutcome> {
        let finalization_started = Instant::now();

        if state.chunks > 0 && state.hasher.is_none() {
            if let Some(message_id) = &state.message_id {
                self.inner
                    .data()
                    .conversations
                    .replace_message(
                        tenant_id,
                        &input.conversation_id,
                        message_id,
                        &state.accumulated,
                    )
                    .await?;
            }

            // Final extraction pass over the tail the progressive passes
            // have not seen yet.
            if self.inner.completer().is_some()
                && state.last_extract_offset < state.accumulated.len()
            {
                let tail = state.accumulated[state.last_extract_offset..].to_string();
                let extraction_started = Instant::now();
                match self
                    .inner
                    .extract_from_text(tenant_id, &input.memory_space_id, &input.user_id, &tail)
                    .await
                {
                    Ok(outcome) => {
                        state.facts.extend(outcome.facts);
                        state.supersessions.extend(outcome.supersessions);
                    }
                    Err(e) => tracing::warn!("final extraction failed: {e}"),
                }
                state.extraction_ms += extraction_started.elapsed().as_millis() as u64;
            }

            // Vector memories for both sides of the turn.
            let storage_started = Instant::now();
            let mut stored_memories: Vec<VectorMemory> = Vec::new();
            for content in [&input.user_message, &state.accumulated] {
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
                if let Err(e) = self.inner.data().memories.store(&memory).await {
                    tracing::warn!("vector store failed during finalization: {e}");
                } else {
                    stored_memories.push(memory);
                }
            }
            state.storage_ms += storage_started.elapsed().as_millis() as u64;

            if let Some(graph) = self.inner.graph() {
                if let Err(e) = graph
                    .sync_turn(
                        &input.memory_space_id,
                        &input.user_id,
                        &input.agent_id,
                        &stored_memories,
                        &state.facts,
                        &state.supersessions,
                    )
                    .await
                {
                    tracing::warn!("graph sync failed during finalization: {e}");
                }
            }
        }

        let metrics = self.metrics(&state, started);
        let completion = StreamCompletion {
            full_response: state.hasher.is_none().then(|| state.accumulated.clone()),
            total_chunks: state.chunks,
            duration_ms: metrics.total_ms,
            facts_extracted: state.facts.len(),
        };
        hooks.on_complete(&completion);

        Ok(StreamOutcome {
            full_response: completion.full_response,
            response_hash: state.hasher.map(|h| hex(&h.finalize())),
            total_chunks: state.chunks,
            completed: true,
            message_id: state.message_id,
            facts: state.facts,
            resume_token: None,
            metrics,
            performance: PerformanceBreakdown {
                streaming_ms,
                fact_extraction_ms: state.extraction_ms,
                storage_ms: state.storage_ms,
                finalization_ms: finalization_started.elapsed().as_millis() as u64,
            },
        })
    }

    async fn handle_failure(
        &self,
        tenant_id: &str,
        input: &StreamInput,
        mut state: DriverState,
        started: Instant,
        streaming_ms: u64,
        error: CortexError,
        hooks: &Arc<dyn StreamHooks>,
    ) -> Result<StreamOutcome> {
        let handling = self.config.partial_failure_handling;
        let finalization_started = Instant::now();

        if handling == PartialFailureHandling::Rollback {
            if let Some(message_id) = state.message_id.take() {
                if let Err(e) = self
                    .inner
                    .data()
                    .conversations
                    .remove_message(tenant_id, &input.conversation_id, &message_id)
                    .await
                {
                    tracing::error!("rollback: failed to remove partial message: {e}");
                }
            }
            hooks.on_error(&error, false, None);
            return Err(error);
        }

        // store-partial and best-effort commit what arrived.
        if state.hasher.is_none() {
            if let Some(message_id) = &state.message_id {
                if let Err(e) = self
                    .inner
                    .data()
                    .conversations
                    .replace_message(
                        tenant_id,
                        &input.conversation_id,
                        message_id,
                        &state.accumulated,
                    )
                    .await
                {
                    tracing::error!("failed to commit partial message: {e}");
                }
            }
        }

        let resume_token = (self.config.generate_resume_token && state.message_id.is_some())
            .then(|| ResumeToken {
                conversation_id: input.conversation_id.clone(),
                message_id: state.message_id.clone().expect("checked above"),
                byte_offset: state.bytes,
            });
        hooks.on_error(&error, true, resume_token.as_ref());

        let metrics = self.metrics(&state, started);
        let outcome = StreamOutcome {
            full_response: state.hasher.is_none().then(|| state.accumulated.clone()),
            response_hash: state.hasher.map(|h| hex(&h.finalize())),
            total_chunks: state.chunks,
            completed: false,
            message_id: state.message_id,
            facts: state.facts,
            resume_token,
            metrics,
            performance: PerformanceBreakdown {
                streaming_ms,
                fact_extraction_ms: state.extraction_ms,
                storage_ms: state.storage_ms,
                finalization_ms: finalization_started.elapsed().as_millis() as u64,
            },
        };

        match handling {
            PartialFailureHandling::BestEffort => Ok(outcome),
            _ => Err(error),
        }
    }

    /// Continue an interrupted stream from a resume token: new chunks append
    /// to the partial message recorded by the token.
    pub async fn resume(
        &self,
        tenant_id: &str,
        token: &ResumeToken,
        mut continuation: ChunkStream,
    ) -> Result<String> {
        let conversation = self
            .inner
            .data()
            .conversations
            .require(tenant_id, &token.conversation_id)?;
        let mut content = conversation
            .messages
            .iter()
            .find(|m| m.id == token.message_id)
            .map(|m| m.content.clone())
            .ok_or_else(|| CortexError::not_found(format!("message {}", token.message_id)))?;

        while let Some(chunk) = continuation.next().await {
            content.push_str(&chunk?);
            self.inner
                .data()
                .conversations
                .replace_message(tenant_id, &token.conversation_id, &token.message_id, &content)
                .await?;
        }
        Ok(content)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_encoding() {
        assert_eq!(hex(&[0x00, 0xff, 0x10]), "00ff10");
    }

    #[test]
    fn test_metrics_estimated_tokens() {
        let state = DriverState {
            accumulated: String::new(),
            hasher: None,
            chunks: 3,
            bytes: 120,
            first_chunk_at: None,
            message_id: None,
            last_partial_commit: Instant::now(),
            last_extract_offset: 0,
            last_graph_sync: Instant::now(),
            facts: Vec::new(),
            supersessions: Vec::new(),
            extraction_ms: 0,
            storage_ms: 0,
        };
        let orchestrator_metrics = StreamMetrics {
            estimated_tokens: state.bytes / 4,
            ..StreamMetrics::default()
        };
        assert_eq!(orchestrator_metrics.estimated_tokens, 30);
    }
}
