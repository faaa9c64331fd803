//! Persistent-memory substrate for conversational AI agents: a per-turn
//! orchestrator over a conversation log, vector memory, fact store and an
//! optional knowledge graph, with belief revision and unified recall.

pub mod cascade;
pub mod data;
pub mod engine;
pub mod extraction;
pub mod graph;
pub mod llm;
pub mod observer;
pub mod orchestrator;
pub mod recall;
pub mod retry;
pub mod revision;
pub mod storage;
pub mod stream;

pub use cascade::{CascadeCoordinator, SpaceCascadeSummary, UserCascadeSummary};
pub use cortex_common::config::{
    AuthContext, BeliefRevisionConfig, CortexConfig, FactExtractionConfig, FailurePolicy,
    GraphConfig, LlmConfig, LlmProvider, PartialFailureHandling, RetryConfig, StreamingConfig,
};
pub use cortex_common::{
    new_id, now_ms, AgentProfile, ContextNode, Conversation, ConversationType, CortexError, Fact,
    FactKind, FactRelation, ImmutableRecord, Message, MessageRole, MemorySource, MemorySpace,
    MutableRecord, Participants, Result, SpaceStatus, SpaceType, VectorMemory,
};
pub use engine::CortexEngine;
pub use extraction::{FactCandidate, FactExtractor};
pub use graph::{EmbeddedGraph, GraphAdapter, GraphCredentials, GraphEdge, GraphNode, GraphSync};
pub use llm::{AnthropicClient, CompletionRequest, Completer, Embedder, OpenAIClient};
pub use observer::{
    Layer, LayerEvent, LayerStatus, OrchestrationObserver, OrchestrationSummary, RecordingObserver,
};
pub use orchestrator::{
    FactRevisionRecord, MemoryOrchestrator, RememberInput, RememberResult,
};
pub use recall::{RecallItem, RecallItemKind, RecallPlanner, RecallRequest, RecallResult};
pub use revision::{RevisionDecision, RevisionEngine};
pub use stream::{
    ChunkStream, ResumeToken, StreamCompletion, StreamHooks, StreamInput, StreamMetrics,
    StreamOrchestrator, StreamOutcome, StreamSession,
};
