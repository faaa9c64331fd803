use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub mod config;
pub mod error;

pub use error::{CortexError, Result};

/// Milliseconds since the Unix epoch. Every persisted row carries these.
pub type TimestampMs = i64;

pub fn now_ms() -> TimestampMs {
    chrono::Utc::now().timestamp_millis()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub const DEFAULT_TENANT: &str = "_default";

fn default_tenant() -> String {
    DEFAULT_TENANT.to_string()
}

// ── Memory spaces ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceType {
    Personal,
    Team,
    Project,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceStatus {
    Active,
    Archived,
}

/// Tenancy boundary scoping conversations, memories, facts and contexts.
/// Archiving preserves contents but forbids new writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySpace {
    pub id: String,
    pub space_type: SpaceType,
    pub status: SpaceStatus,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

impl MemorySpace {
    pub fn new(id: String, space_type: SpaceType, tenant_id: String) -> Self {
        let now = now_ms();
        Self {
            id,
            space_type,
            status: SpaceStatus::Active,
            tenant_id,
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Agents ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    pub created_at: TimestampMs,
}

// ── Conversations ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversationType {
    UserAgent,
    AgentAgent,
    Hive,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Participants {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Additional agents in hive conversations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participant_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Agent,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    pub timestamp: TimestampMs,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            role: MessageRole::User,
            content: content.into(),
            agent_id: None,
            participant_id: None,
            timestamp: now_ms(),
        }
    }

    pub fn agent(content: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            role: MessageRole::Agent,
            content: content.into(),
            agent_id: Some(agent_id.into()),
            participant_id: None,
            timestamp: now_ms(),
        }
    }
}

/// Ordered append-only message log. `message_count` always equals
/// `messages.len()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub memory_space_id: String,
    pub conversation_type: ConversationType,
    pub participants: Participants,
    pub messages: Vec<Message>,
    pub message_count: usize,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

// ── Vector memories ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemorySource {
    Conversation,
    System,
    Tool,
    A2a,
    FactExtraction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorMemory {
    pub id: String,
    pub memory_space_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub content: String,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub source: MemorySource,
    /// 0–100 relevance weight used by recall ranking.
    pub importance: u8,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    pub created_at: TimestampMs,
}

impl VectorMemory {
    pub fn new(memory_space_id: String, content: String, source: MemorySource) -> Self {
        Self {
            id: new_id(),
            memory_space_id,
            user_id: None,
            content,
            content_type: "text".to_string(),
            embedding: None,
            source,
            importance: 50,
            tags: Vec::new(),
            tenant_id: default_tenant(),
            created_at: now_ms(),
        }
    }
}

// ── Facts ───────────────────────────────────────────────────────

/// Typed fact payload. Variants carry the slots they require; relationship-
/// like kinds must name both predicate and object, observational kinds may
/// omit them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "factType", rename_all = "kebab-case")]
pub enum FactKind {
    Preference {
        predicate: String,
        object: String,
    },
    Identity {
        predicate: String,
        object: String,
    },
    Knowledge {
        #[serde(skip_serializing_if = "Option::is_none")]
        predicate: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        object: Option<String>,
    },
    Relationship {
        predicate: String,
        object: String,
    },
    Event {
        #[serde(skip_serializing_if = "Option::is_none")]
        predicate: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        object: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        occurred_at: Option<TimestampMs>,
    },
    Observation {
        #[serde(skip_serializing_if = "Option::is_none")]
        predicate: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        object: Option<String>,
    },
    Custom {
        label: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        predicate: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        object: Option<String>,
    },
}

impl FactKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            FactKind::Preference { .. } => "preference",
            FactKind::Identity { .. } => "identity",
            FactKind::Knowledge { .. } => "knowledge",
            FactKind::Relationship { .. } => "relationship",
            FactKind::Event { .. } => "event",
            FactKind::Observation { .. } => "observation",
            FactKind::Custom { .. } => "custom",
        }
    }

    pub fn predicate(&self) -> Option<&str> {
        match self {
            FactKind::Preference { predicate, .. }
            | FactKind::Identity { predicate, .. }
            | FactKind::Relationship { predicate, .. } => Some(predicate),
            FactKind::Knowledge { predicate, .. }
            | FactKind::Event { predicate, .. }
            | FactKind::Observation { predicate, .. }
            | FactKind::Custom { predicate, .. } => predicate.as_deref(),
        }
    }

    pub fn object(&self) -> Option<&str> {
        match self {
            FactKind::Preference { object, .. }
            | FactKind::Identity { object, .. }
            | FactKind::Relationship { object, .. } => Some(object),
            FactKind::Knowledge { object, .. }
            | FactKind::Event { object, .. }
            | FactKind::Observation { object, .. }
            | FactKind::Custom { object, .. } => object.as_deref(),
        }
    }

    /// Build a kind from loosely-typed wire fields (extraction output).
    pub fn from_parts(
        type_name: &str,
        predicate: Option<String>,
        object: Option<String>,
    ) -> Self {
        match type_name {
            "preference" => FactKind::Preference {
                predicate: predicate.unwrap_or_else(|| "prefers".to_string()),
                object: object.unwrap_or_default(),
            },
            "identity" => FactKind::Identity {
                predicate: predicate.unwrap_or_else(|| "is".to_string()),
                object: object.unwrap_or_default(),
            },
            "relationship" => FactKind::Relationship {
                predicate: predicate.unwrap_or_else(|| "related_to".to_string()),
                object: object.unwrap_or_default(),
            },
            "event" => FactKind::Event {
                predicate,
                object,
                occurred_at: None,
            },
            "observation" => FactKind::Observation { predicate, object },
            "knowledge" => FactKind::Knowledge { predicate, object },
            other => FactKind::Custom {
                label: other.to_string(),
                predicate,
                object,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRelation {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

/// A distilled natural-language statement. Active iff `valid_until` is unset;
/// a superseded fact points at its replacement through `superseded_by`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub memory_space_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub statement: String,
    #[serde(flatten)]
    pub kind: FactKind,
    pub subject: String,
    /// 0–100
    pub confidence: u8,
    pub valid_from: TimestampMs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<TimestampMs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub search_aliases: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_context: Option<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub relations: Vec<FactRelation>,
    /// Unrecognized wire fields survive round-trips here.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, Value>,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

impl Fact {
    pub fn is_active(&self) -> bool {
        self.valid_until.is_none()
    }

    /// The slot belief revision uses to detect conflicts.
    pub fn slot(&self) -> (String, Option<String>) {
        (
            self.subject.trim().to_lowercase(),
            self.kind.predicate().map(normalize_predicate),
        )
    }
}

pub fn normalize_predicate(p: &str) -> String {
    p.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Case-insensitive, whitespace-collapsed text comparison key.
pub fn normalize_text(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ── Contexts ────────────────────────────────────────────────────

/// Chain node. Parent-pointer creation only, so the forest stays acyclic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextNode {
    pub id: String,
    pub memory_space_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub children_ids: Vec<String>,
    pub payload: Value,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

// ── Versioned and mutable records ───────────────────────────────

pub const MAX_PREVIOUS_VERSIONS: usize = 10;

/// Generic append-only versioned KV. User profiles are stored here with
/// `record_type == "user"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImmutableRecord {
    pub record_type: String,
    pub id: String,
    pub data: Value,
    pub version: u32,
    #[serde(default)]
    pub previous_versions: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutableRecord {
    pub namespace: String,
    pub key: String,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    pub updated_at: TimestampMs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fact_kind_wire_tag() {
        let kind = FactKind::Preference {
            predicate: "favorite color".into(),
            object: "blue".into(),
        };
        let json = serde_json::to_value(&kind).expect("serialize");
        assert_eq!(json["factType"], "preference");

        let back: FactKind = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, kind);
    }

    #[test]
    fn test_fact_extensions_flatten() {
        let json = serde_json::json!({
            "id": "f1",
            "memory_space_id": "s1",
            "statement": "User prefers tea",
            "factType": "preference",
            "predicate": "drinks",
            "object": "tea",
            "subject": "user",
            "confidence": 80,
            "valid_from": 1,
            "created_at": 1,
            "updated_at": 1,
            "someVendorField": {"a": 1}
        });
        let fact: Fact = serde_json::from_value(json).expect("deserialize");
        assert!(fact.extensions.contains_key("someVendorField"));
        assert_eq!(fact.kind.object(), Some("tea"));
        assert!(fact.is_active());
    }

    #[test]
    fn test_slot_normalization() {
        let mut fact: Fact = serde_json::from_value(serde_json::json!({
            "id": "f1",
            "memory_space_id": "s1",
            "statement": "x",
            "factType": "preference",
            "predicate": "  Favorite   Color ",
            "object": "blue",
            "subject": " User ",
            "confidence": 80,
            "valid_from": 1,
            "created_at": 1,
            "updated_at": 1
        }))
        .expect("deserialize");
        assert_eq!(
            fact.slot(),
            ("user".to_string(), Some("favorite color".to_string()))
        );
        fact.valid_until = Some(2);
        assert!(!fact.is_active());
    }

    #[test]
    fn test_message_timestamps_monotonic_clamp_material() {
        let m1 = Message::user("hello");
        let m2 = Message::agent("hi", "agent-1");
        assert!(m2.timestamp >= m1.timestamp);
    }
}
