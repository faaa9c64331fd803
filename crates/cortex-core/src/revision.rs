use crate::llm::{strip_fences, CompletionRequest, Completer};
use cortex_common::config::BeliefRevisionConfig;
use cortex_common::{normalize_text, Fact};
use serde::Deserialize;
use std::sync::Arc;

/// Outcome of belief revision for one candidate fact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionDecision {
    /// Store the candidate as a new active fact.
    Create,
    /// Merge the candidate's aliases/context into an existing fact in place.
    Update { target_id: String },
    /// Retire the target and store the candidate as its replacement.
    Supersede { target_id: String },
    /// No write; the target's confidence gets a diminishing-returns bump.
    SkipDuplicate { target_id: String },
}

impl RevisionDecision {
    pub fn kind(&self) -> &'static str {
        match self {
            RevisionDecision::Create => "create",
            RevisionDecision::Update { .. } => "update",
            RevisionDecision::Supersede { .. } => "supersede",
            RevisionDecision::SkipDuplicate { .. } => "skip-duplicate",
        }
    }
}

const ARBITRATION_SYSTEM_PROMPT: &str = "You are a belief revision arbiter for an AI memory \
    store. A new candidate fact conflicts with existing facts about the same \
    subject. Decide what to do with the candidate. \
    \
    Precedence rules: \
    1. Explicit user retraction ('actually, ...', 'I no longer ...') means the \
       candidate SUPERSEDES the contradicted fact. \
    2. Temporal cues ('now', 'currently', 'these days') favor the candidate: \
       SUPERSEDE. \
    3. Otherwise favor the statement with higher confidence. \
    4. If the candidate only restates an existing fact, SKIP_DUPLICATE. \
    5. If the candidate adds detail to an existing fact without contradicting \
       it, UPDATE that fact. \
    6. If the candidate is genuinely new information, CREATE. \
    \
    Output ONLY JSON: {\"decision\": \"CREATE|UPDATE|SUPERSEDE|SKIP_DUPLICATE\", \
    \"targetId\": \"id of the existing fact, required unless CREATE\"}";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArbitrationVerdict {
    decision: String,
    #[serde(default)]
    target_id: Option<String>,
}

/// Belief-revision engine: slot matching, textual dedup, optional LLM
/// arbitration, and a deterministic default policy. `decide` is pure with
/// respect to storage; callers apply the decision through the fact store.
#[derive(Clone)]
pub struct RevisionEngine {
    config: BeliefRevisionConfig,
}

impl RevisionEngine {
    pub fn new(config: BeliefRevisionConfig) -> Self {
        Self { config }
    }

    pub async fn decide(
        &self,
        candidate: &Fact,
        existing: &[Fact],
        completer: Option<&Arc<dyn Completer>>,
    ) -> RevisionDecision {
        if !self.config.enabled {
            return RevisionDecision::Create;
        }

        // Textual duplicate beats everything: identical statements never
        // fork the store no matter what the slots look like.
        let candidate_text = normalize_text(&candidate.statement);
        if let Some(dup) = existing
            .iter()
            .find(|f| normalize_text(&f.statement) == candidate_text)
        {
            return RevisionDecision::SkipDuplicate {
                target_id: dup.id.clone(),
            };
        }

        let mut conflicts: Vec<&Fact> = Vec::new();
        if self.config.slot_matching {
            let slot = candidate.slot();
            if slot.1.is_some() {
                for fact in existing {
                    if fact.slot() != slot {
                        continue;
                    }
                    let same_object = match (candidate.kind.object(), fact.kind.object()) {
                        (Some(a), Some(b)) => {
                            a.trim().eq_ignore_ascii_case(b.trim())
                        }
                        (None, None) => true,
                        _ => false,
                    };
                    if same_object {
                        return RevisionDecision::SkipDuplicate {
                            target_id: fact.id.clone(),
                        };
                    }
                    conflicts.push(fact);
                }
            }
        }

        if conflicts.is_empty() {
            return RevisionDecision::Create;
        }

        if self.config.llm_resolution {
            if let Some(completer) = completer {
                match self.arbitrate(candidate, &conflicts, completer).await {
                    Some(decision) => return decision,
                    None => {
                        tracing::warn!(
                            "belief-revision arbitration unavailable, using default policy"
                        );
                    }
                }
            }
        }

        // Default policy: a slot conflict with a differing object supersedes
        // the oldest conflicting fact.
        RevisionDecision::Supersede {
            target_id: conflicts[0].id.clone(),
        }
    }

    async fn arbitrate(
        &self,
        candidate: &Fact,
        conflicts: &[&Fact],
        completer: &Arc<dyn Completer>,
    ) -> Option<RevisionDecision> {
        let mut context = String::new();
        for fact in conflicts {
            context.push_str(&format!(
                "ID: {}\nConfidence: {}\nStatement: {}\n---\n",
                fact.id, fact.confidence, fact.statement
            ));
        }
        let prompt = format!(
            "Existing facts:\n{context}\nCandidate (confidence {}):\n{}",
            candidate.confidence, candidate.statement
        );

        let request = CompletionRequest::user(prompt)
            .with_system(ARBITRATION_SYSTEM_PROMPT)
            .json();
        let raw = match completer.complete(request).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("arbitration call failed: {e}");
                return None;
            }
        };

        let verdict: ArbitrationVerdict = serde_json::from_str(strip_fences(&raw)).ok()?;
        let target_or_default = |explicit: Option<String>| {
            explicit
                .filter(|id| conflicts.iter().any(|f| f.id == *id))
                .unwrap_or_else(|| conflicts[0].id.clone())
        };
        match verdict.decision.to_ascii_uppercase().as_str() {
            "CREATE" => Some(RevisionDecision::Create),
            "UPDATE" => Some(RevisionDecision::Update {
                target_id: target_or_default(verdict.target_id),
            }),
            "SUPERSEDE" => Some(RevisionDecision::Supersede {
                target_id: target_or_default(verdict.target_id),
            }),
            "SKIP_DUPLICATE" => Some(RevisionDecision::SkipDuplicate {
                target_id: target_or_default(verdict.target_id),
            }),
            other => {
                tracing::warn!("arbiter returned unknown decision {other:?}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cortex_common::{new_id, now_ms, CortexError, FactKind, Result};

    fn preference(subject: &str, predicate: &str, object: &str, statement: &str) -> Fact {
        let now = now_ms();
        Fact {
            id: new_id(),
            memory_space_id: "s1".into(),
            user_id: Some("u1".into()),
            statement: statement.into(),
            kind: FactKind::Preference {
                predicate: predicate.into(),
                object: object.into(),
            },
            subject: subject.into(),
            confidence: 80,
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

    fn engine() -> RevisionEngine {
        RevisionEngine::new(BeliefRevisionConfig::default())
    }

    #[tokio::test]
    async fn test_disabled_mode_always_creates() {
        let engine = RevisionEngine::new(BeliefRevisionConfig {
            enabled: false,
            ..BeliefRevisionConfig::default()
        });
        let existing = vec![preference("user", "favorite color", "blue", "likes blue")];
        let candidate = preference("user", "favorite color", "blue", "likes blue");
        let decision = engine.decide(&candidate, &existing, None).await;
        assert_eq!(decision, RevisionDecision::Create);
    }

    #[tokio::test]
    async fn test_same_slot_same_object_skips() {
        let existing = vec![preference(
            "user",
            "favorite color",
            "Blue",
            "User's favorite color is blue",
        )];
        let candidate = preference(
            "User",
            "Favorite  Color",
            " blue ",
            "The user likes the color blue best",
        );
        let decision = engine().decide(&candidate, &existing, None).await;
        assert_eq!(
            decision,
            RevisionDecision::SkipDuplicate {
                target_id: existing[0].id.clone()
            }
        );
    }

    #[tokio::test]
    async fn test_textual_duplicate_skips() {
        let existing = vec![preference(
            "user",
            "favorite color",
            "blue",
            "User prefers   BLUE",
        )];
        // Different slot entirely, but the statement normalizes equal.
        let candidate = preference("user", "likes", "blue", "user prefers blue");
        let decision = engine().decide(&candidate, &existing, None).await;
        assert!(matches!(decision, RevisionDecision::SkipDuplicate { .. }));
    }

    #[tokio::test]
    async fn test_slot_conflict_supersedes_without_llm() {
        let existing = vec![preference(
            "user",
            "favorite color",
            "blue",
            "User's favorite color is blue",
        )];
        let candidate = preference(
            "user",
            "favorite color",
            "purple",
            "User's favorite color is purple",
        );
        let decision = engine().decide(&candidate, &existing, None).await;
        assert_eq!(
            decision,
            RevisionDecision::Supersede {
                target_id: existing[0].id.clone()
            }
        );
    }

    #[tokio::test]
    async fn test_no_conflict_creates() {
        let existing = vec![preference(
            "user",
            "favorite color",
            "blue",
            "User's favorite color is blue",
        )];
        let candidate = preference("user", "drinks", "tea", "User drinks tea");
        let decision = engine().decide(&candidate, &existing, None).await;
        assert_eq!(decision, RevisionDecision::Create);
    }

    #[tokio::test]
    async fn test_idempotence_after_apply() {
        // After a supersession is applied the replacement is the only active
        // fact for the slot; re-running the same candidate must not create a
        // second supersession.
        let purple = preference(
            "user",
            "favorite color",
            "purple",
            "User's favorite color is purple",
        );
        let rerun = purple.clone();
        let decision = engine()
            .decide(&rerun, std::slice::from_ref(&purple), None)
            .await;
        assert_eq!(
            decision,
            RevisionDecision::SkipDuplicate {
                target_id: purple.id.clone()
            }
        );
    }

    struct FixedCompleter(String);

    #[async_trait]
    impl Completer for FixedCompleter {
        async fn complete(&self, _request: CompletionRequest) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    struct FailingCompleter;

    #[async_trait]
    impl Completer for FailingCompleter {
        async fn complete(&self, _request: CompletionRequest) -> Result<String> {
            Err(CortexError::transport("rate limited"))
        }
    }

    #[tokio::test]
    async fn test_arbiter_verdict_wins() {
        let existing = vec![preference(
            "user",
            "favorite color",
            "blue",
            "User's favorite color is blue",
        )];
        let candidate = preference(
            "user",
            "favorite color",
            "navy blue",
            "User's favorite color is navy blue, a refinement",
        );
        let completer: Arc<dyn Completer> = Arc::new(FixedCompleter(format!(
            "{{\"decision\": \"UPDATE\", \"targetId\": \"{}\"}}",
            existing[0].id
        )));
        let decision = engine().decide(&candidate, &existing, Some(&completer)).await;
        assert_eq!(
            decision,
            RevisionDecision::Update {
                target_id: existing[0].id.clone()
            }
        );
    }

    #[tokio::test]
    async fn test_arbiter_failure_falls_back_to_default() {
        let existing = vec![preference(
            "user",
            "favorite color",
            "blue",
            "User's favorite color is blue",
        )];
        let candidate = preference(
            "user",
            "favorite color",
            "purple",
            "User's favorite color is purple",
        );
        let completer: Arc<dyn Completer> = Arc::new(FailingCompleter);
        let decision = engine().decide(&candidate, &existing, Some(&completer)).await;
        assert_eq!(
            decision,
            RevisionDecision::Supersede {
                target_id: existing[0].id.clone()
            }
        );
    }

    #[tokio::test]
    async fn test_arbiter_malformed_falls_back() {
        let existing = vec![preference(
            "user",
            "favorite color",
            "blue",
            "User's favorite color is blue",
        )];
        let candidate = preference(
            "user",
            "favorite color",
            "purple",
            "User's favorite color is purple",
        );
        let completer: Arc<dyn Completer> =
            Arc::new(FixedCompleter("I think you should supersede it".into()));
        let decision = engine().decide(&candidate, &existing, Some(&completer)).await;
        assert!(matches!(decision, RevisionDecision::Supersede { .. }));
    }
}
