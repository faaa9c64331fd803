use crate::llm::{strip_fences, CompletionRequest, Completer};
use cortex_common::{FactRelation, Result};
use serde::Deserialize;
use std::sync::Arc;

const EXTRACTION_SYSTEM_PROMPT: &str = "You are a memory extraction system for an AI agent. \
    Analyze the conversation turn and extract durable facts about the user \
    and the entities discussed. Focus on preferences, identity, knowledge, \
    relationships, events and observations. Skip trivial chitchat. \
    \
    Output format (JSON array): \
    [{\"fact\": \"natural language statement\", \
      \"factType\": \"preference|identity|knowledge|relationship|event|observation|custom\", \
      \"subject\": \"who or what the fact is about\", \
      \"predicate\": \"short relation name\", \
      \"object\": \"value of the relation\", \
      \"category\": \"optional grouping\", \
      \"searchAliases\": [\"alternative search terms\"], \
      \"semanticContext\": \"one-line disambiguation\", \
      \"entities\": [\"named entities\"], \
      \"relations\": [{\"subject\": \"s\", \"predicate\": \"p\", \"object\": \"o\"}], \
      \"confidence\": 0-100}] \
    \
    Return ONLY the JSON array. Return [] when nothing is worth remembering.";

const STRICT_RETRY_SUFFIX: &str = "\n\nYour previous reply was not valid JSON. \
    Respond with NOTHING but a JSON array matching the requested shape. \
    No prose, no markdown fences.";

/// One candidate from the extraction rubric, in wire shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactCandidate {
    pub fact: String,
    #[serde(default = "default_fact_type")]
    pub fact_type: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub predicate: Option<String>,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub search_aliases: Vec<String>,
    #[serde(default)]
    pub semantic_context: Option<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub relations: Vec<FactRelation>,
    #[serde(default = "default_confidence")]
    pub confidence: u8,
}

fn default_fact_type() -> String {
    "observation".to_string()
}

fn default_confidence() -> u8 {
    70
}

impl FactCandidate {
    /// The slot subject, recovered from the explicit field, the first
    /// relation, or the first entity, in that order.
    pub fn resolved_subject(&self) -> String {
        if let Some(subject) = &self.subject {
            if !subject.trim().is_empty() {
                return subject.trim().to_string();
            }
        }
        if let Some(relation) = self.relations.first() {
            return relation.subject.clone();
        }
        self.entities
            .first()
            .cloned()
            .unwrap_or_else(|| "user".to_string())
    }

    pub fn resolved_predicate(&self) -> Option<String> {
        if self.predicate.as_deref().map(str::trim).filter(|p| !p.is_empty()).is_some() {
            return self.predicate.clone();
        }
        self.relations.first().map(|r| r.predicate.clone())
    }

    pub fn resolved_object(&self) -> Option<String> {
        if self.object.as_deref().map(str::trim).filter(|o| !o.is_empty()).is_some() {
            return self.object.clone();
        }
        self.relations.first().map(|r| r.object.clone())
    }
}

/// Runs the extraction rubric against a Completer. Malformed output gets one
/// stricter retry; a second failure yields an empty candidate list, never an
/// error; extraction failure is degraded operation.
#[derive(Clone)]
pub struct FactExtractor {
    completer: Arc<dyn Completer>,
    model: Option<String>,
}

impl FactExtractor {
    pub fn new(completer: Arc<dyn Completer>, model: Option<String>) -> Self {
        Self { completer, model }
    }

    pub async fn extract(&self, text: &str) -> Result<Vec<FactCandidate>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let request = CompletionRequest::user(format!("Conversation turn:\n{text}"))
            .with_system(EXTRACTION_SYSTEM_PROMPT)
            .json();
        let request = CompletionRequest {
            model: self.model.clone(),
            ..request
        };

        let raw = self.completer.complete(request.clone()).await?;
        if let Some(candidates) = parse_candidates(&raw) {
            return Ok(candidates);
        }

        tracing::warn!("fact extraction returned malformed JSON, retrying once");
        let strict = CompletionRequest {
            system: request
                .system
                .as_ref()
                .map(|s| format!("{s}{STRICT_RETRY_SUFFIX}")),
            ..request
        };
        let raw = self.completer.complete(strict).await?;
        match parse_candidates(&raw) {
            Some(candidates) => Ok(candidates),
            None => {
                tracing::warn!("fact extraction failed twice, giving up on this turn");
                Ok(Vec::new())
            }
        }
    }
}

/// Tolerant parse: fences stripped, then either a bare array or an object
/// wrapping one under a `facts` key (json-mode providers often wrap).
pub fn parse_candidates(raw: &str) -> Option<Vec<FactCandidate>> {
    let clean = strip_fences(raw);
    if let Ok(candidates) = serde_json::from_str::<Vec<FactCandidate>>(clean) {
        return Some(candidates);
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(clean) {
        if let Some(array) = value.get("facts") {
            if let Ok(candidates) = serde_json::from_value::<Vec<FactCandidate>>(array.clone()) {
                return Some(candidates);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cortex_common::CortexError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedCompleter {
        responses: Vec<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Completer for ScriptedCompleter {
        async fn complete(&self, _request: CompletionRequest) -> Result<String> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .get(i)
                .cloned()
                .ok_or_else(|| CortexError::transport("script exhausted"))
        }
    }

    fn extractor(responses: Vec<&str>) -> FactExtractor {
        FactExtractor::new(
            Arc::new(ScriptedCompleter {
                responses: responses.into_iter().map(str::to_string).collect(),
                calls: AtomicUsize::new(0),
            }),
            None,
        )
    }

    #[test]
    fn test_parse_tolerates_fences_and_wrappers() {
        let fenced = "```json\n[{\"fact\": \"User likes tea\"}]\n```";
        assert_eq!(parse_candidates(fenced).unwrap().len(), 1);

        let wrapped = "{\"facts\": [{\"fact\": \"User likes tea\"}]}";
        assert_eq!(parse_candidates(wrapped).unwrap().len(), 1);

        assert!(parse_candidates("not json at all").is_none());
    }

    #[tokio::test]
    async fn test_retry_once_then_empty() -> anyhow::Result<()> {
        let extractor = extractor(vec!["garbage", "still garbage"]);
        let candidates = extractor.extract("My name is Alex").await?;
        assert!(candidates.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_recovers() -> anyhow::Result<()> {
        let extractor = extractor(vec![
            "garbage",
            r#"[{"fact": "User is called Alex", "factType": "identity",
                "subject": "user", "predicate": "name", "object": "Alex",
                "confidence": 95}]"#,
        ]);
        let candidates = extractor.extract("My name is Alex").await?;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].resolved_subject(), "user");
        assert_eq!(candidates[0].resolved_object().as_deref(), Some("Alex"));
        Ok(())
    }

    #[test]
    fn test_subject_fallback_chain() {
        let from_relation: FactCandidate = serde_json::from_str(
            r#"{"fact": "Alex works at Acme",
                "relations": [{"subject": "Alex", "predicate": "works_at", "object": "Acme"}]}"#,
        )
        .unwrap();
        assert_eq!(from_relation.resolved_subject(), "Alex");
        assert_eq!(
            from_relation.resolved_predicate().as_deref(),
            Some("works_at")
        );

        let from_entity: FactCandidate =
            serde_json::from_str(r#"{"fact": "Acme ships widgets", "entities": ["Acme"]}"#)
                .unwrap();
        assert_eq!(from_entity.resolved_subject(), "Acme");

        let bare: FactCandidate = serde_json::from_str(r#"{"fact": "likes rain"}"#).unwrap();
        assert_eq!(bare.resolved_subject(), "user");
    }
}
