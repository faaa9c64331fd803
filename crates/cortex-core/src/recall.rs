use crate::data::DataAccess;
use crate::graph::{sync::fact_key, GraphSync};
use crate::llm::Embedder;
use cortex_common::error::{require_id, require_limit};
use cortex_common::{now_ms, Result, TimestampMs};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

const WEIGHT_SIMILARITY: f32 = 0.55;
const WEIGHT_CONFIDENCE: f32 = 0.25;
const WEIGHT_IMPORTANCE: f32 = 0.15;
const WEIGHT_RECENCY: f32 = 0.05;
/// Graph hits inherit the score of the seed that surfaced them, attenuated
/// per hop.
const GRAPH_HOP_FACTOR: f32 = 0.8;
const DEDUP_JACCARD_THRESHOLD: f32 = 0.85;
const RECENCY_HALF_LIFE_MS: f32 = 7.0 * 24.0 * 3600.0 * 1000.0;

#[derive(Debug, Clone)]
pub struct RecallRequest {
    pub memory_space_id: String,
    pub query: String,
    pub embedding: Option<Vec<f32>>,
    pub user_id: Option<String>,
    pub limit: usize,
    pub min_importance: Option<u8>,
    pub include_vector: bool,
    pub include_facts: bool,
    pub include_graph: bool,
    pub format_for_llm: bool,
}

impl RecallRequest {
    pub fn new(memory_space_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            memory_space_id: memory_space_id.into(),
            query: query.into(),
            embedding: None,
            user_id: None,
            limit: 10,
            min_importance: None,
            include_vector: true,
            include_facts: true,
            include_graph: true,
            format_for_llm: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecallItemKind {
    Memory,
    Fact,
    Graph,
}

#[derive(Debug, Clone)]
pub struct RecallItem {
    pub kind: RecallItemKind,
    pub backing_id: String,
    pub text: String,
    pub score: f32,
    pub confidence: Option<u8>,
    pub importance: Option<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct SourceCounts {
    pub vector: usize,
    pub facts: usize,
    pub graph: usize,
}

#[derive(Debug, Clone)]
pub struct RecallResult {
    pub items: Vec<RecallItem>,
    pub context: Option<String>,
    pub total_results: usize,
    pub query_time_ms: u64,
    pub sources: SourceCounts,
}

/// Merges vector, fact and graph search into one ranked, deduplicated list
/// and renders the LLM-ready context block.
#[derive(Clone)]
pub struct RecallPlanner {
    data: DataAccess,
    embedder: Option<Arc<dyn Embedder>>,
    graph: Option<GraphSync>,
}

fn recency_decay(age_ms: i64) -> f32 {
    if age_ms <= 0 {
        return 1.0;
    }
    0.5_f32.powf(age_ms as f32 / RECENCY_HALF_LIFE_MS)
}

fn unified_score(
    similarity: f32,
    confidence: Option<u8>,
    importance: Option<u8>,
    created_at: TimestampMs,
    now: TimestampMs,
) -> f32 {
    WEIGHT_SIMILARITY * similarity
        + WEIGHT_CONFIDENCE * confidence.map(|c| f32::from(c) / 100.0).unwrap_or(0.0)
        + WEIGHT_IMPORTANCE * importance.map(|i| f32::from(i) / 100.0).unwrap_or(0.0)
        + WEIGHT_RECENCY * recency_decay(now - created_at)
}

fn token_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn jaccard(a: &str, b: &str) -> f32 {
    let sa = token_set(a);
    let sb = token_set(b);
    if sa.is_empty() && sb.is_empty() {
        return 1.0;
    }
    let intersection = sa.intersection(&sb).count() as f32;
    let union = sa.union(&sb).count() as f32;
    intersection / union
}

impl RecallPlanner {
    pub fn new(
        data: DataAccess,
        embedder: Option<Arc<dyn Embedder>>,
        graph: Option<GraphSync>,
    ) -> Self {
        Self {
            data,
            embedder,
            graph,
        }
    }

    pub async fn recall(&self, tenant_id: &str, request: RecallRequest) -> Result<RecallResult> {
        require_id(&request.memory_space_id, "memorySpaceId")?;
        require_limit(request.limit)?;
        let started = Instant::now();
        let now = now_ms();

        // Derive the embedding when the caller wants semantic search but
        // didn't supply one. Embedder failure degrades to keyword search.
        let mut embedding = request.embedding.clone();
        if embedding.is_none() && request.include_vector && !request.query.trim().is_empty() {
            if let Some(embedder) = &self.embedder {
                match embedder.embed(&request.query).await {
                    Ok(vector) => embedding = Some(vector),
                    Err(e) => tracing::warn!("query embedding failed, keyword only: {e}"),
                }
            }
        }

        let fetch = request.limit.max(5);
        let memories_fut = async {
            if !request.include_vector {
                return Ok(Vec::new());
            }
            self.data
                .memories
                .search(
                    tenant_id,
                    &request.memory_space_id,
                    &request.query,
                    embedding.as_deref(),
                    request.user_id.as_deref(),
                    request.min_importance,
                    fetch,
                )
                .await
        };
        let facts_fut = async {
            if !request.include_facts {
                return Ok(Vec::new());
            }
            self.data
                .facts
                .search(tenant_id, &request.memory_space_id, &request.query, fetch)
                .await
        };
        let (memory_hits, fact_hits) = tokio::join!(memories_fut, facts_fut);
        let memory_hits = memory_hits?;
        let fact_hits = fact_hits?;

        let mut sources = SourceCounts {
            vector: memory_hits.len(),
            facts: fact_hits.len(),
            ..SourceCounts::default()
        };

        let mut items: Vec<RecallItem> = Vec::new();
        for hit in &memory_hits {
            items.push(RecallItem {
                kind: RecallItemKind::Memory,
                backing_id: hit.memory.id.clone(),
                text: hit.memory.content.clone(),
                score: unified_score(
                    hit.score,
                    None,
                    Some(hit.memory.importance),
                    hit.memory.created_at,
                    now,
                ),
                confidence: None,
                importance: Some(hit.memory.importance),
            });
        }
        for hit in &fact_hits {
            items.push(RecallItem {
                kind: RecallItemKind::Fact,
                backing_id: hit.fact.id.clone(),
                text: hit.fact.statement.clone(),
                score: unified_score(
                    hit.score,
                    Some(hit.fact.confidence),
                    None,
                    hit.fact.created_at,
                    now,
                ),
                confidence: Some(hit.fact.confidence),
                importance: None,
            });
        }

        // Graph expansion: one hop out from the strongest fact seeds,
        // surfacing nodes the other layers did not already cover.
        if request.include_graph {
            if let Some(graph) = &self.graph {
                let covered: HashSet<String> =
                    items.iter().map(|i| i.backing_id.clone()).collect();
                let mut seeds: Vec<(&str, f32)> = fact_hits
                    .iter()
                    .map(|h| (h.fact.id.as_str(), h.score))
                    .collect();
                seeds.truncate(3);
                for (fact_id, seed_score) in seeds {
                    let neighbors = graph
                        .adapter()
                        .neighbors(&fact_key(fact_id), request.limit)
                        .await
                        .unwrap_or_default();
                    for node in neighbors {
                        if covered.contains(&node.key)
                            || items.iter().any(|i| i.backing_id == node.key)
                        {
                            continue;
                        }
                        let text = node
                            .properties
                            .get("statement")
                            .or_else(|| node.properties.get("content"))
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| node.key.clone());
                        sources.graph += 1;
                        items.push(RecallItem {
                            kind: RecallItemKind::Graph,
                            backing_id: node.key,
                            text,
                            score: seed_score * GRAPH_HOP_FACTOR,
                            confidence: None,
                            importance: None,
                        });
                    }
                }
            }
        }

        let mut items = dedup(items);
        // Deterministic order: score descending, id ascending on ties.
        items.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.backing_id.cmp(&b.backing_id))
        });
        let total_results = items.len();
        items.truncate(request.limit);

        let context = request.format_for_llm.then(|| format_context(&items));

        Ok(RecallResult {
            items,
            context,
            total_results,
            query_time_ms: started.elapsed().as_millis() as u64,
            sources,
        })
    }
}

/// Collapse duplicate backing ids, then collapse memories that restate a
/// fact (token Jaccard at or above the threshold); the fact wins.
fn dedup(items: Vec<RecallItem>) -> Vec<RecallItem> {
    let mut by_id: Vec<RecallItem> = Vec::new();
    let mut seen: HashSet<(&'static str, String)> = HashSet::new();
    for item in items {
        let kind_tag = match item.kind {
            RecallItemKind::Memory => "memory",
            RecallItemKind::Fact => "fact",
            RecallItemKind::Graph => "graph",
        };
        if seen.insert((kind_tag, item.backing_id.clone())) {
            by_id.push(item);
        }
    }

    let facts: Vec<String> = by_id
        .iter()
        .filter(|i| i.kind == RecallItemKind::Fact)
        .map(|i| i.text.clone())
        .collect();
    by_id.retain(|item| {
        item.kind != RecallItemKind::Memory
            || !facts
                .iter()
                .any(|fact| jaccard(fact, &item.text) >= DEDUP_JACCARD_THRESHOLD)
    });
    by_id
}

fn format_context(items: &[RecallItem]) -> String {
    let mut out = String::from("Relevant context from past interactions:\n");
    for item in items {
        match item.kind {
            RecallItemKind::Fact => {
                out.push_str(&format!(
                    "- [fact, confidence {}] {}\n",
                    item.confidence.unwrap_or(0),
                    item.text
                ));
            }
            RecallItemKind::Memory => {
                out.push_str(&format!(
                    "- [memory, importance {}] {}\n",
                    item.importance.unwrap_or(0),
                    item.text
                ));
            }
            RecallItemKind::Graph => {
                out.push_str(&format!("- [graph] {}\n", item.text));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(kind: RecallItemKind, id: &str, text: &str, score: f32) -> RecallItem {
        RecallItem {
            kind,
            backing_id: id.into(),
            text: text.into(),
            score,
            confidence: (kind == RecallItemKind::Fact).then_some(95),
            importance: (kind == RecallItemKind::Memory).then_some(30),
        }
    }

    #[test]
    fn test_jaccard_bounds() {
        assert!(jaccard("alice works at acme", "alice works at acme") > 0.99);
        assert!(jaccard("alice works at acme", "completely different words") < 0.2);
    }

    #[test]
    fn test_dedup_fact_wins_over_restating_memory() {
        let items = vec![
            item(
                RecallItemKind::Fact,
                "f1",
                "Alice works at Acme Corp",
                0.9,
            ),
            item(
                RecallItemKind::Memory,
                "m1",
                "alice works at acme corp",
                0.8,
            ),
            item(RecallItemKind::Memory, "m2", "Bob plays chess on Sundays", 0.5),
        ];
        let deduped = dedup(items);
        assert_eq!(deduped.len(), 2);
        assert!(deduped.iter().any(|i| i.backing_id == "f1"));
        assert!(deduped.iter().any(|i| i.backing_id == "m2"));
    }

    #[test]
    fn test_dedup_collapses_same_backing_id() {
        let items = vec![
            item(RecallItemKind::Fact, "f1", "a", 0.9),
            item(RecallItemKind::Fact, "f1", "a", 0.7),
        ];
        assert_eq!(dedup(items).len(), 1);
    }

    #[test]
    fn test_unified_score_weights() {
        let now = now_ms();
        // Fresh fact with full confidence and perfect similarity.
        let score = unified_score(1.0, Some(100), None, now, now);
        assert!((score - (0.55 + 0.25 + 0.05)).abs() < 1e-4);
        // Memory contributes importance instead of confidence.
        let score = unified_score(1.0, None, Some(100), now, now);
        assert!((score - (0.55 + 0.15 + 0.05)).abs() < 1e-4);
    }

    #[test]
    fn test_recency_decay_halves_weekly() {
        let week_ms = 7 * 24 * 3600 * 1000;
        assert!((recency_decay(week_ms) - 0.5).abs() < 1e-3);
        assert!((recency_decay(0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_format_context_block() {
        let items = vec![
            item(RecallItemKind::Fact, "f1", "User prefers to be called Alex", 0.9),
            item(RecallItemKind::Memory, "m1", "Talked about the weather", 0.4),
            item(RecallItemKind::Graph, "g1", "Alex works_at AcmeCorp", 0.3),
        ];
        let context = format_context(&items);
        assert!(context.starts_with("Relevant context from past interactions:"));
        assert!(context.contains("- [fact, confidence 95] User prefers to be called Alex"));
        assert!(context.contains("- [memory, importance 30] Talked about the weather"));
        assert!(context.contains("- [graph] Alex works_at AcmeCorp"));
    }
}
