use super::{GraphAdapter, GraphCredentials, GraphEdge, GraphNode, GraphRecords};
use async_trait::async_trait;
use cortex_common::{CortexError, Result};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

struct GraphState {
    graph: StableDiGraph<GraphNode, GraphEdge>,
    by_key: HashMap<String, NodeIndex>,
}

/// In-process `GraphAdapter` backed by petgraph. Serves as the reference
/// implementation and the test double; wire adapters for external drivers
/// implement the same trait.
#[derive(Clone)]
pub struct EmbeddedGraph {
    state: Arc<RwLock<GraphState>>,
}

impl Default for EmbeddedGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddedGraph {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(GraphState {
                graph: StableDiGraph::new(),
                by_key: HashMap::new(),
            })),
        }
    }

    pub async fn node_count(&self) -> usize {
        self.state.read().await.graph.node_count()
    }

    pub async fn edge_count(&self) -> usize {
        self.state.read().await.graph.edge_count()
    }
}

fn merge_properties(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Object(target), Value::Object(source)) => {
            for (k, v) in source {
                target.insert(k, v);
            }
        }
        (slot, incoming) => {
            if !incoming.is_null() {
                *slot = incoming;
            }
        }
    }
}

#[async_trait]
impl GraphAdapter for EmbeddedGraph {
    async fn connect(&self, _credentials: &GraphCredentials) -> Result<()> {
        Ok(())
    }

    async fn create_node(&self, node: GraphNode) -> Result<String> {
        let mut state = self.state.write().await;
        if let Some(&idx) = state.by_key.get(&node.key) {
            let incoming = node.properties;
            if let Some(existing) = state.graph.node_weight_mut(idx) {
                merge_properties(&mut existing.properties, incoming);
            }
            return Ok(node.key);
        }
        let key = node.key.clone();
        let idx = state.graph.add_node(node);
        state.by_key.insert(key.clone(), idx);
        Ok(key)
    }

    async fn upsert_edge(&self, edge: GraphEdge) -> Result<()> {
        let mut state = self.state.write().await;
        let from = *state
            .by_key
            .get(&edge.from)
            .ok_or_else(|| CortexError::not_found(format!("graph node {}", edge.from)))?;
        let to = *state
            .by_key
            .get(&edge.to)
            .ok_or_else(|| CortexError::not_found(format!("graph node {}", edge.to)))?;

        let existing = state
            .graph
            .edges_connecting(from, to)
            .find(|e| e.weight().edge_type == edge.edge_type)
            .map(|e| e.id());
        match existing {
            Some(edge_idx) => {
                if let Some(weight) = state.graph.edge_weight_mut(edge_idx) {
                    merge_properties(&mut weight.properties, edge.properties);
                }
            }
            None => {
                state.graph.add_edge(from, to, edge);
            }
        }
        Ok(())
    }

    async fn query(&self, _query: &str, _params: Value) -> Result<GraphRecords> {
        // The embedded graph has no query language; callers use the typed
        // traversal methods instead.
        Err(CortexError::validation(
            "embedded graph adapter does not support raw queries",
        ))
    }

    async fn find_path(&self, from: &str, to: &str, max_hops: usize) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let Some(&start) = state.by_key.get(from) else {
            return Ok(Vec::new());
        };
        let Some(&goal) = state.by_key.get(to) else {
            return Ok(Vec::new());
        };

        let mut parents: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([(start, 0usize)]);
        let mut visited = HashSet::from([start]);
        while let Some((current, depth)) = queue.pop_front() {
            if current == goal {
                let mut path = vec![goal];
                let mut cursor = goal;
                while let Some(&parent) = parents.get(&cursor) {
                    path.push(parent);
                    cursor = parent;
                }
                path.reverse();
                return Ok(path
                    .into_iter()
                    .filter_map(|idx| state.graph.node_weight(idx).map(|n| n.key.clone()))
                    .collect());
            }
            if depth >= max_hops {
                continue;
            }
            for neighbor in state.graph.neighbors_undirected(current) {
                if visited.insert(neighbor) {
                    parents.insert(neighbor, current);
                    queue.push_back((neighbor, depth + 1));
                }
            }
        }
        Ok(Vec::new())
    }

    async fn neighbors(&self, key: &str, limit: usize) -> Result<Vec<GraphNode>> {
        let state = self.state.read().await;
        let Some(&idx) = state.by_key.get(key) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for direction in [Direction::Outgoing, Direction::Incoming] {
            for neighbor in state.graph.neighbors_directed(idx, direction) {
                if !seen.insert(neighbor) {
                    continue;
                }
                if let Some(node) = state.graph.node_weight(neighbor) {
                    out.push(node.clone());
                    if out.len() >= limit {
                        return Ok(out);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn nodes_with_property(&self, property: &str, value: &str) -> Result<Vec<String>> {
        let state = self.state.read().await;
        Ok(state
            .graph
            .node_weights()
            .filter(|n| n.properties.get(property).and_then(Value::as_str) == Some(value))
            .map(|n| n.key.clone())
            .collect())
    }

    async fn delete_nodes_with_property(&self, property: &str, value: &str) -> Result<u64> {
        let mut state = self.state.write().await;
        let doomed: Vec<(String, NodeIndex)> = state
            .by_key
            .iter()
            .filter(|(_, &idx)| {
                state
                    .graph
                    .node_weight(idx)
                    .map(|n| n.properties.get(property).and_then(Value::as_str) == Some(value))
                    .unwrap_or(false)
            })
            .map(|(key, &idx)| (key.clone(), idx))
            .collect();
        let count = doomed.len() as u64;
        for (key, idx) in doomed {
            state.graph.remove_node(idx);
            state.by_key.remove(&key);
        }
        Ok(count)
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}
