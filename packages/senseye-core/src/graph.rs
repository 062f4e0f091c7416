//! In-memory graph of vertices (nodes and devices) and edges (the latest
//! observation carried along each observer→target signal path).
//!
//! Kept deliberately thin: the orchestrator and inference stage query it for
//! "who has seen whom" without re-deriving that from the raw observation
//! stream each cycle.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::model::Observation;

/// What kind of thing a graph vertex represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexKind {
    /// A mesh node (has its own scanner and broadcasts beliefs).
    Node,
    /// A passively observed device (phone, laptop, BLE tag, ...).
    Device,
}

/// A signal path from one observer to one target, carrying the most recent
/// observation seen along it.
#[derive(Debug, Clone)]
pub struct Edge {
    pub observer_id: String,
    pub target_id: String,
    pub last_observation: Observation,
}

/// The graph of observers and observed devices, rebuilt incrementally as
/// observations arrive.
#[derive(Default)]
pub struct SignalGraph {
    vertex_kinds: RwLock<HashMap<String, VertexKind>>,
    edges: RwLock<HashMap<(String, String), Edge>>,
}

impl SignalGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `id` as a vertex of the given kind, inserting it if new.
    pub fn upsert_vertex(&self, id: &str, kind: VertexKind) {
        self.vertex_kinds
            .write()
            .entry(id.to_string())
            .or_insert(kind);
    }

    /// Records that `observer_id` produced `observation`, creating both
    /// vertices and the connecting edge if they don't already exist.
    pub fn record_observation(&self, observer_id: &str, observation: Observation) {
        self.upsert_vertex(observer_id, VertexKind::Node);
        self.upsert_vertex(&observation.device_id, VertexKind::Device);

        let key = (observer_id.to_string(), observation.device_id.clone());
        self.edges.write().insert(
            key,
            Edge {
                observer_id: observer_id.to_string(),
                target_id: observation.device_id.clone(),
                last_observation: observation,
            },
        );
    }

    /// All edges (observer, target, last observation) with `observer_id` as
    /// the source.
    pub fn edges_from(&self, observer_id: &str) -> Vec<Edge> {
        self.edges
            .read()
            .values()
            .filter(|e| e.observer_id == observer_id)
            .cloned()
            .collect()
    }

    /// Every device id ever observed by any node.
    pub fn device_ids(&self) -> Vec<String> {
        self.vertex_kinds
            .read()
            .iter()
            .filter(|(_, kind)| **kind == VertexKind::Device)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// How many (observer, target) edges the graph currently holds.
    pub fn edge_count(&self) -> usize {
        self.edges.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SignalType;

    #[test]
    fn recording_an_observation_creates_both_vertices_and_an_edge() {
        let graph = SignalGraph::new();
        graph.record_observation("node-a", Observation::new("phone-1", -60.0, 0.0, SignalType::Wifi));

        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.device_ids(), vec!["phone-1".to_string()]);
        assert_eq!(graph.edges_from("node-a").len(), 1);
        assert!(graph.edges_from("node-b").is_empty());
    }

    #[test]
    fn a_later_observation_replaces_the_edge_rather_than_duplicating_it() {
        let graph = SignalGraph::new();
        graph.record_observation("node-a", Observation::new("phone-1", -60.0, 0.0, SignalType::Wifi));
        graph.record_observation("node-a", Observation::new("phone-1", -55.0, 1.0, SignalType::Wifi));

        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.edges_from("node-a")[0].last_observation.rssi, -55.0);
    }
}
