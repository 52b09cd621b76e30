//! Attention-weighted neighborhood aggregation.
//!
//! Scaled dot-product attention between the query center and every
//! trajectory node, biased by node importance (sum of incident hyperedge
//! weights). Adjacency influences the attention weight rather than masking:
//! isolated nodes still participate, just at low weight.

use engram_types::{EdgeId, NodeId};

/// One node of the caller-supplied context graph.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryNode {
    pub id: NodeId,
    pub embedding: Vec<f32>,
    /// Σ incident hyperedge weights.
    pub importance: f32,
}

/// Context graph accompanying an enhancement request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrajectoryGraph {
    pub nodes: Vec<TrajectoryNode>,
    /// Hyperedges backing the node set; part of the cache identity.
    pub hyperedge_ids: Vec<EdgeId>,
}

impl TrajectoryGraph {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids, for cache invalidation bookkeeping.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|node| node.id.clone()).collect()
    }
}

/// Residual-combine the center with the attention-weighted node sum.
///
/// `score_i = (q·k_i)/√d · importance_i`, softmax over nodes with matching
/// dimension, output = `center + Σ softmax_i · k_i`. At most `max_nodes`
/// nodes participate; extras are ignored in arrival order.
#[must_use]
pub fn aggregate(center: &[f32], graph: &TrajectoryGraph, max_nodes: usize) -> Vec<f32> {
    let dim = center.len();
    let scale = 1.0 / (dim as f32).sqrt();
    let eligible: Vec<&TrajectoryNode> = graph
        .nodes
        .iter()
        .filter(|node| node.embedding.len() == dim)
        .take(max_nodes)
        .collect();
    if eligible.is_empty() {
        return center.to_vec();
    }

    let scores: Vec<f32> = eligible
        .iter()
        .map(|node| {
            let dot: f32 = center
                .iter()
                .zip(node.embedding.iter())
                .map(|(a, b)| a * b)
                .sum();
            dot * scale * node.importance.max(0.0)
        })
        .collect();

    // Stable softmax.
    let peak = scores.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exps: Vec<f32> = scores.iter().map(|&s| (s - peak).exp()).collect();
    let total: f32 = exps.iter().sum();

    let mut out = center.to_vec();
    if total > 0.0 {
        for (node, weight) in eligible.iter().zip(exps.iter()) {
            let w = weight / total;
            for (slot, &component) in out.iter_mut().zip(node.embedding.iter()) {
                *slot += w * component;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, embedding: Vec<f32>, importance: f32) -> TrajectoryNode {
        TrajectoryNode {
            id: NodeId::from(name),
            embedding,
            importance,
        }
    }

    #[test]
    fn empty_graph_passes_center_through() {
        let center = vec![0.6, 0.8];
        let out = aggregate(&center, &TrajectoryGraph::default(), 50);
        assert_eq!(out, center);
    }

    #[test]
    fn aligned_high_importance_node_dominates() {
        let center = vec![1.0, 0.0];
        let graph = TrajectoryGraph {
            nodes: vec![
                node("aligned", vec![1.0, 0.0], 2.0),
                node("orthogonal", vec![0.0, 1.0], 2.0),
            ],
            hyperedge_ids: vec![],
        };
        let out = aggregate(&center, &graph, 50);
        // Residual keeps the center; the attention mass leans toward the
        // aligned node, so component 0 grows more than component 1.
        assert!(out[0] > 1.0);
        assert!(out[0] - 1.0 > out[1]);
    }

    #[test]
    fn zero_importance_still_participates() {
        let center = vec![1.0, 0.0];
        let graph = TrajectoryGraph {
            nodes: vec![node("isolated", vec![0.0, 1.0], 0.0)],
            hyperedge_ids: vec![],
        };
        let out = aggregate(&center, &graph, 50);
        // Softmax over one node gives it weight 1 regardless of score.
        assert!((out[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn max_nodes_caps_participation() {
        let center = vec![1.0, 0.0];
        let graph = TrajectoryGraph {
            nodes: vec![
                node("a", vec![0.0, 1.0], 1.0),
                node("b", vec![0.0, -1.0], 1.0),
            ],
            hyperedge_ids: vec![],
        };
        let capped = aggregate(&center, &graph, 1);
        // Only node `a` participates.
        assert!(capped[1] > 0.0);
    }

    #[test]
    fn mismatched_dimension_nodes_are_ignored() {
        let center = vec![1.0, 0.0];
        let graph = TrajectoryGraph {
            nodes: vec![node("bad", vec![1.0, 0.0, 0.0], 1.0)],
            hyperedge_ids: vec![],
        };
        assert_eq!(aggregate(&center, &graph, 50), center);
    }
}
