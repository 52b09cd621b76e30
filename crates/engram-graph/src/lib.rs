//! Hypergraph store.
//!
//! Nodes carry embeddings; hyperedges relate three or more nodes at once
//! and carry a weight in [0, 1]. Non-seed nodes must be linked at creation
//! (orphan prevention), and every mutation is all-or-nothing: the node, the
//! edge, and the inverted incidence index appear together or not at all.
//! Durability is a pair of append-only NDJSON logs (`graph.nodes`,
//! `graph.edges`) replayed at open.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use engram_error::{EngramError, Result};
use engram_types::{Clock, EdgeId, Metadata, NodeId, SystemClock};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const NODES_LOG: &str = "graph.nodes";
const EDGES_LOG: &str = "graph.edges";
const MIN_PARTICIPANTS: usize = 3;

/// A stored graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: NodeId,
    pub embedding: Vec<f32>,
    pub labels: BTreeSet<String>,
    pub properties: Metadata,
    pub created_at: u64,
}

/// A hyperedge relating `participants` (≥ 3) under one `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperedge {
    pub id: EdgeId,
    pub participants: BTreeSet<NodeId>,
    pub kind: String,
    pub weight: f32,
    pub created_at: u64,
}

/// How a new node attaches to the graph.
#[derive(Debug, Clone, Default)]
pub struct NodeLink {
    /// Seed nodes may exist unlinked.
    pub seed: bool,
    /// Existing nodes to join into a creation hyperedge with the new node.
    pub link_to: Vec<NodeId>,
    /// Kind tag for the creation hyperedge.
    pub kind: String,
    /// Weight for the creation hyperedge.
    pub weight: f32,
}

impl NodeLink {
    #[must_use]
    pub fn seed() -> Self {
        Self {
            seed: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn to(link_to: Vec<NodeId>, kind: &str, weight: f32) -> Self {
        Self {
            seed: false,
            link_to,
            kind: kind.to_string(),
            weight,
        }
    }
}

/// Connected slice of the graph returned by [`GraphStore::subgraph`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subgraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<Hyperedge>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LogLine {
    Node(GraphNode),
    Edge(Hyperedge),
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<NodeId, GraphNode>,
    edges: HashMap<EdgeId, Hyperedge>,
    incidence: HashMap<NodeId, BTreeSet<EdgeId>>,
}

impl Inner {
    fn apply_edge(&mut self, edge: Hyperedge) {
        for participant in &edge.participants {
            self.incidence
                .entry(participant.clone())
                .or_default()
                .insert(edge.id.clone());
        }
        self.edges.insert(edge.id.clone(), edge);
    }
}

pub struct GraphStore {
    dim: usize,
    tolerance: f32,
    clock: Arc<dyn Clock>,
    log_dir: Option<PathBuf>,
    inner: RwLock<Inner>,
}

impl GraphStore {
    /// In-memory store (no durability logs).
    #[must_use]
    pub fn new(dim: usize, tolerance: f32) -> Self {
        Self::with_parts(dim, tolerance, Arc::new(SystemClock), None)
    }

    #[must_use]
    pub fn with_parts(
        dim: usize,
        tolerance: f32,
        clock: Arc<dyn Clock>,
        log_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            dim,
            tolerance,
            clock,
            log_dir,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Open with durability logs under `dir`, replaying any existing ones.
    pub fn open(dim: usize, tolerance: f32, clock: Arc<dyn Clock>, dir: &Path) -> Result<Self> {
        engram_fs::create_dir_all(dir)?;
        let store = Self::with_parts(dim, tolerance, clock, Some(dir.to_path_buf()));
        store.replay(dir)?;
        Ok(store)
    }

    fn replay(&self, dir: &Path) -> Result<()> {
        let mut inner = self.inner.write();
        let mut replayed = 0usize;
        for file in [NODES_LOG, EDGES_LOG] {
            let path = dir.join(file);
            if !engram_fs::is_file(&path) {
                continue;
            }
            let contents = engram_fs::read_to_string(&path)?;
            for (line_no, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LogLine>(line) {
                    Ok(LogLine::Node(node)) => {
                        inner.nodes.insert(node.id.clone(), node);
                        replayed += 1;
                    }
                    Ok(LogLine::Edge(edge)) => {
                        inner.apply_edge(edge);
                        replayed += 1;
                    }
                    Err(err) => {
                        // A torn trailing line from a crash is tolerated.
                        warn!(
                            target: "engram.graph::replay",
                            file,
                            line = line_no + 1,
                            error = %err,
                            "skipping unreadable log line"
                        );
                    }
                }
            }
        }
        debug!(target: "engram.graph::replay", replayed, "graph log replay complete");
        Ok(())
    }

    fn log(&self, file: &str, line: &LogLine) -> Result<()> {
        let Some(dir) = &self.log_dir else {
            return Ok(());
        };
        let encoded = serde_json::to_string(line)
            .map_err(|err| EngramError::Internal(format!("graph log serialize: {err}")))?;
        engram_fs::append_line(&dir.join(file), &encoded)
    }

    /// Create a node. Non-seed nodes must link to at least enough existing
    /// nodes to form a valid hyperedge.
    pub fn create_node(
        &self,
        id: NodeId,
        embedding: Vec<f32>,
        labels: BTreeSet<String>,
        properties: Metadata,
        link: &NodeLink,
    ) -> Result<Option<EdgeId>> {
        let vid = engram_types::VectorId::from(id.as_str());
        engram_vector::ensure_query(&vid, &embedding, self.dim, self.tolerance)?;

        let now = self.clock.now_ms();
        let node = GraphNode {
            id: id.clone(),
            embedding,
            labels,
            properties,
            created_at: now,
        };

        // Validate everything up front so the commit is all-or-nothing.
        let edge = {
            let inner = self.inner.read();
            if inner.nodes.contains_key(&id) {
                return Err(EngramError::DuplicateId(id.to_string()));
            }
            if link.seed {
                None
            } else {
                if link.link_to.is_empty() {
                    return Err(EngramError::OrphanNode(id.to_string()));
                }
                let mut participants: BTreeSet<NodeId> = BTreeSet::new();
                participants.insert(id.clone());
                for target in &link.link_to {
                    if !inner.nodes.contains_key(target) {
                        return Err(EngramError::NotFound(target.to_string()));
                    }
                    participants.insert(target.clone());
                }
                if participants.len() < MIN_PARTICIPANTS {
                    return Err(EngramError::InvalidHyperedge {
                        got: participants.len(),
                    });
                }
                check_weight(link.weight)?;
                Some(Hyperedge {
                    id: EdgeId::mint(now),
                    participants,
                    kind: link.kind.clone(),
                    weight: link.weight,
                    created_at: now,
                })
            }
        };

        self.log(NODES_LOG, &LogLine::Node(node.clone()))?;
        if let Some(edge) = &edge {
            self.log(EDGES_LOG, &LogLine::Edge(edge.clone()))?;
        }

        let mut inner = self.inner.write();
        inner.nodes.insert(id, node);
        let edge_id = edge.map(|edge| {
            let edge_id = edge.id.clone();
            inner.apply_edge(edge);
            edge_id
        });
        Ok(edge_id)
    }

    /// Create a hyperedge over existing nodes.
    pub fn create_hyperedge(
        &self,
        participants: Vec<NodeId>,
        kind: &str,
        weight: f32,
    ) -> Result<EdgeId> {
        check_weight(weight)?;
        let distinct: BTreeSet<NodeId> = participants.into_iter().collect();
        if distinct.len() < MIN_PARTICIPANTS {
            return Err(EngramError::InvalidHyperedge {
                got: distinct.len(),
            });
        }
        let now = self.clock.now_ms();
        let edge = {
            let inner = self.inner.read();
            for participant in &distinct {
                if !inner.nodes.contains_key(participant) {
                    return Err(EngramError::NotFound(participant.to_string()));
                }
            }
            Hyperedge {
                id: EdgeId::mint(now),
                participants: distinct,
                kind: kind.to_string(),
                weight,
                created_at: now,
            }
        };

        self.log(EDGES_LOG, &LogLine::Edge(edge.clone()))?;
        let edge_id = edge.id.clone();
        self.inner.write().apply_edge(edge);
        Ok(edge_id)
    }

    pub fn node(&self, id: &NodeId) -> Result<GraphNode> {
        self.inner
            .read()
            .nodes
            .get(id)
            .cloned()
            .ok_or_else(|| EngramError::NotFound(id.to_string()))
    }

    /// Hyperedges incident to `id`.
    pub fn incident_edges(&self, id: &NodeId) -> Result<Vec<Hyperedge>> {
        let inner = self.inner.read();
        if !inner.nodes.contains_key(id) {
            return Err(EngramError::NotFound(id.to_string()));
        }
        Ok(inner
            .incidence
            .get(id)
            .map(|edge_ids| {
                edge_ids
                    .iter()
                    .filter_map(|edge_id| inner.edges.get(edge_id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Sum of incident edge weights; the GNN's attention prior.
    pub fn node_importance(&self, id: &NodeId) -> Result<f32> {
        Ok(self
            .incident_edges(id)?
            .iter()
            .map(|edge| edge.weight)
            .sum())
    }

    /// Co-participants within `hop_radius` hyperedge hops, with the hop
    /// count at which each was first reached. The start node is excluded.
    pub fn neighbors(&self, id: &NodeId, hop_radius: u32) -> Result<Vec<(NodeId, u32)>> {
        let inner = self.inner.read();
        if !inner.nodes.contains_key(id) {
            return Err(EngramError::NotFound(id.to_string()));
        }
        let mut seen: BTreeMap<NodeId, u32> = BTreeMap::new();
        seen.insert(id.clone(), 0);
        let mut queue: VecDeque<(NodeId, u32)> = VecDeque::new();
        queue.push_back((id.clone(), 0));
        while let Some((current, hop)) = queue.pop_front() {
            if hop == hop_radius {
                continue;
            }
            let Some(edge_ids) = inner.incidence.get(&current) else {
                continue;
            };
            for edge_id in edge_ids {
                let Some(edge) = inner.edges.get(edge_id) else {
                    continue;
                };
                for participant in &edge.participants {
                    if !seen.contains_key(participant) {
                        seen.insert(participant.clone(), hop + 1);
                        queue.push_back((participant.clone(), hop + 1));
                    }
                }
            }
        }
        seen.remove(id);
        Ok(seen.into_iter().collect())
    }

    /// The connected slice reachable from `seed` within `depth` hops,
    /// including every hyperedge whose participants are all present.
    pub fn subgraph(&self, seed: &NodeId, depth: u32) -> Result<Subgraph> {
        let mut node_ids: BTreeSet<NodeId> = self
            .neighbors(seed, depth)?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        node_ids.insert(seed.clone());

        let inner = self.inner.read();
        let nodes = node_ids
            .iter()
            .filter_map(|id| inner.nodes.get(id).cloned())
            .collect();
        let mut edge_ids: BTreeSet<EdgeId> = BTreeSet::new();
        for id in &node_ids {
            if let Some(incident) = inner.incidence.get(id) {
                edge_ids.extend(incident.iter().cloned());
            }
        }
        let edges = edge_ids
            .iter()
            .filter_map(|edge_id| inner.edges.get(edge_id))
            .filter(|edge| edge.participants.iter().all(|p| node_ids.contains(p)))
            .cloned()
            .collect();
        Ok(Subgraph { nodes, edges })
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.inner.read().edges.len()
    }

    /// Ids of all nodes, for adapter scans.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.inner.read().nodes.keys().cloned().collect()
    }
}

fn check_weight(weight: f32) -> Result<()> {
    if (0.0..=1.0).contains(&weight) {
        Ok(())
    } else {
        Err(EngramError::InvalidWeight {
            value: f64::from(weight),
        })
    }
}
