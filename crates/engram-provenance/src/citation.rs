//! Citation-graph traversal.
//!
//! Walks `parent_id` links from a provenance record toward its roots,
//! bounded by `max_citation_depth` and guarded against cycles, and emits
//! the ordered sources with per-source contribution `relevance · (1/n)`
//! where `n` is the number of sources on the whole path.

use std::collections::HashSet;

use engram_error::{EngramError, Result};
use engram_types::{LScoreConfig, ProvenanceId, SourceId};
use tracing::warn;

use crate::store::{ProvenanceStore, Source};

/// One emitted source with its share of the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct CitationEntry {
    pub source: Source,
    pub contribution: f64,
    /// Which chain link (0 = the queried record) emitted this source.
    pub link_index: usize,
}

/// Ordered citation path from the queried record toward its roots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CitationPath {
    pub entries: Vec<CitationEntry>,
    /// True when traversal stopped at the depth cap rather than a root.
    pub truncated: bool,
}

/// Follow parent links and collect contributing sources.
pub fn citation_path(
    store: &ProvenanceStore,
    start: &ProvenanceId,
    config: &LScoreConfig,
) -> Result<CitationPath> {
    let mut visited: HashSet<ProvenanceId> = HashSet::new();
    let mut ordered: Vec<(usize, Source)> = Vec::new();
    let mut seen_sources: HashSet<SourceId> = HashSet::new();
    let mut current = Some(start.clone());
    let mut link_index = 0usize;
    let mut truncated = false;

    while let Some(id) = current {
        if link_index >= config.max_citation_depth {
            truncated = true;
            break;
        }
        if !visited.insert(id.clone()) {
            warn!(
                target: "engram.provenance::citation",
                id = %id,
                "cycle detected in provenance parents, stopping traversal"
            );
            break;
        }
        let prov = store.provenance(&id)?;
        for source_id in &prov.source_ids {
            if seen_sources.insert(source_id.clone()) {
                ordered.push((link_index, store.source(source_id)?));
            }
        }
        current = prov.parent_id.clone();
        link_index += 1;
    }

    let n = ordered.len().max(1) as f64;
    let entries = ordered
        .into_iter()
        .map(|(link_index, source)| CitationEntry {
            contribution: source.relevance / n,
            source,
            link_index,
        })
        .collect();
    Ok(CitationPath { entries, truncated })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DerivationOp, DerivationStep, ProvenanceInput, SourceInput};

    fn step(sources: Vec<SourceId>) -> DerivationStep {
        DerivationStep {
            description: "derive".to_string(),
            source_ids: sources,
            operation: DerivationOp::Extraction,
            confidence: 0.9,
            assumptions: Vec::new(),
        }
    }

    fn lineage(depth: usize) -> (ProvenanceStore, Vec<ProvenanceId>) {
        let store = ProvenanceStore::new();
        let mut ids = Vec::new();
        let mut parent: Option<ProvenanceId> = None;
        for level in 0..depth {
            let sid = store
                .store_source(SourceInput::document(
                    &format!("doc{level}"),
                    0.5 + level as f64 * 0.1,
                ))
                .unwrap();
            let pid = store
                .store_provenance(ProvenanceInput {
                    source_ids: vec![sid.clone()],
                    steps: vec![step(vec![sid])],
                    parent_id: parent.clone(),
                    domain: None,
                })
                .unwrap();
            parent = Some(pid.clone());
            ids.push(pid);
        }
        (store, ids)
    }

    #[test]
    fn path_walks_from_leaf_to_root() {
        let (store, ids) = lineage(3);
        let leaf = ids.last().unwrap();
        let path = citation_path(&store, leaf, &LScoreConfig::default()).unwrap();
        assert_eq!(path.entries.len(), 3);
        assert!(!path.truncated);
        assert_eq!(path.entries[0].link_index, 0);
        assert_eq!(path.entries[0].source.title, "doc2");
        assert_eq!(path.entries[2].source.title, "doc0");
    }

    #[test]
    fn contributions_split_relevance_over_path_size() {
        let (store, ids) = lineage(2);
        let path = citation_path(&store, ids.last().unwrap(), &LScoreConfig::default()).unwrap();
        // doc1 relevance 0.6, doc0 relevance 0.5, n = 2.
        assert!((path.entries[0].contribution - 0.3).abs() < 1e-9);
        assert!((path.entries[1].contribution - 0.25).abs() < 1e-9);
    }

    #[test]
    fn depth_cap_truncates() {
        let (store, ids) = lineage(6);
        let mut config = LScoreConfig::default();
        config.max_citation_depth = 4;
        let path = citation_path(&store, ids.last().unwrap(), &config).unwrap();
        assert_eq!(path.entries.len(), 4);
        assert!(path.truncated);
    }

    #[test]
    fn shared_sources_are_emitted_once() {
        let store = ProvenanceStore::new();
        let sid = store.store_source(SourceInput::document("shared", 0.9)).unwrap();
        let root = store
            .store_provenance(ProvenanceInput {
                source_ids: vec![sid.clone()],
                steps: vec![step(vec![sid.clone()])],
                parent_id: None,
                domain: None,
            })
            .unwrap();
        let leaf = store
            .store_provenance(ProvenanceInput {
                source_ids: vec![sid.clone()],
                steps: vec![step(vec![sid])],
                parent_id: Some(root),
                domain: None,
            })
            .unwrap();
        let path = citation_path(&store, &leaf, &LScoreConfig::default()).unwrap();
        assert_eq!(path.entries.len(), 1);
        assert!((path.entries[0].contribution - 0.9).abs() < 1e-9);
    }
}
