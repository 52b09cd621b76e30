//! Source and provenance stores.
//!
//! Ids follow `{prefix}_{epoch_ms}_{rand}` and are re-validated by the type
//! guard whenever they re-enter from the wire or from disk. Durability is
//! NDJSON row-per-entry logs (`sources.db`, `provenance.db`) replayed at
//! open.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use engram_error::{EngramError, Result};
use engram_types::{Clock, ProvenanceId, SourceId, SystemClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

const SOURCES_DB: &str = "sources.db";
const PROVENANCE_DB: &str = "provenance.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Document,
    Conversation,
    Experiment,
    Simulation,
    ExternalApi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivationOp {
    Extraction,
    Synthesis,
    Inference,
    Transformation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub kind: SourceKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub relevance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivationStep {
    pub description: String,
    pub source_ids: Vec<SourceId>,
    pub operation: DerivationOp,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assumptions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub id: ProvenanceId,
    pub source_ids: Vec<SourceId>,
    /// Non-empty, ordered derivation path.
    pub steps: Vec<DerivationStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ProvenanceId>,
    /// Always `steps.len()`.
    pub depth: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub created_at: u64,
}

/// Input for [`ProvenanceStore::store_source`].
#[derive(Debug, Clone)]
pub struct SourceInput {
    pub kind: SourceKind,
    pub title: String,
    pub authors: Vec<String>,
    pub url: Option<String>,
    pub published_date: Option<String>,
    pub location: Option<String>,
    pub relevance: f64,
    pub embedding: Option<Vec<f32>>,
}

impl SourceInput {
    #[must_use]
    pub fn document(title: &str, relevance: f64) -> Self {
        Self {
            kind: SourceKind::Document,
            title: title.to_string(),
            authors: Vec::new(),
            url: None,
            published_date: None,
            location: None,
            relevance,
            embedding: None,
        }
    }
}

/// Input for [`ProvenanceStore::store_provenance`].
#[derive(Debug, Clone)]
pub struct ProvenanceInput {
    pub source_ids: Vec<SourceId>,
    pub steps: Vec<DerivationStep>,
    pub parent_id: Option<ProvenanceId>,
    pub domain: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Row {
    Source(Source),
    Provenance(Provenance),
}

#[derive(Default)]
struct Inner {
    sources: HashMap<SourceId, Source>,
    provenance: HashMap<ProvenanceId, Provenance>,
}

pub struct ProvenanceStore {
    clock: Arc<dyn Clock>,
    data_dir: Option<PathBuf>,
    inner: Mutex<Inner>,
}

impl ProvenanceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(Arc::new(SystemClock), None)
    }

    #[must_use]
    pub fn with_parts(clock: Arc<dyn Clock>, data_dir: Option<PathBuf>) -> Self {
        Self {
            clock,
            data_dir,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Open with persistence under `dir`, replaying existing rows.
    pub fn open(clock: Arc<dyn Clock>, dir: &Path) -> Result<Self> {
        engram_fs::create_dir_all(dir)?;
        let store = Self::with_parts(clock, Some(dir.to_path_buf()));
        store.replay(dir)?;
        Ok(store)
    }

    fn replay(&self, dir: &Path) -> Result<()> {
        let mut inner = self.inner.lock();
        for (file, want_source) in [(SOURCES_DB, true), (PROVENANCE_DB, false)] {
            let path = dir.join(file);
            if !engram_fs::is_file(&path) {
                continue;
            }
            let contents = engram_fs::read_to_string(&path)?;
            for (line_no, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let parsed: std::result::Result<Row, _> = if want_source {
                    serde_json::from_str::<Source>(line).map(Row::Source)
                } else {
                    serde_json::from_str::<Provenance>(line).map(Row::Provenance)
                };
                match parsed {
                    Ok(Row::Source(source)) => {
                        // Type guard on re-entry.
                        if SourceId::parse(source.id.as_str()).is_ok() {
                            inner.sources.insert(source.id.clone(), source);
                        }
                    }
                    Ok(Row::Provenance(prov)) => {
                        if ProvenanceId::parse(prov.id.as_str()).is_ok() {
                            inner.provenance.insert(prov.id.clone(), prov);
                        }
                    }
                    Err(err) => {
                        warn!(
                            target: "engram.provenance::store",
                            file,
                            line = line_no + 1,
                            error = %err,
                            "skipping unreadable provenance row"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn persist_source(&self, source: &Source) -> Result<()> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let line = serde_json::to_string(source)
            .map_err(|err| EngramError::Internal(format!("source serialize: {err}")))?;
        engram_fs::append_line(&dir.join(SOURCES_DB), &line)
    }

    fn persist_provenance(&self, prov: &Provenance) -> Result<()> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let line = serde_json::to_string(prov)
            .map_err(|err| EngramError::Internal(format!("provenance serialize: {err}")))?;
        engram_fs::append_line(&dir.join(PROVENANCE_DB), &line)
    }

    pub fn store_source(&self, input: SourceInput) -> Result<SourceId> {
        if !(0.0..=1.0).contains(&input.relevance) {
            return Err(EngramError::ProvenanceValidation(format!(
                "source relevance {} outside [0, 1]",
                input.relevance
            )));
        }
        if input.title.trim().is_empty() {
            return Err(EngramError::ProvenanceValidation(
                "source title must be non-empty".to_string(),
            ));
        }
        let now = self.clock.now_ms();
        let source = Source {
            id: SourceId::mint(now),
            kind: input.kind,
            title: input.title,
            authors: input.authors,
            url: input.url,
            published_date: input.published_date,
            location: input.location,
            relevance: input.relevance,
            embedding: input.embedding,
            created_at: now,
        };
        self.persist_source(&source)?;
        let id = source.id.clone();
        self.inner.lock().sources.insert(id.clone(), source);
        Ok(id)
    }

    pub fn store_provenance(&self, input: ProvenanceInput) -> Result<ProvenanceId> {
        if input.source_ids.is_empty() {
            return Err(EngramError::ProvenanceValidation(
                "provenance requires at least one source".to_string(),
            ));
        }
        if input.steps.is_empty() {
            return Err(EngramError::ProvenanceValidation(
                "provenance requires at least one derivation step".to_string(),
            ));
        }
        for step in &input.steps {
            if !(step.confidence > 0.0 && step.confidence <= 1.0) {
                return Err(EngramError::ProvenanceValidation(format!(
                    "step confidence {} outside (0, 1]",
                    step.confidence
                )));
            }
        }
        let now = self.clock.now_ms();
        let prov = {
            let inner = self.inner.lock();
            for source_id in &input.source_ids {
                if !inner.sources.contains_key(source_id) {
                    return Err(EngramError::NotFound(source_id.to_string()));
                }
            }
            if let Some(parent) = &input.parent_id {
                if !inner.provenance.contains_key(parent) {
                    return Err(EngramError::NotFound(parent.to_string()));
                }
            }
            Provenance {
                id: ProvenanceId::mint(now),
                depth: input.steps.len(),
                source_ids: input.source_ids,
                steps: input.steps,
                parent_id: input.parent_id,
                domain: input.domain,
                created_at: now,
            }
        };
        self.persist_provenance(&prov)?;
        let id = prov.id.clone();
        self.inner.lock().provenance.insert(id.clone(), prov);
        Ok(id)
    }

    pub fn source(&self, id: &SourceId) -> Result<Source> {
        self.inner
            .lock()
            .sources
            .get(id)
            .cloned()
            .ok_or_else(|| EngramError::NotFound(id.to_string()))
    }

    pub fn provenance(&self, id: &ProvenanceId) -> Result<Provenance> {
        self.inner
            .lock()
            .provenance
            .get(id)
            .cloned()
            .ok_or_else(|| EngramError::NotFound(id.to_string()))
    }

    /// Wire-facing fetch: the raw string passes the id type guard first.
    pub fn provenance_by_str(&self, raw: &str) -> Result<Provenance> {
        let id = ProvenanceId::parse(raw)?;
        self.provenance(&id)
    }

    /// Sources referenced by a provenance record, in declaration order.
    pub fn sources_of(&self, prov: &Provenance) -> Result<Vec<Source>> {
        prov.source_ids.iter().map(|id| self.source(id)).collect()
    }

    #[must_use]
    pub fn source_count(&self) -> usize {
        self.inner.lock().sources.len()
    }

    #[must_use]
    pub fn provenance_count(&self) -> usize {
        self.inner.lock().provenance.len()
    }
}

impl Default for ProvenanceStore {
    fn default() -> Self {
        Self::new()
    }
}
