//! engramdb — a memory and reasoning substrate.
//!
//! One [`Engram`] handle wires the whole substrate together: the
//! dimension-checked vector store with its compression lifecycle, the
//! hypergraph, the GNN enhancer, provenance and pattern/causal memory, the
//! Sona reasoning bank, and quad-fusion unified search. Construct once at
//! program start and hand references down; nothing here is global.

use std::sync::Arc;

use engram_compress::{CompressionManager, HeatTracker, TierCodecs};
use engram_error::Result;
use engram_fusion::{
    CircuitBreaker, FusionOptions, GraphAdapter, MemoryAdapter, PatternAdapter, SearchEnvelope,
    SourceAdapter, UnifiedSearch, VectorAdapter,
};
use engram_gnn::GnnEnhancer;
use engram_graph::GraphStore;
use engram_index::HnswIndex;
use engram_observability::{EventBus, MetricsRegistry};
use engram_provenance::ProvenanceStore;
use engram_reason::{CausalMemory, PatternStore, ReasoningBank};
use engram_types::{Clock, DistanceMetric, EngramConfig, SystemClock};
use engram_vector::{VectorIndex, VectorStore};
use tracing::info;

pub use engram_error::EngramError;
pub use engram_types::{
    CompressionTier, EngramConfig as Config, Metadata, MetadataValue, NodeId, VectorId,
};

/// The assembled substrate.
pub struct Engram {
    pub config: EngramConfig,
    pub clock: Arc<dyn Clock>,
    pub bus: EventBus,
    pub metrics: Arc<MetricsRegistry>,
    pub store: Arc<VectorStore>,
    pub heat: Arc<HeatTracker>,
    pub codecs: Arc<TierCodecs>,
    pub manager: Arc<CompressionManager>,
    pub graph: Arc<GraphStore>,
    pub patterns: Arc<PatternStore>,
    pub causal: Arc<CausalMemory>,
    pub bank: Arc<ReasoningBank>,
    pub provenance: Arc<ProvenanceStore>,
    pub enhancer: Arc<GnnEnhancer>,
    pub gnn_breaker: Arc<CircuitBreaker>,
    pub search: UnifiedSearch,
}

impl Engram {
    /// Fully in-memory substrate (tests, embedding in other processes).
    pub fn in_memory(config: EngramConfig) -> Result<Self> {
        Self::build(config, Arc::new(SystemClock), false)
    }

    /// In-memory substrate on an injected clock.
    pub fn with_clock(config: EngramConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::build(config, clock, false)
    }

    /// Open against the configured data directory, replaying all persisted
    /// state (records, codebooks, graph logs, weights, provenance rows).
    pub fn open(config: EngramConfig) -> Result<Self> {
        Self::build(config, Arc::new(SystemClock), true)
    }

    fn build(config: EngramConfig, clock: Arc<dyn Clock>, persistent: bool) -> Result<Self> {
        let bus = EventBus::new(config.bus_capacity);
        let metrics = Arc::new(MetricsRegistry::new());
        let heat = Arc::new(HeatTracker::new(config.heat.clone(), clock.clone()));
        let codecs = Arc::new(TierCodecs::new(config.dim, config.compression.clone()));

        let data_dir = persistent.then(|| config.data_dir.clone());
        if let Some(dir) = &data_dir {
            engram_fs::create_dir_all(dir)?;
        }

        let index: Option<Arc<dyn VectorIndex>> = config.hnsw.enabled.then(|| {
            Arc::new(HnswIndex::new(DistanceMetric::Cosine, &config.hnsw)) as Arc<dyn VectorIndex>
        });
        let store = Arc::new(VectorStore::with_parts(
            config.dim,
            config.normalization_tolerance,
            codecs.clone(),
            index,
            heat.clone(),
            clock.clone(),
        ));

        let codebook_dir = data_dir.as_ref().map(|dir| dir.join("codebooks"));
        if let Some(dir) = &codebook_dir {
            engram_fs::create_dir_all(dir)?;
            let _ = codecs.load_codebooks(dir)?;
        }
        let manager = Arc::new(CompressionManager::new(
            store.clone(),
            codecs.clone(),
            heat.clone(),
            config.compression.clone(),
            clock.clone(),
            bus.clone(),
            codebook_dir,
        ));

        let graph = Arc::new(match &data_dir {
            Some(dir) => GraphStore::open(
                config.dim,
                config.normalization_tolerance,
                clock.clone(),
                dir,
            )?,
            None => GraphStore::with_parts(
                config.dim,
                config.normalization_tolerance,
                clock.clone(),
                None,
            ),
        });

        let reasoning_dir = data_dir.as_ref().map(|dir| dir.join("reasoning"));
        let patterns = Arc::new(match &reasoning_dir {
            Some(dir) => PatternStore::open(
                config.dim,
                config.normalization_tolerance,
                clock.clone(),
                dir,
            )?,
            None => PatternStore::with_parts(
                config.dim,
                config.normalization_tolerance,
                clock.clone(),
                None,
            ),
        });
        let causal = Arc::new(match &reasoning_dir {
            Some(dir) => CausalMemory::open(clock.clone(), dir)?,
            None => CausalMemory::with_parts(clock.clone(), None),
        });

        let bank = Arc::new(match &data_dir {
            Some(dir) => ReasoningBank::open(
                config.sona.clone(),
                clock.clone(),
                &dir.join("reasoning-bank"),
                Some(bus.clone()),
            )?,
            None => ReasoningBank::with_parts(
                config.sona.clone(),
                clock.clone(),
                None,
                Some(bus.clone()),
            ),
        });

        let provenance = Arc::new(match &data_dir {
            Some(dir) => ProvenanceStore::open(clock.clone(), &dir.join("provenance"))?,
            None => ProvenanceStore::with_parts(clock.clone(), None),
        });

        let enhancer = Arc::new(GnnEnhancer::new(
            config.dim,
            config.gnn.clone(),
            clock.clone(),
            data_dir.as_ref().map(|dir| dir.join("gnn")),
        ));
        let gnn_breaker = Arc::new(CircuitBreaker::new(
            "gnn-enhance",
            config.gnn.breaker_threshold,
            config.gnn.breaker_reset_ms,
            clock.clone(),
        ));

        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
            Arc::new(VectorAdapter::new(
                store.clone(),
                Some(enhancer.clone()),
                gnn_breaker.clone(),
            )),
            Arc::new(GraphAdapter::new(graph.clone())),
            Arc::new(MemoryAdapter::new(patterns.clone())),
            Arc::new(PatternAdapter::new(bank.clone())),
        ];
        let search = UnifiedSearch::new(adapters, Some(bank.clone()), Some(bus.clone()));

        info!(
            target: "engram::lifecycle",
            dim = config.dim,
            persistent,
            hnsw = config.hnsw.enabled,
            "substrate assembled"
        );
        Ok(Self {
            config,
            clock,
            bus,
            metrics,
            store,
            heat,
            codecs,
            manager,
            graph,
            patterns,
            causal,
            bank,
            provenance,
            enhancer,
            gnn_breaker,
            search,
        })
    }

    /// Start the heat-driven compression scheduler on its configured
    /// interval; dropping the guard stops it.
    #[must_use]
    pub fn start_scheduler(&self) -> engram_compress::SchedulerGuard {
        engram_compress::SchedulerGuard::start(
            self.manager.clone(),
            std::time::Duration::from_millis(self.config.heat.scheduler_interval_ms),
        )
    }

    /// Quad-fusion search across all four sources.
    pub fn unified_search(
        &self,
        embedding: &[f32],
        options: &FusionOptions,
    ) -> Result<SearchEnvelope> {
        self.search.search(embedding, options)
    }

    /// Flush all durable state (records, weights, bank) to the data dir.
    pub fn persist(&self) -> Result<()> {
        let dir = &self.config.data_dir;
        engram_fs::create_dir_all(dir)?;
        let _ = engram_vector::persist::save_all(&self.store, &dir.join("vectors"))?;
        self.bank.save()?;
        self.enhancer.save_weights()?;
        Ok(())
    }

    /// Reload vector records persisted by [`Engram::persist`].
    pub fn load_vectors(&self) -> Result<usize> {
        engram_vector::persist::load_all(&self.store, &self.config.data_dir.join("vectors"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_substrate_assembles() {
        let mut config = EngramConfig::default();
        config.dim = 16;
        let engram = Engram::in_memory(config).unwrap();
        assert_eq!(engram.store.count(), 0);
        assert_eq!(engram.graph.node_count(), 0);
        assert!(engram.patterns.is_empty());
    }
}
