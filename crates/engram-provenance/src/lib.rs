//! Provenance tracking and adversarial validation.
//!
//! Sources and derivation chains persist as row-per-entry NDJSON under
//! `provenance/`. The L-Score grades a chain (geometric mean of step
//! confidences × mean source relevance × depth penalty); the citation path
//! walks parent links with cycle detection; the shadow validator hunts for
//! evidence *against* a candidate answer and renders a verdict.

pub mod citation;
pub mod lscore;
pub mod shadow;
pub mod store;

pub use citation::{CitationEntry, CitationPath};
pub use lscore::LScore;
pub use shadow::{DocumentClass, EvidenceDoc, ShadowReport, ShadowValidator, Verdict};
pub use store::{
    DerivationOp, DerivationStep, Provenance, ProvenanceInput, ProvenanceStore, Source, SourceInput,
    SourceKind,
};
