//! Shadow validator: adversarial retrieval against a candidate answer.
//!
//! Retrieves evidence *outside* the conclusion's embedding cluster,
//! classifies documents by type, weights them by credibility, and renders a
//! verdict with a confidence band derived from sample size and credibility
//! variance. Evidence shortages downgrade to `InsufficientEvidence` rather
//! than raising.

use engram_error::Result;
use engram_types::{DistanceMetric, Metadata, MetadataValue};
use engram_vector::{SearchOptions, VectorStore};
use tracing::debug;

/// Document classes ordered by credibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentClass {
    Academic,
    Official,
    Blog,
    Anecdotal,
}

impl DocumentClass {
    /// Credibility weight applied to this class's testimony.
    #[must_use]
    pub fn credibility(self) -> f64 {
        match self {
            Self::Academic => 1.0,
            Self::Official => 0.8,
            Self::Blog => 0.4,
            Self::Anecdotal => 0.2,
        }
    }

    #[must_use]
    pub fn parse(label: &str) -> Self {
        match label {
            "academic" => Self::Academic,
            "official" => Self::Official,
            "blog" => Self::Blog,
            _ => Self::Anecdotal,
        }
    }
}

/// One retrieved piece of evidence.
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceDoc {
    pub id: String,
    pub class: DocumentClass,
    /// Stance toward the candidate: −1 contradicts, +1 supports.
    pub stance: f64,
    /// Similarity to the conclusion cluster at retrieval time.
    pub similarity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No meaningful refuting evidence found.
    Innocent,
    /// Credible contradicting evidence dominates.
    Guilty,
    InsufficientEvidence,
}

/// Full validation report.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowReport {
    pub verdict: Verdict,
    /// Credibility-weighted refutation mass in [0, 1].
    pub refutation_strength: f64,
    /// `(low, high)` band around the refutation strength.
    pub confidence_band: (f64, f64),
    pub evidence: Vec<EvidenceDoc>,
}

pub struct ShadowValidator {
    /// Fewer pieces than this downgrades to `InsufficientEvidence`.
    pub min_evidence: usize,
    /// Refutation strength at or above this renders `Guilty`.
    pub guilty_threshold: f64,
    /// Refutation strength at or below this renders `Innocent`.
    pub innocent_threshold: f64,
    /// Hits more similar than this to the conclusion are inside the
    /// cluster and excluded (the adversarial `NOT` filter).
    pub cluster_similarity_cutoff: f32,
}

impl Default for ShadowValidator {
    fn default() -> Self {
        Self {
            min_evidence: 3,
            guilty_threshold: 0.6,
            innocent_threshold: 0.3,
            cluster_similarity_cutoff: 0.6,
        }
    }
}

impl ShadowValidator {
    /// Retrieve contra-evidence for `conclusion` from the vector store.
    ///
    /// Documents carry their class under metadata key `"class"` and an
    /// optional explicit stance under `"stance"`; without one, a document
    /// retrieved by the adversarial filter is presumed moderately contra.
    pub fn retrieve_contra(
        &self,
        store: &VectorStore,
        conclusion: &[f32],
        limit: usize,
    ) -> Result<Vec<EvidenceDoc>> {
        // Rank the whole corpus, then keep the hits *outside* the
        // conclusion's cluster.
        let hits = store.search(
            conclusion,
            store.count(),
            &SearchOptions {
                metric: DistanceMetric::Cosine,
                filter: None,
            },
        )?;
        let contra: Vec<EvidenceDoc> = hits
            .into_iter()
            .filter(|hit| hit.score < self.cluster_similarity_cutoff)
            .map(|hit| EvidenceDoc {
                id: hit.id.to_string(),
                class: class_of(&hit.metadata),
                stance: stance_of(&hit.metadata),
                similarity: hit.score,
            })
            .take(limit)
            .collect();
        debug!(
            target: "engram.provenance::shadow",
            retrieved = contra.len(),
            "adversarial retrieval complete"
        );
        Ok(contra)
    }

    /// Weigh the evidence and render a verdict.
    #[must_use]
    pub fn render_verdict(&self, evidence: Vec<EvidenceDoc>) -> ShadowReport {
        if evidence.len() < self.min_evidence {
            return ShadowReport {
                verdict: Verdict::InsufficientEvidence,
                refutation_strength: 0.0,
                confidence_band: (0.0, 1.0),
                evidence,
            };
        }

        let weights: Vec<f64> = evidence.iter().map(|doc| doc.class.credibility()).collect();
        let total_weight: f64 = weights.iter().sum();
        let refutation_strength = evidence
            .iter()
            .zip(weights.iter())
            .map(|(doc, w)| w * (-doc.stance).max(0.0))
            .sum::<f64>()
            / total_weight;

        // Band width shrinks with sample size, grows with credibility
        // spread.
        let n = evidence.len() as f64;
        let mean_w = total_weight / n;
        let var_w = weights.iter().map(|w| (w - mean_w) * (w - mean_w)).sum::<f64>() / n;
        let half_width = (0.5 + var_w.sqrt()) / n.sqrt();
        let band = (
            (refutation_strength - half_width).max(0.0),
            (refutation_strength + half_width).min(1.0),
        );

        let verdict = if refutation_strength >= self.guilty_threshold {
            Verdict::Guilty
        } else if refutation_strength <= self.innocent_threshold {
            Verdict::Innocent
        } else {
            Verdict::InsufficientEvidence
        };

        ShadowReport {
            verdict,
            refutation_strength,
            confidence_band: band,
            evidence,
        }
    }

    /// End-to-end: adversarial retrieval then verdict.
    pub fn validate(
        &self,
        store: &VectorStore,
        conclusion: &[f32],
        limit: usize,
    ) -> Result<ShadowReport> {
        let evidence = self.retrieve_contra(store, conclusion, limit)?;
        Ok(self.render_verdict(evidence))
    }
}

fn class_of(metadata: &Metadata) -> DocumentClass {
    match metadata.get("class") {
        Some(MetadataValue::Text(label)) => DocumentClass::parse(label),
        _ => DocumentClass::Anecdotal,
    }
}

fn stance_of(metadata: &Metadata) -> f64 {
    match metadata.get("stance") {
        Some(MetadataValue::Float(stance)) => stance.clamp(-1.0, 1.0),
        // Retrieved by the NOT-cluster filter: presumed moderately contra.
        _ => -0.5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_types::{NORMALIZATION_TOLERANCE, VectorId};

    fn doc(class: DocumentClass, stance: f64) -> EvidenceDoc {
        EvidenceDoc {
            id: format!("{class:?}-{stance}"),
            class,
            stance,
            similarity: 0.1,
        }
    }

    #[test]
    fn evidence_shortage_downgrades_not_raises() {
        let validator = ShadowValidator::default();
        let report = validator.render_verdict(vec![doc(DocumentClass::Academic, -1.0)]);
        assert_eq!(report.verdict, Verdict::InsufficientEvidence);
        assert_eq!(report.confidence_band, (0.0, 1.0));
    }

    #[test]
    fn credible_contradiction_is_guilty() {
        let validator = ShadowValidator::default();
        let report = validator.render_verdict(vec![
            doc(DocumentClass::Academic, -0.9),
            doc(DocumentClass::Official, -0.8),
            doc(DocumentClass::Academic, -0.7),
        ]);
        assert_eq!(report.verdict, Verdict::Guilty);
        assert!(report.refutation_strength > 0.6);
        assert!(report.confidence_band.0 <= report.refutation_strength);
        assert!(report.confidence_band.1 >= report.refutation_strength);
    }

    #[test]
    fn anecdotal_noise_cannot_convict() {
        let validator = ShadowValidator::default();
        let report = validator.render_verdict(vec![
            doc(DocumentClass::Anecdotal, -1.0),
            doc(DocumentClass::Anecdotal, -1.0),
            doc(DocumentClass::Academic, 0.9),
            doc(DocumentClass::Academic, 0.8),
        ]);
        // Academic support outweighs anecdotal refutation.
        assert_eq!(report.verdict, Verdict::Innocent);
    }

    #[test]
    fn supportive_evidence_is_innocent() {
        let validator = ShadowValidator::default();
        let report = validator.render_verdict(vec![
            doc(DocumentClass::Academic, 0.9),
            doc(DocumentClass::Blog, 0.5),
            doc(DocumentClass::Official, 0.7),
        ]);
        assert_eq!(report.verdict, Verdict::Innocent);
        assert_eq!(report.refutation_strength, 0.0);
    }

    #[test]
    fn band_tightens_with_more_evidence() {
        let validator = ShadowValidator::default();
        let few = validator.render_verdict(vec![
            doc(DocumentClass::Blog, -0.5),
            doc(DocumentClass::Blog, -0.5),
            doc(DocumentClass::Blog, -0.5),
        ]);
        let many = validator.render_verdict(vec![doc(DocumentClass::Blog, -0.5); 12]);
        let few_width = few.confidence_band.1 - few.confidence_band.0;
        let many_width = many.confidence_band.1 - many.confidence_band.0;
        assert!(many_width < few_width);
    }

    #[test]
    fn adversarial_filter_excludes_the_conclusion_cluster() {
        let store = VectorStore::new(4, NORMALIZATION_TOLERANCE);
        let mut contra_meta = Metadata::new();
        contra_meta.insert("class".into(), "academic".into());
        contra_meta.insert("stance".into(), MetadataValue::Float(-0.9));
        // In-cluster doc (same direction as the conclusion).
        store
            .insert(VectorId::from("close"), vec![1.0, 0.0, 0.0, 0.0], Metadata::new())
            .unwrap();
        // Out-of-cluster docs.
        store
            .insert(VectorId::from("far-1"), vec![0.0, 1.0, 0.0, 0.0], contra_meta.clone())
            .unwrap();
        store
            .insert(VectorId::from("far-2"), vec![0.0, 0.0, 1.0, 0.0], contra_meta)
            .unwrap();

        let validator = ShadowValidator::default();
        let evidence = validator
            .retrieve_contra(&store, &[1.0, 0.0, 0.0, 0.0], 10)
            .unwrap();
        assert_eq!(evidence.len(), 2);
        assert!(evidence.iter().all(|doc| doc.id.starts_with("far")));
        assert!(evidence.iter().all(|doc| doc.class == DocumentClass::Academic));
    }
}
