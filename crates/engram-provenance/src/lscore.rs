//! L-Score: derived quality of a provenance chain.
//!
//! `L = G · A · depth_factor` clipped to [0, 1], where `G` is the geometric
//! mean of step confidences, `A` the arithmetic mean of source relevances,
//! and `depth_factor = 1/(1 + λ·max(0, n − depth_soft_limit))`.

use engram_error::{EngramError, Result};
use engram_observability::{EventBus, EventStatus};
use engram_types::{LScoreConfig, Metadata, MetadataValue};
use tracing::debug;

use crate::store::{Provenance, Source};

/// A computed L-Score with its factors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LScore {
    pub value: f64,
    pub geometric_confidence: f64,
    pub mean_relevance: f64,
    pub depth_factor: f64,
}

/// Compute the L-Score of `prov` given its resolved `sources`.
pub fn compute(prov: &Provenance, sources: &[Source], config: &LScoreConfig) -> Result<LScore> {
    if prov.steps.is_empty() {
        return Err(EngramError::ProvenanceValidation(
            "cannot score an empty chain".to_string(),
        ));
    }
    if sources.is_empty() {
        return Err(EngramError::ProvenanceValidation(
            "cannot score a chain with no sources".to_string(),
        ));
    }
    let n = prov.steps.len();
    let mut log_sum = 0.0f64;
    for step in &prov.steps {
        if !(step.confidence > 0.0 && step.confidence <= 1.0) {
            return Err(EngramError::ProvenanceValidation(format!(
                "step confidence {} outside (0, 1]",
                step.confidence
            )));
        }
        log_sum += step.confidence.ln();
    }
    let geometric_confidence = (log_sum / n as f64).exp();
    let mean_relevance =
        sources.iter().map(|s| s.relevance).sum::<f64>() / sources.len() as f64;
    let excess = n.saturating_sub(config.depth_soft_limit) as f64;
    let depth_factor = 1.0 / (1.0 + config.lambda * excess);
    let value = (geometric_confidence * mean_relevance * depth_factor).clamp(0.0, 1.0);
    Ok(LScore {
        value,
        geometric_confidence,
        mean_relevance,
        depth_factor,
    })
}

/// Threshold for `domain`, falling back to the default.
#[must_use]
pub fn threshold_for(domain: &str, config: &LScoreConfig) -> f64 {
    config
        .domain_thresholds
        .get(domain)
        .copied()
        .unwrap_or(config.default_threshold)
}

/// Accept or reject a score against the per-domain threshold table,
/// emitting an `lscore_rejection` event on the bus when it fails.
pub fn validate(
    score: LScore,
    domain: &str,
    config: &LScoreConfig,
    bus: Option<&EventBus>,
    now_ms: u64,
) -> Result<LScore> {
    let threshold = threshold_for(domain, config);
    if score.value >= threshold {
        debug!(
            target: "engram.provenance::lscore",
            value = score.value,
            domain,
            "l-score accepted"
        );
        return Ok(score);
    }
    if let Some(bus) = bus {
        let mut metadata = Metadata::new();
        metadata.insert("domain".into(), MetadataValue::Text(domain.to_string()));
        metadata.insert("score".into(), MetadataValue::Float(score.value));
        metadata.insert("threshold".into(), MetadataValue::Float(threshold));
        bus.emit_now(now_ms, "provenance", "lscore_rejection", EventStatus::Degraded, metadata);
    }
    Err(EngramError::LScoreRejection {
        score: score.value,
        threshold,
        domain: domain.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DerivationOp, DerivationStep, ProvenanceStore, SourceInput};
    use engram_types::{ProvenanceId, SourceId};

    fn chain(confidences: &[f64], relevances: &[f64]) -> (Provenance, Vec<Source>) {
        let store = ProvenanceStore::new();
        let sources: Vec<SourceId> = relevances
            .iter()
            .map(|&r| store.store_source(SourceInput::document("s", r)).unwrap())
            .collect();
        let steps: Vec<DerivationStep> = confidences
            .iter()
            .map(|&c| DerivationStep {
                description: "step".to_string(),
                source_ids: sources.clone(),
                operation: DerivationOp::Synthesis,
                confidence: c,
                assumptions: Vec::new(),
            })
            .collect();
        let prov = Provenance {
            id: ProvenanceId::mint(1),
            source_ids: sources.clone(),
            depth: steps.len(),
            steps,
            parent_id: None,
            domain: None,
            created_at: 1,
        };
        let resolved = sources.iter().map(|id| store.source(id).unwrap()).collect();
        (prov, resolved)
    }

    #[test]
    fn two_step_chain_matches_the_worked_example() {
        let (prov, sources) = chain(&[0.9, 0.8], &[0.8, 0.7]);
        let score = compute(&prov, &sources, &LScoreConfig::default()).unwrap();
        assert!((score.geometric_confidence - 0.8485).abs() < 1e-3);
        assert!((score.mean_relevance - 0.75).abs() < 1e-9);
        assert_eq!(score.depth_factor, 1.0);
        assert!((score.value - 0.6364).abs() < 1e-3);
        // Accepted at the default 0.6 threshold.
        validate(score, "default", &LScoreConfig::default(), None, 0).unwrap();
    }

    #[test]
    fn depth_eight_chain_is_rejected() {
        // Same head confidences, six more perfect steps: G unchanged.
        let (prov, sources) = chain(&[0.9, 0.8, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0], &[0.8, 0.7]);
        let config = LScoreConfig::default();
        let score = compute(&prov, &sources, &config).unwrap();
        assert!((score.depth_factor - 1.0 / 1.5).abs() < 1e-9);
        assert!((score.value - 0.424).abs() < 1e-3);
        let err = validate(score, "default", &config, None, 0).unwrap_err();
        assert!(matches!(err, EngramError::LScoreRejection { .. }));
    }

    #[test]
    fn scores_are_always_in_unit_interval() {
        for confs in [&[0.01, 0.01][..], &[1.0][..], &[0.5, 0.9, 0.2][..]] {
            let (prov, sources) = chain(confs, &[1.0]);
            let score = compute(&prov, &sources, &LScoreConfig::default()).unwrap();
            assert!((0.0..=1.0).contains(&score.value));
        }
    }

    #[test]
    fn domain_override_beats_the_default_threshold() {
        let mut config = LScoreConfig::default();
        config.domain_thresholds.insert("strict".to_string(), 0.9);
        let (prov, sources) = chain(&[0.9, 0.8], &[0.8, 0.7]);
        let score = compute(&prov, &sources, &config).unwrap();
        // 0.636 passes "default" but fails "strict".
        assert!(validate(score, "default", &config, None, 0).is_ok());
        assert!(validate(score, "strict", &config, None, 0).is_err());
    }

    #[test]
    fn rejection_emits_a_bus_event() {
        let bus = EventBus::new(8);
        let (prov, sources) = chain(&[0.2], &[0.2]);
        let score = compute(&prov, &sources, &LScoreConfig::default()).unwrap();
        let _ = validate(score, "default", &LScoreConfig::default(), Some(&bus), 7);
        let events = bus.drain(8);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, "lscore_rejection");
    }
}
