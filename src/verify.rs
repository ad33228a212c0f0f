use serde::Serialize;

use crate::error::ServiceError;
use crate::metric::{self, MetricKind};
use crate::threshold::{ModelKind, ThresholdTable};
use facetrack_vision::Embedding;

/// Judgment for one candidate face against the reference embedding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VerificationResult {
    pub verified: bool,
    pub distance: f32,
}

/// What to do with a metric name outside {cosine, euclidean, euclidean_l2}.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricPolicy {
    /// Substitute cosine. Callers have come to rely on this leniency, so it
    /// is the default.
    FallbackToCosine,
    /// Reject the request instead.
    Strict,
}

/// Turns (reference, candidate, model, metric) into a verified/distance
/// judgment. Pure apart from reading the threshold table built at startup.
pub struct Verifier {
    table: ThresholdTable,
    policy: MetricPolicy,
}

impl Verifier {
    pub fn new(table: ThresholdTable, policy: MetricPolicy) -> Self {
        Self { table, policy }
    }

    /// Resolve a caller-supplied metric name according to the configured
    /// policy.
    pub fn resolve_metric(&self, name: &str) -> Result<MetricKind, ServiceError> {
        match MetricKind::from_name(name) {
            Some(metric) => Ok(metric),
            None => match self.policy {
                MetricPolicy::FallbackToCosine => Ok(MetricKind::Cosine),
                MetricPolicy::Strict => Err(ServiceError::UnknownMetric(name.to_string())),
            },
        }
    }

    pub fn threshold_for(
        &self,
        model: &ModelKind,
        metric: MetricKind,
    ) -> Result<f32, ServiceError> {
        self.table.threshold_for(model, metric)
    }

    /// Compare a candidate embedding against the reference: distance under
    /// the metric, verified iff it does not exceed the calibrated threshold.
    pub fn decide(
        &self,
        reference: &Embedding,
        candidate: &Embedding,
        model: &ModelKind,
        metric: MetricKind,
    ) -> Result<VerificationResult, ServiceError> {
        let threshold = self.table.threshold_for(model, metric)?;
        let distance = metric::distance(reference, candidate, metric)?;
        Ok(VerificationResult {
            verified: distance <= threshold,
            distance,
        })
    }
}

/// Parse a reference embedding from its textual comma-separated form.
pub fn parse_embedding(text: &str) -> Result<Embedding, ServiceError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::MalformedEmbedding(
            "empty embedding".to_string(),
        ));
    }
    let mut values = Vec::new();
    for part in trimmed.split(',') {
        let part = part.trim();
        let value: f32 = part
            .parse()
            .map_err(|_| ServiceError::MalformedEmbedding(format!("not a number: {part:?}")))?;
        values.push(value);
    }
    Ok(Embedding::from_vec(values))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier(policy: MetricPolicy) -> Verifier {
        Verifier::new(ThresholdTable::new(), policy)
    }

    fn basis_embedding(dim: usize, sign: f32) -> Embedding {
        let mut values = vec![0.0f32; dim];
        values[0] = sign;
        Embedding::from_vec(values)
    }

    #[test]
    fn test_unknown_metric_falls_back_to_cosine() {
        let v = verifier(MetricPolicy::FallbackToCosine);
        assert_eq!(v.resolve_metric("manhattan").unwrap(), MetricKind::Cosine);
        assert_eq!(
            v.resolve_metric("euclidean_l2").unwrap(),
            MetricKind::EuclideanL2
        );
    }

    #[test]
    fn test_unknown_metric_matches_cosine_decision() {
        let v = verifier(MetricPolicy::FallbackToCosine);
        let model = ModelKind::new("Facenet512");
        let a = Embedding::from_vec(vec![1.0, 0.5, -0.3]);
        let b = Embedding::from_vec(vec![0.9, 0.6, -0.2]);

        let fallback = v.resolve_metric("manhattan").unwrap();
        let with_fallback = v.decide(&a, &b, &model, fallback).unwrap();
        let with_cosine = v.decide(&a, &b, &model, MetricKind::Cosine).unwrap();
        assert_eq!(with_fallback, with_cosine);
    }

    #[test]
    fn test_strict_policy_rejects_unknown_metric() {
        let v = verifier(MetricPolicy::Strict);
        match v.resolve_metric("manhattan") {
            Err(ServiceError::UnknownMetric(name)) => assert_eq!(name, "manhattan"),
            other => panic!("expected UnknownMetric, got {other:?}"),
        }
    }

    #[test]
    fn test_identical_embeddings_verify() {
        let v = verifier(MetricPolicy::FallbackToCosine);
        let model = ModelKind::new("Facenet512");
        let reference = basis_embedding(512, 1.0);

        let result = v
            .decide(&reference, &reference, &model, MetricKind::EuclideanL2)
            .unwrap();
        assert!(result.verified);
        assert!(result.distance.abs() < 1e-6);
    }

    #[test]
    fn test_negated_embedding_is_rejected() {
        let v = verifier(MetricPolicy::FallbackToCosine);
        let model = ModelKind::new("Facenet512");
        let reference = basis_embedding(512, 1.0);
        let negated = basis_embedding(512, -1.0);

        let result = v
            .decide(&reference, &negated, &model, MetricKind::EuclideanL2)
            .unwrap();
        // Opposite unit vectors sit at the far end of the normalized
        // euclidean scale.
        assert!((result.distance - 2.0).abs() < 1e-5);
        assert!(!result.verified);
    }

    #[test]
    fn test_dimension_mismatch_propagates() {
        let v = verifier(MetricPolicy::FallbackToCosine);
        let model = ModelKind::new("Facenet512");
        let reference = basis_embedding(512, 1.0);
        let candidate = basis_embedding(128, 1.0);

        match v.decide(&reference, &candidate, &model, MetricKind::Cosine) {
            Err(ServiceError::DimensionMismatch { .. }) => {}
            other => panic!("expected DimensionMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_model_propagates() {
        let v = verifier(MetricPolicy::FallbackToCosine);
        let model = ModelKind::new("NoSuchModel");
        let reference = basis_embedding(8, 1.0);

        match v.decide(&reference, &reference, &model, MetricKind::Cosine) {
            Err(ServiceError::UnknownThreshold { .. }) => {}
            other => panic!("expected UnknownThreshold, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_embedding() {
        let e = parse_embedding("1.0, -2.5,3").unwrap();
        assert_eq!(e.len(), 3);
        assert!((e.vector[0] - 1.0).abs() < 1e-6);
        assert!((e.vector[1] + 2.5).abs() < 1e-6);
        assert!((e.vector[2] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_parse_embedding_rejects_garbage() {
        assert!(matches!(
            parse_embedding(""),
            Err(ServiceError::MalformedEmbedding(_))
        ));
        assert!(matches!(
            parse_embedding("1.0,abc,3.0"),
            Err(ServiceError::MalformedEmbedding(_))
        ));
        assert!(matches!(
            parse_embedding("1.0,,3.0"),
            Err(ServiceError::MalformedEmbedding(_))
        ));
    }
}
