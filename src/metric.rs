use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use facetrack_vision::Embedding;

/// Distance metric used to compare two embeddings. Closed set; resolution of
/// caller-supplied names (including the fallback policy for unknown names)
/// lives in [`crate::verify::Verifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Cosine,
    Euclidean,
    EuclideanL2,
}

impl MetricKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "cosine" => Some(MetricKind::Cosine),
            "euclidean" => Some(MetricKind::Euclidean),
            "euclidean_l2" => Some(MetricKind::EuclideanL2),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cosine => "cosine",
            MetricKind::Euclidean => "euclidean",
            MetricKind::EuclideanL2 => "euclidean_l2",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Divide every component by the vector's L2 norm.
///
/// A zero vector is returned unchanged: it has no direction to scale to, and
/// silently dividing by zero is worse than passing the degenerate input
/// through.
pub fn l2_normalize(v: &Embedding) -> Embedding {
    let norm = v.vector.dot(&v.vector).sqrt();
    if norm > 0.0 {
        Embedding {
            vector: &v.vector / norm,
        }
    } else {
        v.clone()
    }
}

/// Scalar distance between two embeddings under the given metric.
///
/// The embeddings must have the same dimensionality; a mismatch is an input
/// error, never a computed number.
pub fn distance(a: &Embedding, b: &Embedding, metric: MetricKind) -> Result<f32, ServiceError> {
    if a.len() != b.len() {
        return Err(ServiceError::DimensionMismatch {
            reference: a.len(),
            candidate: b.len(),
        });
    }
    Ok(match metric {
        MetricKind::Cosine => cosine_distance(a, b),
        MetricKind::Euclidean => euclidean_distance(a, b),
        MetricKind::EuclideanL2 => euclidean_distance(&l2_normalize(a), &l2_normalize(b)),
    })
}

/// `1 - a·b / (‖a‖·‖b‖)`. Zero means identical direction. If either vector
/// has zero norm the distance is defined as 1.0 rather than NaN.
fn cosine_distance(a: &Embedding, b: &Embedding) -> f32 {
    let denom = a.vector.dot(&a.vector).sqrt() * b.vector.dot(&b.vector).sqrt();
    if denom == 0.0 {
        return 1.0;
    }
    1.0 - a.vector.dot(&b.vector) / denom
}

fn euclidean_distance(a: &Embedding, b: &Embedding) -> f32 {
    let diff = &a.vector - &b.vector;
    diff.dot(&diff).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding(values: &[f32]) -> Embedding {
        Embedding::from_vec(values.to_vec())
    }

    #[test]
    fn test_metric_names_round_trip() {
        for metric in [
            MetricKind::Cosine,
            MetricKind::Euclidean,
            MetricKind::EuclideanL2,
        ] {
            assert_eq!(MetricKind::from_name(metric.as_str()), Some(metric));
        }
        assert_eq!(MetricKind::from_name("manhattan"), None);
        assert_eq!(MetricKind::from_name("Cosine"), None);
    }

    #[test]
    fn test_normalize_produces_unit_norm() {
        let v = embedding(&[3.0, 4.0]);
        let n = l2_normalize(&v);
        let norm = n.vector.dot(&n.vector).sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((n.vector[0] - 0.6).abs() < 1e-6);
        assert!((n.vector[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_vector_passes_through() {
        let v = embedding(&[0.0, 0.0, 0.0]);
        let n = l2_normalize(&v);
        assert_eq!(n, v);
    }

    #[test]
    fn test_self_distance_is_zero() {
        let v = embedding(&[0.1, -0.7, 2.5, 3.0]);
        assert!(distance(&v, &v, MetricKind::Euclidean).unwrap().abs() < 1e-6);
        assert!(distance(&v, &v, MetricKind::Cosine).unwrap().abs() < 1e-6);
        assert!(distance(&v, &v, MetricKind::EuclideanL2).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_l2_equals_euclidean_of_normalized() {
        let a = embedding(&[1.0, 2.0, 3.0, 4.0]);
        let b = embedding(&[-2.0, 0.5, 1.0, 7.0]);
        let direct = distance(&a, &b, MetricKind::EuclideanL2).unwrap();
        let manual =
            distance(&l2_normalize(&a), &l2_normalize(&b), MetricKind::Euclidean).unwrap();
        assert!((direct - manual).abs() < 1e-6);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = embedding(&[1.0, 0.0, -3.0]);
        let b = embedding(&[0.2, 5.0, 1.5]);
        for metric in [
            MetricKind::Cosine,
            MetricKind::Euclidean,
            MetricKind::EuclideanL2,
        ] {
            let ab = distance(&a, &b, metric).unwrap();
            let ba = distance(&b, &a, metric).unwrap();
            assert!((ab - ba).abs() < 1e-6, "{metric} not symmetric");
        }
    }

    #[test]
    fn test_cosine_orthogonal_and_opposite() {
        let a = embedding(&[1.0, 0.0]);
        let b = embedding(&[0.0, 1.0]);
        assert!((distance(&a, &b, MetricKind::Cosine).unwrap() - 1.0).abs() < 1e-6);

        let neg = embedding(&[-1.0, 0.0]);
        assert!((distance(&a, &neg, MetricKind::Cosine).unwrap() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector_is_maximally_dissimilar() {
        let a = embedding(&[0.0, 0.0]);
        let b = embedding(&[1.0, 1.0]);
        assert!((distance(&a, &b, MetricKind::Cosine).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_dimension_mismatch_is_rejected() {
        let a = embedding(&[1.0, 2.0]);
        let b = embedding(&[1.0, 2.0, 3.0]);
        for metric in [
            MetricKind::Cosine,
            MetricKind::Euclidean,
            MetricKind::EuclideanL2,
        ] {
            match distance(&a, &b, metric) {
                Err(ServiceError::DimensionMismatch {
                    reference: 2,
                    candidate: 3,
                }) => {}
                other => panic!("expected DimensionMismatch, got {other:?}"),
            }
        }
    }
}
