use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::metric::MetricKind;

/// Name of the embedding model a vector came from, e.g. "Facenet512".
///
/// Thresholds and encoder bindings are looked up by this name, never assumed;
/// embeddings from different models must not be compared against each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelKind(String);

impl ModelKind {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Calibrated decision thresholds per (model, metric) pair.
///
/// Built once at startup and shared read-only across requests. The values
/// were derived offline for each embedding model; nothing is computed at
/// request time. An unknown pair is an error, not a default.
#[derive(Debug, Default)]
pub struct ThresholdTable {
    overrides: HashMap<(ModelKind, MetricKind), f32>,
}

impl ThresholdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the calibrated value for one (model, metric) pair, e.g. from
    /// a `[thresholds.<model>]` config section.
    pub fn set(&mut self, model: ModelKind, metric: MetricKind, value: f32) {
        self.overrides.insert((model, metric), value);
    }

    pub fn threshold_for(
        &self,
        model: &ModelKind,
        metric: MetricKind,
    ) -> Result<f32, ServiceError> {
        if let Some(&value) = self.overrides.get(&(model.clone(), metric)) {
            return Ok(value);
        }
        calibrated(model.name(), metric).ok_or_else(|| ServiceError::UnknownThreshold {
            model: model.clone(),
            metric,
        })
    }
}

fn calibrated(model: &str, metric: MetricKind) -> Option<f32> {
    use MetricKind::*;
    Some(match (model, metric) {
        ("VGG-Face", Cosine) => 0.40,
        ("VGG-Face", Euclidean) => 0.60,
        ("VGG-Face", EuclideanL2) => 0.86,
        ("Facenet", Cosine) => 0.40,
        ("Facenet", Euclidean) => 10.0,
        ("Facenet", EuclideanL2) => 0.80,
        ("Facenet512", Cosine) => 0.30,
        ("Facenet512", Euclidean) => 23.56,
        ("Facenet512", EuclideanL2) => 1.04,
        ("ArcFace", Cosine) => 0.68,
        ("ArcFace", Euclidean) => 4.15,
        ("ArcFace", EuclideanL2) => 1.13,
        ("Dlib", Cosine) => 0.07,
        ("Dlib", Euclidean) => 0.6,
        ("Dlib", EuclideanL2) => 0.4,
        ("SFace", Cosine) => 0.593,
        ("SFace", Euclidean) => 10.734,
        ("SFace", EuclideanL2) => 1.055,
        ("OpenFace", Cosine) => 0.10,
        ("OpenFace", Euclidean) => 0.55,
        ("OpenFace", EuclideanL2) => 0.55,
        ("DeepFace", Cosine) => 0.23,
        ("DeepFace", Euclidean) => 64.0,
        ("DeepFace", EuclideanL2) => 0.64,
        ("DeepID", Cosine) => 0.015,
        ("DeepID", Euclidean) => 45.0,
        ("DeepID", EuclideanL2) => 0.17,
        _ => return None,
    })
}
