use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::metric::MetricKind;
use crate::threshold::ModelKind;

/// Error kinds surfaced by the detection and verification paths.
///
/// Every variant is caught at the handler boundary and converted into a
/// `{"error": "<message>"}` payload; none of them crash the process and
/// nothing is retried.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The backend could not produce faces from the image: no face found,
    /// corrupt bytes, unsupported format, unreadable model file. Always
    /// wraps the backend message rather than passing a foreign error through.
    #[error("detection failed: {0}")]
    DetectionFailed(String),

    #[error("embedding dimension mismatch: reference has {reference} components, candidate has {candidate}")]
    DimensionMismatch { reference: usize, candidate: usize },

    #[error("malformed embedding input: {0}")]
    MalformedEmbedding(String),

    #[error("no calibrated threshold for model {model} with metric {metric}")]
    UnknownThreshold { model: ModelKind, metric: MetricKind },

    /// Only reachable with `strict_metric = true`; the default policy
    /// substitutes cosine instead.
    #[error("unknown distance metric {0:?}")]
    UnknownMetric(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    fn status(&self) -> StatusCode {
        match self {
            ServiceError::DetectionFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::DimensionMismatch { .. }
            | ServiceError::MalformedEmbedding(_)
            | ServiceError::UnknownThreshold { .. }
            | ServiceError::UnknownMetric(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}
