pub mod config;
pub mod detect;
pub mod error;
pub mod metric;
pub mod server;
pub mod threshold;
pub mod verify;

// Re-export the types most callers need
pub use detect::{DetectedFace, FaceDetector, FaceRegion, OnnxFaceDetector};
pub use error::ServiceError;
pub use facetrack_vision::Embedding;
pub use metric::MetricKind;
pub use threshold::{ModelKind, ThresholdTable};
pub use verify::{MetricPolicy, VerificationResult, Verifier};
