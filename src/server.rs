use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::routing::post;
use axum::{Json, Router};
use image::DynamicImage;
use log::{info, warn};
use serde_json::{json, Value};
use tower_http::services::ServeDir;

use crate::detect::{DetectedFace, FaceDetector};
use crate::error::ServiceError;
use crate::metric::MetricKind;
use crate::threshold::ModelKind;
use crate::verify::{self, VerificationResult, Verifier};

/// Uploaded frames can be multi-megapixel PNGs; cap the body well above that.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub type SharedDetector = Arc<Mutex<dyn FaceDetector>>;

/// State shared across request handlers. The verifier and defaults are
/// read-only; the detector is serialized behind a mutex because inference
/// sessions need exclusive access.
#[derive(Clone)]
pub struct AppState {
    pub detector: SharedDetector,
    pub verifier: Arc<Verifier>,
    pub default_model: ModelKind,
    pub default_metric: String,
}

pub fn router(state: AppState, static_dir: &Path) -> Router {
    Router::new()
        .route("/api/v1/face/detect", post(detect))
        .route("/api/v1/face/track", post(track))
        .nest_service("/ui", ServeDir::new(static_dir))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

pub async fn serve(listen: &str, app: Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await.context("serving http")?;
    Ok(())
}

/// Detect faces and return one region/embedding pair per face.
async fn detect(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>, ServiceError> {
    let fields = collect_fields(multipart).await?;
    let image = decode_image(fields.image)?;
    let model = fields
        .model
        .map(ModelKind::new)
        .unwrap_or_else(|| state.default_model.clone());

    let faces = run_detection(&state, image, model.clone()).await?;
    info!("detect: {} face(s) with model {model}", faces.len());
    Ok(Json(detect_payload(&faces)))
}

/// Detect faces, then verify each one against the reference embedding.
async fn track(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>, ServiceError> {
    let fields = collect_fields(multipart).await?;
    let image = decode_image(fields.image)?;
    let reference = verify::parse_embedding(fields.embedding.as_deref().unwrap_or_default())?;
    let model = fields
        .model
        .map(ModelKind::new)
        .unwrap_or_else(|| state.default_model.clone());
    let metric = state
        .verifier
        .resolve_metric(fields.metric.as_deref().unwrap_or(&state.default_metric))?;
    let threshold = state.verifier.threshold_for(&model, metric)?;

    let faces = run_detection(&state, image, model.clone()).await?;
    let mut results = Vec::with_capacity(faces.len());
    for face in &faces {
        results.push(
            state
                .verifier
                .decide(&reference, &face.embedding, &model, metric)?,
        );
    }
    info!(
        "track: {}/{} face(s) verified with model {model}, metric {metric}",
        results.iter().filter(|r| r.verified).count(),
        faces.len()
    );
    Ok(Json(track_payload(&faces, &results, threshold, &model, metric)))
}

pub fn detect_payload(faces: &[DetectedFace]) -> Value {
    let entries: Vec<_> = faces.iter().map(|f| f.region).collect();
    let embeddings: Vec<Vec<f32>> = faces.iter().map(|f| f.embedding.vector.to_vec()).collect();
    json!({ "entries": entries, "embeddings": embeddings })
}

pub fn track_payload(
    faces: &[DetectedFace],
    results: &[VerificationResult],
    threshold: f32,
    model: &ModelKind,
    metric: MetricKind,
) -> Value {
    let entries: Vec<_> = faces.iter().map(|f| f.region).collect();
    let embeddings: Vec<Vec<f32>> = faces.iter().map(|f| f.embedding.vector.to_vec()).collect();
    json!({
        "entries": entries,
        "embeddings": embeddings,
        "results": results,
        "threshold": threshold,
        "model": model,
        "metric": metric,
    })
}

#[derive(Default)]
struct FormFields {
    image: Option<Vec<u8>>,
    embedding: Option<String>,
    model: Option<String>,
    metric: Option<String>,
}

async fn collect_fields(mut multipart: Multipart) -> Result<FormFields, ServiceError> {
    let mut fields = FormFields::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::Internal(format!("reading multipart form: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ServiceError::Internal(format!("reading image field: {e}")))?;
                fields.image = Some(bytes.to_vec());
            }
            "embedding" => fields.embedding = Some(read_text(field).await?),
            "model" => fields.model = Some(read_text(field).await?),
            "metric" => fields.metric = Some(read_text(field).await?),
            other => warn!("ignoring unknown form field {other:?}"),
        }
    }
    Ok(fields)
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String, ServiceError> {
    field
        .text()
        .await
        .map_err(|e| ServiceError::Internal(format!("reading form field: {e}")))
}

fn decode_image(bytes: Option<Vec<u8>>) -> Result<DynamicImage, ServiceError> {
    let bytes = bytes
        .ok_or_else(|| ServiceError::DetectionFailed("missing image field".to_string()))?;
    image::load_from_memory(&bytes)
        .map_err(|e| ServiceError::DetectionFailed(format!("could not decode image: {e}")))
}

/// Inference is synchronous and can take a while; run it off the async
/// workers and serialize access to the backend sessions.
async fn run_detection(
    state: &AppState,
    image: DynamicImage,
    model: ModelKind,
) -> Result<Vec<DetectedFace>, ServiceError> {
    let detector = state.detector.clone();
    tokio::task::spawn_blocking(move || {
        // Recover the lock if a previous inference panicked.
        let mut guard = detector
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.represent(&image, &model)
    })
    .await
    .map_err(|e| ServiceError::Internal(format!("detection task failed: {e}")))?
}
