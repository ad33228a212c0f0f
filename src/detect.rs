use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;

use image::DynamicImage;
use log::info;
use serde::Serialize;

use crate::error::ServiceError;
use crate::threshold::ModelKind;
use facetrack_vision::{Embedding, EncoderSpec, Pipeline};

/// Bounding region of a detected face in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One face found in an input image: where it is, and what it looks like to
/// the embedding model.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub region: FaceRegion,
    pub embedding: Embedding,
}

/// The capability the request handlers consume: run the
/// detection-and-embedding backend over a decoded image.
///
/// Every failure mode of the backend is reported as
/// [`ServiceError::DetectionFailed`] carrying the backend message, so the
/// transport layer never sees a foreign error type.
pub trait FaceDetector: Send {
    fn represent(
        &mut self,
        image: &DynamicImage,
        model: &ModelKind,
    ) -> Result<Vec<DetectedFace>, ServiceError>;
}

/// File name of the shared face detector model inside the models directory.
const DETECTOR_FILE: &str = "face_detection_yunet.onnx";

/// Encoder binding per supported embedding model: ONNX file under the models
/// directory plus the preprocessing the model was trained with.
fn encoder_binding(model: &ModelKind) -> Option<(&'static str, EncoderSpec)> {
    let spec = |input_size, mean, scale, embedding_dim| EncoderSpec {
        input_size,
        mean,
        scale,
        embedding_dim,
    };
    Some(match model.name() {
        "VGG-Face" => ("vgg_face.onnx", spec(224, 0.0, 1.0, 2622)),
        "Facenet" => ("facenet.onnx", spec(160, 127.5, 1.0 / 128.0, 128)),
        "Facenet512" => ("facenet512.onnx", spec(160, 127.5, 1.0 / 128.0, 512)),
        "OpenFace" => ("openface.onnx", spec(96, 0.0, 1.0 / 255.0, 128)),
        "DeepFace" => ("deepface.onnx", spec(152, 0.0, 1.0, 4096)),
        "DeepID" => ("deepid.onnx", spec(55, 0.0, 1.0 / 255.0, 160)),
        "Dlib" => ("dlib_face_recognition.onnx", spec(150, 0.0, 1.0, 128)),
        "ArcFace" => ("arcface.onnx", spec(112, 127.5, 1.0 / 128.0, 512)),
        "SFace" => ("face_recognition_sface.onnx", spec(112, 0.0, 1.0, 128)),
        _ => return None,
    })
}

/// ONNX-backed detector: one YuNet + encoder pipeline per embedding model,
/// constructed lazily from the model files under `models_dir`.
pub struct OnnxFaceDetector {
    models_dir: PathBuf,
    score_threshold: f32,
    nms_threshold: f32,
    pipelines: HashMap<ModelKind, Pipeline>,
}

impl OnnxFaceDetector {
    pub fn new(models_dir: PathBuf, score_threshold: f32, nms_threshold: f32) -> Self {
        Self {
            models_dir,
            score_threshold,
            nms_threshold,
            pipelines: HashMap::new(),
        }
    }

    fn pipeline_for(&mut self, model: &ModelKind) -> Result<&mut Pipeline, ServiceError> {
        match self.pipelines.entry(model.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(slot) => {
                let (file, spec) = encoder_binding(model).ok_or_else(|| {
                    ServiceError::DetectionFailed(format!("no embedding backend for model {model}"))
                })?;
                let pipeline = Pipeline::open(
                    &self.models_dir.join(DETECTOR_FILE),
                    &self.models_dir.join(file),
                    spec,
                )
                .map_err(|e| ServiceError::DetectionFailed(format!("{e:#}")))?;
                info!(
                    "loaded {model} pipeline from {}",
                    self.models_dir.display()
                );
                Ok(slot.insert(pipeline))
            }
        }
    }
}

impl FaceDetector for OnnxFaceDetector {
    fn represent(
        &mut self,
        image: &DynamicImage,
        model: &ModelKind,
    ) -> Result<Vec<DetectedFace>, ServiceError> {
        let score_threshold = self.score_threshold;
        let nms_threshold = self.nms_threshold;
        let pipeline = self.pipeline_for(model)?;

        let faces = pipeline
            .represent(image, score_threshold, nms_threshold)
            .map_err(|e| ServiceError::DetectionFailed(format!("{e:#}")))?;

        let mut detected = Vec::with_capacity(faces.len());
        for (detection, embedding) in faces {
            if let Some(region) = pixel_region(&detection.bbox) {
                detected.push(DetectedFace { region, embedding });
            }
        }
        if detected.is_empty() {
            return Err(ServiceError::DetectionFailed(
                "no face could be detected in the image".to_string(),
            ));
        }
        Ok(detected)
    }
}

/// Convert a float bbox to non-negative pixel coordinates. Detections that
/// round to a zero-area box are dropped; every returned region has positive
/// width and height.
fn pixel_region(bbox: &[f32; 4]) -> Option<FaceRegion> {
    let width = bbox[2].round() as i64;
    let height = bbox[3].round() as i64;
    if width <= 0 || height <= 0 {
        return None;
    }
    Some(FaceRegion {
        x: bbox[0].max(0.0).round() as u32,
        y: bbox[1].max(0.0).round() as u32,
        width: width as u32,
        height: height as u32,
    })
}
