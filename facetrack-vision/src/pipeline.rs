use std::path::Path;

use anyhow::{Context, Result};
use image::DynamicImage;
use ort::session::Session;

use crate::face::{self, Detection, Embedding, EncoderSpec};

/// Full pipeline for one embedding model: detect faces → align → encode.
pub struct Pipeline {
    detector: Session,
    encoder: Session,
    spec: EncoderSpec,
}

impl Pipeline {
    pub fn open(detector_model: &Path, encoder_model: &Path, spec: EncoderSpec) -> Result<Self> {
        Ok(Self {
            detector: crate::model::load_session(detector_model)?,
            encoder: crate::model::load_session(encoder_model)?,
            spec,
        })
    }

    pub fn spec(&self) -> &EncoderSpec {
        &self.spec
    }

    /// Detect every face in the image and encode each one.
    ///
    /// A frame in which no face clears the score threshold is an error, not
    /// an empty result.
    pub fn represent(
        &mut self,
        img: &DynamicImage,
        score_threshold: f32,
        nms_threshold: f32,
    ) -> Result<Vec<(Detection, Embedding)>> {
        let detections =
            face::detect_faces(&mut self.detector, img, score_threshold, nms_threshold)
                .context("detecting faces")?;

        if detections.is_empty() {
            anyhow::bail!("no face could be detected in the image");
        }

        let mut faces = Vec::with_capacity(detections.len());
        for detection in detections {
            let aligned = face::align_face(img, &detection, self.spec.input_size)
                .context("aligning face")?;
            let embedding =
                face::encode_face(&mut self.encoder, &self.spec, &aligned).context("encoding face")?;
            faces.push((detection, embedding));
        }
        Ok(faces)
    }
}
