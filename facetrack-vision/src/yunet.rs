//! YuNet detector post-processing.
//!
//! The detector is anchor-free: for each stride (8, 16, 32) it emits
//! classification, objectness, bbox-delta and landmark-delta tensors over the
//! feature grid, twelve tensors in total, ordered cls x3, obj x3, bbox x3,
//! kps x3. A grid cell (row, col) plus its deltas maps directly into image
//! coordinates without anchors or priors:
//!   center = (col + dx, row + dy) * stride
//!   size   = (dw, dh) * stride

use anyhow::{bail, Result};
use ndarray::Array2;

pub const STRIDES: [usize; 3] = [8, 16, 32];

/// Decoded detection, coordinates normalized to the detector input square.
#[derive(Debug, Clone)]
pub struct RawDetection {
    pub bbox: [f32; 4], // x, y, w, h in [0, 1]
    pub score: f32,
    pub landmarks: [f32; 10], // 5 points: x1,y1,...,x5,y5 in [0, 1]
}

/// One stride's tensors, scores already fused (sigmoid of cls * obj).
pub struct ScaleOutputs {
    pub scores: Array2<f32>,
    pub bboxes: Array2<f32>,
    pub landmarks: Array2<f32>,
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Group the detector's twelve raw outputs by stride and fuse the scores.
pub fn collect_outputs(
    outputs: &[(&[i64], &[f32])],
    input_size: usize,
) -> Result<Vec<ScaleOutputs>> {
    if outputs.len() != 12 {
        bail!("expected 12 detector outputs, got {}", outputs.len());
    }
    let mut scales = Vec::with_capacity(STRIDES.len());
    for (idx, &stride) in STRIDES.iter().enumerate() {
        let grid = input_size / stride;
        let locations = grid * grid;
        let cls = tensor(outputs, idx, locations, 1)?;
        let obj = tensor(outputs, idx + 3, locations, 1)?;
        let bboxes = tensor(outputs, idx + 6, locations, 4)?;
        let landmarks = tensor(outputs, idx + 9, locations, 10)?;
        let scores = (&cls * &obj).mapv(sigmoid);
        scales.push(ScaleOutputs {
            scores,
            bboxes,
            landmarks,
        });
    }
    Ok(scales)
}

fn tensor(
    outputs: &[(&[i64], &[f32])],
    idx: usize,
    locations: usize,
    channels: usize,
) -> Result<Array2<f32>> {
    let Some((shape, data)) = outputs.get(idx) else {
        bail!("missing detector output at index {idx}");
    };
    if shape.len() != 3 || shape[0] != 1 || shape[1] as usize != locations || shape[2] as usize != channels
    {
        bail!("detector output {idx} has shape {shape:?}, expected [1, {locations}, {channels}]");
    }
    Ok(Array2::from_shape_vec((locations, channels), data.to_vec())?)
}

/// Decode every grid cell above the score threshold into a detection.
pub fn decode(scales: &[ScaleOutputs], score_threshold: f32, input_size: usize) -> Vec<RawDetection> {
    let mut detections = Vec::new();
    for (scale, &stride) in scales.iter().zip(STRIDES.iter()) {
        let grid = input_size / stride;
        let norm = input_size as f32;
        let stride = stride as f32;
        for row in 0..grid {
            for col in 0..grid {
                let idx = row * grid + col;
                let score = scale.scores[[idx, 0]];
                if score < score_threshold {
                    continue;
                }
                let cx = (col as f32 + scale.bboxes[[idx, 0]]) * stride / norm;
                let cy = (row as f32 + scale.bboxes[[idx, 1]]) * stride / norm;
                let w = scale.bboxes[[idx, 2]] * stride / norm;
                let h = scale.bboxes[[idx, 3]] * stride / norm;
                let mut landmarks = [0.0f32; 10];
                for k in 0..5 {
                    landmarks[k * 2] =
                        (col as f32 + scale.landmarks[[idx, k * 2]]) * stride / norm;
                    landmarks[k * 2 + 1] =
                        (row as f32 + scale.landmarks[[idx, k * 2 + 1]]) * stride / norm;
                }
                detections.push(RawDetection {
                    bbox: [cx - w / 2.0, cy - h / 2.0, w, h],
                    score,
                    landmarks,
                });
            }
        }
    }
    detections
}
