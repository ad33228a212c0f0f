use crate::yunet;
use anyhow::{bail, Result};
use image::{DynamicImage, GenericImageView};
use ndarray::{Array1, Array4};
use ort::{session::Session, value::Value};

/// Detector input is a fixed square; frames are letterboxed into it.
const DETECTOR_INPUT: u32 = 640;

/// Detection result in source-image pixel coordinates.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: [f32; 4], // x, y, w, h
    pub score: f32,
    pub landmarks: [f32; 10], // 5 points: x1,y1,x2,y2,...,x5,y5
}

/// Face embedding produced by an encoder model.
///
/// Components are the raw model output. Whether and how to normalize is a
/// property of the distance metric, not of the embedding itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Array1<f32>,
}

impl Embedding {
    pub fn from_vec(values: Vec<f32>) -> Self {
        Self {
            vector: Array1::from_vec(values),
        }
    }

    pub fn len(&self) -> usize {
        self.vector.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vector.is_empty()
    }
}

/// Encoder binding for one embedding model: input geometry and the linear
/// pixel normalization it was trained with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderSpec {
    pub input_size: u32,
    pub mean: f32,
    pub scale: f32,
    pub embedding_dim: usize,
}

/// Detect faces in an image with a YuNet detector session.
pub fn detect_faces(
    session: &mut Session,
    img: &DynamicImage,
    score_threshold: f32,
    nms_threshold: f32,
) -> Result<Vec<Detection>> {
    let (canvas, scale, offset_x, offset_y) = letterbox(img, DETECTOR_INPUT);

    let size = DETECTOR_INPUT as usize;
    let input_array = Array4::from_shape_vec((1, 3, size, size), bgr_planes(&canvas))?;
    let input_tensor = Value::from_array(input_array)?;
    let outputs = session.run(ort::inputs![input_tensor])?;

    // Pull every output tensor out before decoding; the decoder wants plain
    // (shape, data) pairs.
    let mut raw: Vec<(Vec<i64>, Vec<f32>)> = Vec::new();
    for (_name, output) in outputs.iter() {
        let (shape, data) = output.try_extract_tensor::<f32>()?;
        raw.push((shape.iter().copied().collect(), data.to_vec()));
    }
    let refs: Vec<(&[i64], &[f32])> = raw
        .iter()
        .map(|(s, d)| (s.as_slice(), d.as_slice()))
        .collect();

    let scales = yunet::collect_outputs(&refs, size)?;
    let mut detections: Vec<Detection> = yunet::decode(&scales, score_threshold, size)
        .into_iter()
        .map(|d| unletterbox(&d, scale, offset_x, offset_y))
        .collect();

    if nms_threshold < 1.0 {
        detections = nms(&detections, nms_threshold);
    }
    Ok(detections)
}

/// Resize keeping aspect ratio and center on a square canvas.
fn letterbox(img: &DynamicImage, target: u32) -> (image::RgbImage, f32, u32, u32) {
    let (width, height) = img.dimensions();
    let scale = target as f32 / width.max(height) as f32;
    let new_width = (width as f32 * scale) as u32;
    let new_height = (height as f32 * scale) as u32;

    let resized = img.resize_exact(new_width, new_height, image::imageops::FilterType::Triangle);
    let mut canvas = DynamicImage::new_rgb8(target, target);
    let offset_x = (target - new_width) / 2;
    let offset_y = (target - new_height) / 2;
    image::imageops::overlay(&mut canvas, &resized, offset_x as i64, offset_y as i64);

    (canvas.to_rgb8(), scale, offset_x, offset_y)
}

/// Planar BGR float buffer, the channel layout both the detector and the
/// encoders expect.
fn bgr_planes(img: &image::RgbImage) -> Vec<f32> {
    let pixels = img.as_raw();
    let count = (img.width() * img.height()) as usize;
    let mut planes = vec![0.0f32; 3 * count];
    let (b_channel, rest) = planes.split_at_mut(count);
    let (g_channel, r_channel) = rest.split_at_mut(count);
    for i in 0..count {
        r_channel[i] = pixels[i * 3] as f32;
        g_channel[i] = pixels[i * 3 + 1] as f32;
        b_channel[i] = pixels[i * 3 + 2] as f32;
    }
    planes
}

/// Map a normalized canvas-space detection back to source pixel coordinates.
fn unletterbox(d: &yunet::RawDetection, scale: f32, offset_x: u32, offset_y: u32) -> Detection {
    let size = DETECTOR_INPUT as f32;
    let map_x = |x: f32| (x * size - offset_x as f32) / scale;
    let map_y = |y: f32| (y * size - offset_y as f32) / scale;

    let mut landmarks = [0.0f32; 10];
    for k in 0..5 {
        landmarks[k * 2] = map_x(d.landmarks[k * 2]);
        landmarks[k * 2 + 1] = map_y(d.landmarks[k * 2 + 1]);
    }
    Detection {
        bbox: [
            map_x(d.bbox[0]),
            map_y(d.bbox[1]),
            d.bbox[2] * size / scale,
            d.bbox[3] * size / scale,
        ],
        score: d.score,
        landmarks,
    }
}

/// Apply non-maximum suppression to remove overlapping detections
pub fn nms(detections: &[Detection], iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return vec![];
    }

    let mut sorted = detections.to_vec();
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Detection> = Vec::new();
    for candidate in sorted {
        if keep.iter().all(|k| iou(&k.bbox, &candidate.bbox) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = (a[0] + a[2]).min(b[0] + b[2]);
    let y2 = (a[1] + a[3]).min(b[1] + b[3]);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let inter = (x2 - x1) * (y2 - y1);
    let area_a = a[2] * a[3];
    let area_b = b[2] * b[3];
    inter / (area_a + area_b - inter)
}

/// Rotate, scale and crop a face to `size` x `size` using the eye landmarks.
///
/// Reference eye positions follow the 112x112 ArcFace alignment template,
/// scaled to the requested output size.
pub fn align_face(img: &DynamicImage, detection: &Detection, size: u32) -> Result<DynamicImage> {
    const REF_LEFT_EYE: (f32, f32) = (38.3, 51.7);
    const REF_RIGHT_EYE: (f32, f32) = (73.5, 51.5);

    let left_eye = (detection.landmarks[0], detection.landmarks[1]);
    let right_eye = (detection.landmarks[2], detection.landmarks[3]);

    let eye_dx = right_eye.0 - left_eye.0;
    let eye_dy = right_eye.1 - left_eye.1;
    let eye_dist = (eye_dx * eye_dx + eye_dy * eye_dy).sqrt();
    if eye_dist <= f32::EPSILON {
        bail!("degenerate eye landmarks, cannot align face");
    }
    let angle = eye_dy.atan2(eye_dx);

    let ref_dist = ((REF_RIGHT_EYE.0 - REF_LEFT_EYE.0).powi(2)
        + (REF_RIGHT_EYE.1 - REF_LEFT_EYE.1).powi(2))
    .sqrt();
    let scale = (size as f32 / 112.0) * (ref_dist / eye_dist);

    let eye_center = (
        (left_eye.0 + right_eye.0) / 2.0,
        (left_eye.1 + right_eye.1) / 2.0,
    );
    let ref_center = (
        (REF_LEFT_EYE.0 + REF_RIGHT_EYE.0) / 2.0 * size as f32 / 112.0,
        (REF_LEFT_EYE.1 + REF_RIGHT_EYE.1) / 2.0 * size as f32 / 112.0,
    );

    // Affine output = R * input + t, with R combining rotation and scale;
    // t places the eye midpoint on the reference midpoint.
    let a = scale * angle.cos();
    let b = scale * angle.sin();
    let c = -scale * angle.sin();
    let d = scale * angle.cos();
    let tx = ref_center.0 - (a * eye_center.0 + b * eye_center.1);
    let ty = ref_center.1 - (c * eye_center.0 + d * eye_center.1);
    let det = a * d - b * c;

    let (img_w, img_h) = img.dimensions();
    let mut output = image::RgbImage::new(size, size);

    for out_y in 0..size {
        for out_x in 0..size {
            // Invert the affine to find the source coordinate, sample with
            // bilinear interpolation; out-of-bounds pixels stay black.
            let sx = out_x as f32 - tx;
            let sy = out_y as f32 - ty;
            let in_x = (d * sx - b * sy) / det;
            let in_y = (-c * sx + a * sy) / det;
            if in_x < 0.0 || in_y < 0.0 || in_x >= img_w as f32 || in_y >= img_h as f32 {
                continue;
            }

            let x0 = in_x.floor() as u32;
            let y0 = in_y.floor() as u32;
            let x1 = (x0 + 1).min(img_w - 1);
            let y1 = (y0 + 1).min(img_h - 1);
            let fx = in_x - x0 as f32;
            let fy = in_y - y0 as f32;

            let p00 = img.get_pixel(x0, y0);
            let p10 = img.get_pixel(x1, y0);
            let p01 = img.get_pixel(x0, y1);
            let p11 = img.get_pixel(x1, y1);

            let mut px = [0u8; 3];
            for ch in 0..3 {
                px[ch] = (p00[ch] as f32 * (1.0 - fx) * (1.0 - fy)
                    + p10[ch] as f32 * fx * (1.0 - fy)
                    + p01[ch] as f32 * (1.0 - fx) * fy
                    + p11[ch] as f32 * fx * fy) as u8;
            }
            output.put_pixel(out_x, out_y, image::Rgb(px));
        }
    }

    Ok(DynamicImage::ImageRgb8(output))
}

/// Encode an aligned face crop into an embedding.
pub fn encode_face(
    session: &mut Session,
    spec: &EncoderSpec,
    face_img: &DynamicImage,
) -> Result<Embedding> {
    let input_array = preprocess_face(face_img, spec)?;
    let input_tensor = Value::from_array(input_array)?;

    let outputs = session.run(ort::inputs![input_tensor])?;
    let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;

    let dim = if shape.len() == 2 {
        shape[1] as usize
    } else {
        data.len()
    };
    if dim != spec.embedding_dim {
        bail!(
            "encoder produced {dim} components, expected {}",
            spec.embedding_dim
        );
    }

    Ok(Embedding::from_vec(data[..dim].to_vec()))
}

/// Planar BGR tensor with the encoder's pixel normalization applied.
fn preprocess_face(face_img: &DynamicImage, spec: &EncoderSpec) -> Result<Array4<f32>> {
    let size = spec.input_size;
    let rgb = face_img
        .resize_exact(size, size, image::imageops::FilterType::Triangle)
        .to_rgb8();
    let mut planes = bgr_planes(&rgb);
    for v in &mut planes {
        *v = (*v - spec.mean) * spec.scale;
    }
    Ok(Array4::from_shape_vec(
        (1, 3, size as usize, size as usize),
        planes,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(bbox: [f32; 4], score: f32) -> Detection {
        Detection {
            bbox,
            score,
            landmarks: [0.0; 10],
        }
    }

    #[test]
    fn test_iou() {
        let a = [10.0, 10.0, 20.0, 20.0];
        let b = [15.0, 15.0, 20.0, 20.0];
        let overlap = iou(&a, &b);
        assert!(overlap > 0.0 && overlap < 1.0);

        // No overlap
        let c = [100.0, 100.0, 10.0, 10.0];
        assert_eq!(iou(&a, &c), 0.0);
    }

    #[test]
    fn test_nms() {
        let detections = vec![
            detection([10.0, 10.0, 20.0, 20.0], 0.9),
            detection([12.0, 12.0, 20.0, 20.0], 0.8),
            detection([100.0, 100.0, 20.0, 20.0], 0.85),
        ];

        let result = nms(&detections, 0.3);
        assert_eq!(result.len(), 2); // Should keep first and third
        assert!((result[0].score - 0.9).abs() < 1e-6);
        assert!((result[1].score - 0.85).abs() < 1e-6);
    }

    #[test]
    fn test_letterbox_landscape() {
        let img = DynamicImage::new_rgb8(200, 100);
        let (canvas, scale, offset_x, offset_y) = letterbox(&img, 640);
        assert_eq!(canvas.dimensions(), (640, 640));
        assert!((scale - 3.2).abs() < 1e-6);
        assert_eq!(offset_x, 0);
        assert_eq!(offset_y, 160);
    }

    #[test]
    fn test_unletterbox_roundtrip() {
        // A box centered on the canvas maps back to the source center.
        let raw = yunet::RawDetection {
            bbox: [0.45, 0.45, 0.1, 0.1],
            score: 0.9,
            landmarks: [0.5; 10],
        };
        let det = unletterbox(&raw, 3.2, 0, 160);
        assert!((det.bbox[0] - 90.0).abs() < 1e-3);
        assert!((det.bbox[1] - 40.0).abs() < 1e-3);
        assert!((det.bbox[2] - 20.0).abs() < 1e-3);
        assert!((det.bbox[3] - 20.0).abs() < 1e-3);
        assert!((det.landmarks[0] - 100.0).abs() < 1e-3);
        assert!((det.landmarks[1] - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_preprocess_face_applies_normalization() {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            4,
            4,
            image::Rgb([255, 255, 255]),
        ));
        let spec = EncoderSpec {
            input_size: 4,
            mean: 127.5,
            scale: 1.0 / 128.0,
            embedding_dim: 128,
        };
        let tensor = preprocess_face(&img, &spec).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 4, 4]);
        let expected = (255.0 - 127.5) / 128.0;
        assert!((tensor[[0, 0, 0, 0]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_align_face_rejects_coincident_eyes() {
        let img = DynamicImage::new_rgb8(64, 64);
        let det = detection([0.0, 0.0, 64.0, 64.0], 0.9);
        assert!(align_face(&img, &det, 112).is_err());
    }

    #[test]
    fn test_embedding_len() {
        let e = Embedding::from_vec(vec![0.0; 512]);
        assert_eq!(e.len(), 512);
        assert!(!e.is_empty());
    }
}
