//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three strides followed by NMS. The same model
//! doubles as a five-point landmark predictor: run on a padded crop around a
//! region, its keypoints are mapped back into image space.

use crate::enhance;
use crate::extractor::{LandmarkModel, ModelError};
use crate::locator::{Detection, FaceDetector};
use crate::types::{FaceRegion, LandmarkLayout, LandmarkSet, Point};
use image::imageops::FilterType;
use image::{GrayImage, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
/// Threshold reduction per upsample level beyond the first.
const SCRFD_UPSAMPLE_RELAX: f32 = 0.1;
const SCRFD_MIN_CONFIDENCE: f32 = 0.2;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
/// Fraction of the region size added on each side before landmark search.
const LANDMARK_CROP_PAD: f32 = 0.25;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download it from insightface into the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<DetectorError> for ModelError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::ModelNotFound(p) => ModelError::ModelNotFound(p),
            DetectorError::InferenceFailed(m) => ModelError::InferenceFailed(m),
            DetectorError::Ort(e) => ModelError::Ort(e),
        }
    }
}

/// One decoded SCRFD face.
#[derive(Debug, Clone)]
struct ScrfdFace {
    bbox: Detection,
    /// [left_eye, right_eye, nose, left_mouth, right_mouth]
    keypoints: Option<[Point; 5]>,
}

/// Letterbox placement used to map model coordinates back to the frame.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn unmap(&self, x: f32, y: f32) -> Point {
        Point::new((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD session plus its discovered output layout.
pub struct ScrfdModel {
    session: Session,
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdModel {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            stride_indices,
        })
    }

    /// Faces in `gray`, sorted by descending confidence.
    fn run(&mut self, gray: &GrayImage, threshold: f32) -> Result<Vec<ScrfdFace>, DetectorError> {
        let (input, letterbox) = preprocess(gray);
        let stride_indices = self.stride_indices;

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut faces = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = stride_indices[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            faces.extend(decode_stride(scores, bboxes, kps, stride, &letterbox, threshold));
        }

        Ok(nms(faces, SCRFD_NMS_THRESHOLD))
    }
}

fn pass_threshold(upsample: u32) -> f32 {
    let relax = SCRFD_UPSAMPLE_RELAX * upsample.saturating_sub(1) as f32;
    (SCRFD_CONFIDENCE_THRESHOLD - relax).max(SCRFD_MIN_CONFIDENCE)
}

impl FaceDetector for ScrfdModel {
    fn detect(&mut self, gray: &GrayImage, upsample: u32) -> Result<Vec<Detection>, DetectorError> {
        let faces = self.run(gray, pass_threshold(upsample))?;
        Ok(faces.into_iter().map(|f| f.bbox).collect())
    }
}

impl LandmarkModel for ScrfdModel {
    fn layout(&self) -> LandmarkLayout {
        LandmarkLayout::FIVE_POINT
    }

    fn predict(
        &mut self,
        image: &RgbImage,
        region: &FaceRegion,
    ) -> Result<Option<LandmarkSet>, ModelError> {
        let pad_x = (region.width() as f32 * LANDMARK_CROP_PAD) as i32;
        let pad_y = (region.height() as f32 * LANDMARK_CROP_PAD) as i32;
        let Some(crop) = FaceRegion::new(
            region.x1 - pad_x,
            region.y1 - pad_y,
            region.x2 + pad_x,
            region.y2 + pad_y,
            region.confidence,
        )
        .clipped(image.width(), image.height()) else {
            return Ok(None);
        };

        let sub = image::imageops::crop_imm(
            image,
            crop.x1 as u32,
            crop.y1 as u32,
            crop.width() as u32,
            crop.height() as u32,
        )
        .to_image();
        let gray = enhance::to_grayscale(&sub);

        let faces = self.run(&gray, SCRFD_CONFIDENCE_THRESHOLD)?;
        let best = faces.into_iter().find_map(|f| f.keypoints);

        Ok(best.map(|kps| {
            LandmarkSet::new(kps.to_vec()).translated(crop.x1 as f32, crop.y1 as f32)
        }))
    }
}

/// Letterbox `gray` into a normalized 1×3×640×640 tensor.
fn preprocess(gray: &GrayImage) -> (Array4<f32>, Letterbox) {
    let (width, height) = (gray.width() as f32, gray.height() as f32);
    let size = SCRFD_INPUT_SIZE as f32;
    let scale = (size / width).min(size / height);

    let new_w = ((width * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
    let new_h = ((height * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
    let pad_x = (SCRFD_INPUT_SIZE as u32 - new_w) / 2;
    let pad_y = (SCRFD_INPUT_SIZE as u32 - new_h) / 2;

    let resized = image::imageops::resize(gray, new_w, new_h, FilterType::Triangle);

    // Letterbox padding stands for a mean-valued pixel, which normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));

    for (x, y, p) in resized.enumerate_pixels() {
        let v = (p.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
        let (tx, ty) = ((x + pad_x) as usize, (y + pad_y) as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = v;
        }
    }

    (
        tensor,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

/// Map output tensors to stride slots by name (`score_8`, `bbox_16`, …),
/// falling back to positional order `[scores 8/16/32, bboxes …, kps …]`.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(v) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [v[0], v[1], v[2]]
        }
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode one stride level into frame-space faces above `threshold`.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<ScrfdFace> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut faces = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let Some(b) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid) as f32 * s;
        let ay = (cell / grid) as f32 * s;

        let tl = letterbox.unmap(ax - b[0] * s, ay - b[1] * s);
        let br = letterbox.unmap(ax + b[2] * s, ay + b[3] * s);

        let keypoints = kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| letterbox.unmap(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s))
        });

        faces.push(ScrfdFace {
            bbox: Detection {
                left: tl.x,
                top: tl.y,
                right: br.x,
                bottom: br.y,
                confidence: score,
            },
            keypoints,
        });
    }
    faces
}

/// Greedy non-maximum suppression; output sorted by descending confidence.
fn nms(mut faces: Vec<ScrfdFace>, iou_threshold: f32) -> Vec<ScrfdFace> {
    faces.sort_by(|a, b| b.bbox.confidence.total_cmp(&a.bbox.confidence));

    let mut keep: Vec<ScrfdFace> = Vec::new();
    for face in faces {
        if keep.iter().all(|k| iou(&k.bbox, &face.bbox) <= iou_threshold) {
            keep.push(face);
        }
    }
    keep
}

fn iou(a: &Detection, b: &Detection) -> f32 {
    let inter_w = (a.right.min(b.right) - a.left.max(b.left)).max(0.0);
    let inter_h = (a.bottom.min(b.bottom) - a.top.max(b.top)).max(0.0);
    let inter = inter_w * inter_h;

    let area_a = (a.right - a.left) * (a.bottom - a.top);
    let area_b = (b.right - b.left) * (b.bottom - b.top);
    let union = area_a + area_b - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn face(x: f32, y: f32, w: f32, h: f32, conf: f32) -> ScrfdFace {
        ScrfdFace {
            bbox: Detection {
                left: x,
                top: y,
                right: x + w,
                bottom: y + h,
                confidence: conf,
            },
            keypoints: None,
        }
    }

    #[test]
    fn test_iou_identical() {
        let a = face(0.0, 0.0, 100.0, 100.0, 1.0).bbox;
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = face(0.0, 0.0, 10.0, 10.0, 1.0).bbox;
        let b = face(5.0, 0.0, 10.0, 10.0, 1.0).bbox;
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = face(0.0, 0.0, 10.0, 10.0, 1.0).bbox;
        let b = face(20.0, 20.0, 10.0, 10.0, 1.0).bbox;
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let kept = nms(
            vec![
                face(5.0, 5.0, 100.0, 100.0, 0.8),
                face(0.0, 0.0, 100.0, 100.0, 0.9),
                face(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            SCRFD_NMS_THRESHOLD,
        );
        assert_eq!(kept.len(), 2);
        assert!((kept[0].bbox.confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].bbox.confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], SCRFD_NMS_THRESHOLD).is_empty());
    }

    #[test]
    fn test_pass_threshold_relaxes() {
        assert_eq!(pass_threshold(0), SCRFD_CONFIDENCE_THRESHOLD);
        assert_eq!(pass_threshold(1), SCRFD_CONFIDENCE_THRESHOLD);
        assert!(pass_threshold(2) < SCRFD_CONFIDENCE_THRESHOLD);
        assert_eq!(pass_threshold(50), SCRFD_MIN_CONFIDENCE);
    }

    #[test]
    fn test_preprocess_letterbox() {
        let gray = GrayImage::from_pixel(320, 160, Luma([255]));
        let (tensor, lb) = preprocess(&gray);
        assert_eq!(tensor.shape(), &[1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE]);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 160.0);
        // Padding rows normalize to zero, image rows do not.
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        assert!(tensor[[0, 0, 320, 320]] > 0.9);
    }

    #[test]
    fn test_letterbox_unmap_roundtrip() {
        let lb = Letterbox {
            scale: 2.0,
            pad_x: 0.0,
            pad_y: 160.0,
        };
        let p = lb.unmap(100.0 * 2.0, 50.0 * 2.0 + 160.0);
        assert!((p.x - 100.0).abs() < 1e-4 && (p.y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_stride_single_anchor() {
        let stride = 32;
        let grid = SCRFD_INPUT_SIZE / stride;
        let n = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0; n];
        let mut bboxes = vec![0.0; n * 4];
        let kps = vec![0.0; n * 10];

        // Anchor for cell (row 2, col 3), first anchor of the cell.
        let idx = (2 * grid + 3) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let lb = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let faces = decode_stride(&scores, &bboxes, &kps, stride, &lb, 0.5);

        assert_eq!(faces.len(), 1);
        let b = faces[0].bbox;
        assert_eq!((b.left, b.top, b.right, b.bottom), (64.0, 32.0, 128.0, 96.0));
        let kp = faces[0].keypoints.unwrap();
        assert_eq!(kp[0], Point::new(96.0, 64.0));
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(
            discover_output_indices(&names),
            [(2, 0, 1), (5, 3, 4), (8, 6, 7)]
        );
    }

    #[test]
    fn test_discover_output_indices_positional() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(
            discover_output_indices(&names),
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        );
    }
}
