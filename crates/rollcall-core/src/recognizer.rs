//! ArcFace embedding model via ONNX Runtime.
//!
//! Reduces the landmark set to five points, warps the face onto the ArcFace
//! reference positions and returns the raw 512-d network output.
//! Normalization is left to the extractor.

use crate::alignment;
use crate::extractor::{EmbeddingModel, ModelError};
use crate::types::{LandmarkLayout, LandmarkSet};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
// Symmetric normalization, unlike SCRFD's 128.0.
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

pub struct ArcFaceModel {
    session: Session,
}

impl ArcFaceModel {
    pub fn load(model_path: &Path) -> Result<Self, ModelError> {
        if !model_path.exists() {
            return Err(ModelError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// NCHW float tensor from a 112×112 RGB crop.
    fn preprocess(aligned: &RgbImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, p) in aligned.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if x >= size || y >= size {
                continue;
            }
            for c in 0..3 {
                tensor[[0, c, y, x]] = (p.0[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }
        tensor
    }
}

impl EmbeddingModel for ArcFaceModel {
    fn model_version(&self) -> &str {
        ARCFACE_MODEL_VERSION
    }

    fn embed(
        &mut self,
        image: &RgbImage,
        landmarks: &LandmarkSet,
        layout: &LandmarkLayout,
    ) -> Result<Vec<f32>, ModelError> {
        let five = landmarks
            .five_point(layout)
            .ok_or(ModelError::UnsupportedLayout(landmarks.len()))?;
        let aligned = alignment::align_five_point(image, &five).ok_or_else(|| {
            ModelError::InferenceFailed("landmarks do not define a similarity transform".into())
        })?;

        let input = Self::preprocess(&aligned.image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(ModelError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        Ok(raw.to_vec())
    }
}
