//! Feature extraction: landmarks, aligned crop, normalized embedding.
//!
//! The landmark predictor and the embedding network are capabilities behind
//! [`LandmarkModel`] and [`EmbeddingModel`]; any backend honoring the
//! contracts can be plugged in without touching alignment or matching.

use crate::alignment::{self, AlignedFace, DESIRED_EYE_DISTANCE};
use crate::types::{FaceRegion, FeatureVector, LandmarkLayout, LandmarkSet};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}; place the ONNX file in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("unsupported landmark layout ({0} points)")]
    UnsupportedLayout(usize),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates facial landmarks inside a face region.
pub trait LandmarkModel {
    /// Index layout of the returned points.
    fn layout(&self) -> LandmarkLayout;

    /// Predict landmarks for the face in `region`, in image coordinates.
    ///
    /// `Ok(None)` when the model does not converge on a face shape.
    fn predict(
        &mut self,
        image: &RgbImage,
        region: &FaceRegion,
    ) -> Result<Option<LandmarkSet>, ModelError>;
}

/// Maps a face (image + landmarks) to a raw, unnormalized embedding.
pub trait EmbeddingModel {
    /// Identifier of the weights; vectors from different versions are not comparable.
    fn model_version(&self) -> &str;

    fn embed(
        &mut self,
        image: &RgbImage,
        landmarks: &LandmarkSet,
        layout: &LandmarkLayout,
    ) -> Result<Vec<f32>, ModelError>;
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("no facial landmarks found in the face region")]
    NoLandmarks,
    #[error("landmark model returned {got} points, layout expects {expected}")]
    LandmarkCount { expected: usize, got: usize },
    #[error("degenerate face geometry (coincident eyes or empty crop)")]
    DegenerateGeometry,
    #[error("feature vector has zero or non-finite norm")]
    DegenerateVector,
    #[error("model error: {0}")]
    Model(#[from] ModelError),
}

/// Landmark → alignment → embedding pipeline over one pair of models.
pub struct FeatureExtractor<L, E> {
    landmarker: L,
    embedder: E,
    desired_eye_distance: f32,
}

impl<L: LandmarkModel, E: EmbeddingModel> FeatureExtractor<L, E> {
    pub fn new(landmarker: L, embedder: E) -> Self {
        Self {
            landmarker,
            embedder,
            desired_eye_distance: DESIRED_EYE_DISTANCE,
        }
    }

    pub fn with_eye_distance(mut self, desired: f32) -> Self {
        self.desired_eye_distance = desired;
        self
    }

    pub fn layout(&self) -> LandmarkLayout {
        self.landmarker.layout()
    }

    pub fn model_version(&self) -> &str {
        self.embedder.model_version()
    }

    /// Landmarks for the face in `region`.
    pub fn landmarks(
        &mut self,
        image: &RgbImage,
        region: &FaceRegion,
    ) -> Result<LandmarkSet, ExtractError> {
        let region = region
            .clipped(image.width(), image.height())
            .ok_or(ExtractError::DegenerateGeometry)?;

        let set = self
            .landmarker
            .predict(image, &region)
            .map_err(|e| {
                tracing::warn!(error = %e, "landmark model failed");
                ExtractError::Model(e)
            })?
            .ok_or(ExtractError::NoLandmarks)?;

        let expected = self.landmarker.layout().len;
        if set.len() != expected {
            return Err(ExtractError::LandmarkCount {
                expected,
                got: set.len(),
            });
        }
        Ok(set)
    }

    /// L2-normalized feature vector for the face in `region`.
    pub fn extract(
        &mut self,
        image: &RgbImage,
        region: &FaceRegion,
    ) -> Result<FeatureVector, ExtractError> {
        let landmarks = self.landmarks(image, region)?;
        self.embed(image, &landmarks)
    }

    /// Eye-leveled 112×112 crop of the face in `region`.
    pub fn align(
        &mut self,
        image: &RgbImage,
        region: &FaceRegion,
    ) -> Result<AlignedFace, ExtractError> {
        let landmarks = self.landmarks(image, region)?;
        self.align_with(image, region, &landmarks)
    }

    /// Aligned crop and feature vector from a single landmark pass.
    pub fn align_and_extract(
        &mut self,
        image: &RgbImage,
        region: &FaceRegion,
    ) -> Result<(AlignedFace, FeatureVector), ExtractError> {
        let landmarks = self.landmarks(image, region)?;
        let aligned = self.align_with(image, region, &landmarks)?;
        let features = self.embed(image, &landmarks)?;
        Ok((aligned, features))
    }

    fn align_with(
        &self,
        image: &RgbImage,
        region: &FaceRegion,
        landmarks: &LandmarkSet,
    ) -> Result<AlignedFace, ExtractError> {
        let (left, right) = landmarks
            .eye_centers(&self.landmarker.layout())
            .ok_or(ExtractError::DegenerateGeometry)?;
        alignment::align_by_eyes(image, left, right, region, self.desired_eye_distance)
            .ok_or(ExtractError::DegenerateGeometry)
    }

    fn embed(
        &mut self,
        image: &RgbImage,
        landmarks: &LandmarkSet,
    ) -> Result<FeatureVector, ExtractError> {
        let layout = self.landmarker.layout();
        let raw = self.embedder.embed(image, landmarks, &layout).map_err(|e| {
            tracing::warn!(error = %e, "embedding model failed");
            ExtractError::Model(e)
        })?;
        let features = FeatureVector::normalize(&raw).ok_or(ExtractError::DegenerateVector)?;
        tracing::debug!(
            dim = features.dimension(),
            model = self.embedder.model_version(),
            "extracted feature vector"
        );
        Ok(features)
    }
}
