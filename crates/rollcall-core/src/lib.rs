//! rollcall-core: face location, landmark alignment and feature extraction.
//!
//! Models are capabilities behind traits ([`FaceDetector`], [`LandmarkModel`],
//! [`EmbeddingModel`]); SCRFD and ArcFace backends run on ONNX Runtime.

pub mod alignment;
pub mod detector;
pub mod enhance;
pub mod extractor;
pub mod geometry;
pub mod locator;
pub mod matcher;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use alignment::AlignedFace;
pub use detector::{DetectorError, ScrfdModel};
pub use extractor::{EmbeddingModel, ExtractError, FeatureExtractor, LandmarkModel, ModelError};
pub use locator::{Detection, DetectionCache, FaceDetector, FaceLocator, LocatorConfig};
pub use matcher::{CosineMatcher, GalleryEntry, IdentityMatch, Matcher};
pub use recognizer::ArcFaceModel;
pub use types::{FaceRegion, FeatureVector, LandmarkLayout, LandmarkSet, Point};

/// SCRFD detection model file name inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name inside the model directory.
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Model directory used when none is configured.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}
