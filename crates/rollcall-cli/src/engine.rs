//! Matching policy: which face to use, how to identify it, how to enroll it.

use image::RgbImage;
use rollcall_core::{
    EmbeddingModel, ExtractError, FaceDetector, FaceLocator, FaceRegion, FeatureExtractor,
    LandmarkModel,
};
use rollcall_store::{IdentityStore, Profile, StoreError};
use serde::Serialize;
use std::fmt;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("no face detected in the image")]
    NoFace,
    #[error("{0} faces detected; enrollment needs exactly one")]
    MultipleFaces(usize),
    #[error("identity {0} already exists")]
    DuplicateId(i64),
    #[error("landmark detection failed: {0}")]
    LandmarkFailure(ExtractError),
    #[error("feature extraction failed: {0}")]
    ExtractionFailed(ExtractError),
    #[error("invalid profile: {0}")]
    InvalidProfile(String),
    #[error("storage error: {0}")]
    Storage(StoreError),
    #[error("cannot encode reference image: {0}")]
    Encode(#[from] image::ImageError),
}

impl From<ExtractError> for EnrollError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::NoLandmarks | ExtractError::LandmarkCount { .. } => {
                EnrollError::LandmarkFailure(e)
            }
            other => EnrollError::ExtractionFailed(other),
        }
    }
}

impl From<StoreError> for EnrollError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateId(id) => EnrollError::DuplicateId(id),
            StoreError::InvalidProfile(reason) => EnrollError::InvalidProfile(reason),
            other => EnrollError::Storage(other),
        }
    }
}

/// Result of one identification attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    Identified {
        id: i64,
        name: String,
        similarity: f32,
        region: FaceRegion,
    },
    Unidentified {
        region: FaceRegion,
    },
    DetectionFailed,
    ExtractionFailed,
}

impl fmt::Display for MatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchOutcome::Identified {
                id,
                name,
                similarity,
                ..
            } => write!(f, "identified {name} (id {id}, similarity {similarity:.3})"),
            MatchOutcome::Unidentified { .. } => f.write_str("face not recognized"),
            MatchOutcome::DetectionFailed => f.write_str("no face detected"),
            MatchOutcome::ExtractionFailed => f.write_str("face found but features could not be extracted"),
        }
    }
}

/// The face to act on: the largest by area, first one on ties.
pub fn best_candidate(regions: &[FaceRegion]) -> Option<&FaceRegion> {
    let mut best: Option<&FaceRegion> = None;
    for region in regions {
        if best.map_or(true, |b| region.area() > b.area()) {
            best = Some(region);
        }
    }
    best
}

/// Identify the main face in a still image.
pub fn identify<D, L, E>(
    image: &RgbImage,
    locator: &mut FaceLocator<D>,
    extractor: &mut FeatureExtractor<L, E>,
    store: &IdentityStore,
    threshold: f32,
) -> Result<MatchOutcome, StoreError>
where
    D: FaceDetector,
    L: LandmarkModel,
    E: EmbeddingModel,
{
    let regions = locator.locate(image);
    identify_in(image, &regions, extractor, store, threshold)
}

/// Identify the main face in a live frame captured at `now`.
pub fn identify_frame<D, L, E>(
    frame: &RgbImage,
    now: Instant,
    locator: &mut FaceLocator<D>,
    extractor: &mut FeatureExtractor<L, E>,
    store: &IdentityStore,
    threshold: f32,
) -> Result<MatchOutcome, StoreError>
where
    D: FaceDetector,
    L: LandmarkModel,
    E: EmbeddingModel,
{
    let regions = locator.locate_frame(frame, now);
    identify_in(frame, &regions, extractor, store, threshold)
}

fn identify_in<L, E>(
    image: &RgbImage,
    regions: &[FaceRegion],
    extractor: &mut FeatureExtractor<L, E>,
    store: &IdentityStore,
    threshold: f32,
) -> Result<MatchOutcome, StoreError>
where
    L: LandmarkModel,
    E: EmbeddingModel,
{
    let Some(region) = best_candidate(regions).copied() else {
        return Ok(MatchOutcome::DetectionFailed);
    };

    let features = match extractor.extract(image, &region) {
        Ok(features) => features,
        Err(e) => {
            tracing::debug!(error = %e, "identify: extraction failed");
            return Ok(MatchOutcome::ExtractionFailed);
        }
    };

    let outcome = match store.find_match(&features, threshold)? {
        Some(m) => MatchOutcome::Identified {
            id: m.id,
            name: m.name,
            similarity: m.similarity,
            region,
        },
        None => MatchOutcome::Unidentified { region },
    };
    tracing::info!(faces = regions.len(), %outcome, "identify");
    Ok(outcome)
}

/// Enroll the face in `region` under `profile`. Returns the stored id.
pub fn enroll<L, E>(
    image: &RgbImage,
    region: &FaceRegion,
    extractor: &mut FeatureExtractor<L, E>,
    store: &IdentityStore,
    profile: &Profile,
) -> Result<i64, EnrollError>
where
    L: LandmarkModel,
    E: EmbeddingModel,
{
    profile.validate().map_err(EnrollError::InvalidProfile)?;
    if let Some(id) = profile.id {
        if store.exists(id)? {
            return Err(EnrollError::DuplicateId(id));
        }
    }

    let (aligned, features) = extractor.align_and_extract(image, region)?;
    let png = aligned.encode_png()?;
    let id = store.insert(profile, &features, Some(png.as_slice()))?;

    tracing::info!(
        id,
        name = %profile.name,
        model = extractor.model_version(),
        "enrollment complete"
    );
    Ok(id)
}

/// Enroll from a whole image, which must contain exactly one face.
pub fn enroll_image<D, L, E>(
    image: &RgbImage,
    locator: &mut FaceLocator<D>,
    extractor: &mut FeatureExtractor<L, E>,
    store: &IdentityStore,
    profile: &Profile,
) -> Result<i64, EnrollError>
where
    D: FaceDetector,
    L: LandmarkModel,
    E: EmbeddingModel,
{
    let regions = locator.locate(image);
    match regions.as_slice() {
        [] => Err(EnrollError::NoFace),
        [region] => enroll(image, region, extractor, store, profile),
        many => Err(EnrollError::MultipleFaces(many.len())),
    }
}
