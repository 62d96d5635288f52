//! Face location: enhancement, two-pass detection, margin padding, and a
//! short-lived result cache for live feeds.

use crate::detector::DetectorError;
use crate::enhance;
use crate::types::FaceRegion;
use image::{GrayImage, RgbImage};
use std::time::{Duration, Instant};

/// How long a live-feed detection stays reusable.
pub const DEFAULT_CACHE_WINDOW: Duration = Duration::from_millis(500);

/// Raw detector output in image coordinates. May extend past the borders.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub confidence: f32,
}

/// A face detection capability.
pub trait FaceDetector {
    /// Detect faces in an enhanced grayscale image.
    ///
    /// `upsample` 0 is the cheapest pass; each level trades speed for recall
    /// on small or low-contrast faces.
    fn detect(&mut self, gray: &GrayImage, upsample: u32) -> Result<Vec<Detection>, DetectorError>;
}

/// Padding added around a raw detection, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Margin {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Margin {
    /// Standard pass: extra room above the box for the forehead.
    pub const STANDARD: Margin = Margin {
        left: 10,
        top: 20,
        right: 10,
        bottom: 10,
    };

    pub const PERMISSIVE: Margin = Margin {
        left: 20,
        top: 30,
        right: 20,
        bottom: 20,
    };

    /// Pad `d` and clip it to the image; `None` if nothing remains.
    pub fn pad(&self, d: &Detection, width: u32, height: u32) -> Option<FaceRegion> {
        if ![d.left, d.top, d.right, d.bottom].iter().all(|v| v.is_finite()) {
            return None;
        }
        // Padded in f32 so far-off boxes saturate at the cast instead of overflowing.
        let edge = |v: f32, pad: i32| (v.round() + pad as f32) as i32;
        FaceRegion::new(
            edge(d.left, -self.left),
            edge(d.top, -self.top),
            edge(d.right, self.right),
            edge(d.bottom, self.bottom),
            d.confidence,
        )
        .clipped(width, height)
    }
}

/// Detector settings for one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocatorPass {
    pub upsample: u32,
    pub margin: Margin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocatorConfig {
    pub standard: LocatorPass,
    /// Retried once when the standard pass finds nothing.
    pub permissive: LocatorPass,
    pub cache_window: Duration,
    /// Equalize live frames before the detection boost.
    pub enhance_live: bool,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            standard: LocatorPass {
                upsample: 1,
                margin: Margin::STANDARD,
            },
            permissive: LocatorPass {
                upsample: 2,
                margin: Margin::PERMISSIVE,
            },
            cache_window: DEFAULT_CACHE_WINDOW,
            enhance_live: false,
        }
    }
}

/// Last live-feed result and when it was produced.
#[derive(Debug)]
pub struct DetectionCache {
    window: Duration,
    last: Option<(Instant, Vec<FaceRegion>)>,
}

impl DetectionCache {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Cached regions if they are younger than the window at `now`.
    pub fn get(&self, now: Instant) -> Option<&[FaceRegion]> {
        let (at, regions) = self.last.as_ref()?;
        (now.saturating_duration_since(*at) < self.window).then_some(regions.as_slice())
    }

    pub fn put(&mut self, now: Instant, regions: Vec<FaceRegion>) {
        self.last = Some((now, regions));
    }

    pub fn clear(&mut self) {
        self.last = None;
    }
}

/// Finds face regions with one detector and owns that detector's cache.
///
/// Both entry points take `&mut self`, so a locator shared across threads
/// must sit behind a lock; one locator per camera keeps caches independent.
pub struct FaceLocator<D> {
    detector: D,
    config: LocatorConfig,
    cache: DetectionCache,
}

impl<D: FaceDetector> FaceLocator<D> {
    pub fn new(detector: D) -> Self {
        Self::with_config(detector, LocatorConfig::default())
    }

    pub fn with_config(detector: D, config: LocatorConfig) -> Self {
        Self {
            detector,
            cache: DetectionCache::new(config.cache_window),
            config,
        }
    }

    pub fn cache(&self) -> &DetectionCache {
        &self.cache
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Locate faces in a still image. Always runs detection; never touches
    /// the cache.
    pub fn locate(&mut self, image: &RgbImage) -> Vec<FaceRegion> {
        self.detect_fresh(image, enhance::detection_input)
    }

    /// Locate faces in a live frame captured at `now`, reusing the previous
    /// result while it is fresh.
    pub fn locate_frame(&mut self, frame: &RgbImage, now: Instant) -> Vec<FaceRegion> {
        if let Some(regions) = self.cache.get(now) {
            tracing::trace!(count = regions.len(), "reusing cached detection");
            return regions.to_vec();
        }
        let prepare = if self.config.enhance_live {
            enhance::enhance_frame
        } else {
            enhance::detection_input
        };
        let regions = self.detect_fresh(frame, prepare);
        self.cache.put(now, regions.clone());
        regions
    }

    fn detect_fresh(
        &mut self,
        image: &RgbImage,
        prepare: fn(&RgbImage) -> GrayImage,
    ) -> Vec<FaceRegion> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            tracing::warn!(width, height, "cannot locate faces in an empty image");
            return Vec::new();
        }

        let gray = prepare(image);

        let regions = self.run_pass(&gray, self.config.standard);
        if !regions.is_empty() {
            return regions;
        }

        tracing::debug!(
            upsample = self.config.permissive.upsample,
            "no face on standard pass, retrying"
        );
        self.run_pass(&gray, self.config.permissive)
    }

    fn run_pass(&mut self, gray: &GrayImage, pass: LocatorPass) -> Vec<FaceRegion> {
        let detections = match self.detector.detect(gray, pass.upsample) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, upsample = pass.upsample, "face detection failed");
                return Vec::new();
            }
        };

        let regions: Vec<FaceRegion> = detections
            .iter()
            .filter_map(|d| pass.margin.pad(d, gray.width(), gray.height()))
            .collect();

        tracing::debug!(
            raw = detections.len(),
            kept = regions.len(),
            upsample = pass.upsample,
            "detection pass"
        );
        regions
    }
}
