use serde::Serialize;
use std::ops::Range;

/// Norms at or below this are treated as zero.
pub const MIN_NORM: f32 = 1e-6;

/// A 2D point in image pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn midpoint(&self, other: &Point) -> Point {
        Point::new((self.x + other.x) / 2.0, (self.y + other.y) / 2.0)
    }
}

/// Candidate face rectangle in pixel coordinates, `x1 < x2` and `y1 < y2`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FaceRegion {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
}

impl FaceRegion {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32, confidence: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// Widened to i64: corners may sit at opposite ends of the i32 range.
    pub fn width(&self) -> i64 {
        i64::from(self.x2) - i64::from(self.x1)
    }

    pub fn height(&self) -> i64 {
        i64::from(self.y2) - i64::from(self.y1)
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            return 0;
        }
        self.width() * self.height()
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    /// Clip to `[0, width] × [0, height]`. Returns `None` when nothing is left.
    pub fn clipped(&self, width: u32, height: u32) -> Option<FaceRegion> {
        let w = i32::try_from(width).unwrap_or(i32::MAX);
        let h = i32::try_from(height).unwrap_or(i32::MAX);
        let region = FaceRegion {
            x1: self.x1.clamp(0, w),
            y1: self.y1.clamp(0, h),
            x2: self.x2.clamp(0, w),
            y2: self.y2.clamp(0, h),
            confidence: self.confidence,
        };
        (!region.is_empty()).then_some(region)
    }
}

/// Positional meaning of a landmark model's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LandmarkLayout {
    /// Number of points the model produces.
    pub len: usize,
    pub left_eye: Range<usize>,
    pub right_eye: Range<usize>,
}

impl LandmarkLayout {
    /// 68-point iBUG annotation (dlib shape predictor).
    pub const IBUG_68: LandmarkLayout = LandmarkLayout {
        len: 68,
        left_eye: 36..42,
        right_eye: 42..48,
    };

    /// Five-point layout: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub const FIVE_POINT: LandmarkLayout = LandmarkLayout {
        len: 5,
        left_eye: 0..1,
        right_eye: 1..2,
    };
}

const IBUG_NOSE_TIP: usize = 30;
const IBUG_MOUTH_LEFT: usize = 48;
const IBUG_MOUTH_RIGHT: usize = 54;

/// Landmark points for one face, indexed according to a [`LandmarkLayout`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LandmarkSet {
    points: Vec<Point>,
}

impl LandmarkSet {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Mean position of the points in `range`.
    pub fn cluster_center(&self, range: Range<usize>) -> Option<Point> {
        let cluster = self.points.get(range)?;
        if cluster.is_empty() {
            return None;
        }
        let n = cluster.len() as f32;
        let (sx, sy) = cluster
            .iter()
            .fold((0.0f32, 0.0f32), |(sx, sy), p| (sx + p.x, sy + p.y));
        Some(Point::new(sx / n, sy / n))
    }

    /// Left and right eye centers under `layout`.
    pub fn eye_centers(&self, layout: &LandmarkLayout) -> Option<(Point, Point)> {
        let left = self.cluster_center(layout.left_eye.clone())?;
        let right = self.cluster_center(layout.right_eye.clone())?;
        Some((left, right))
    }

    /// Reduce to the five canonical points used by ArcFace-style alignment.
    pub fn five_point(&self, layout: &LandmarkLayout) -> Option<[Point; 5]> {
        if *layout == LandmarkLayout::FIVE_POINT && self.len() == 5 {
            return Some([
                self.points[0],
                self.points[1],
                self.points[2],
                self.points[3],
                self.points[4],
            ]);
        }
        if *layout == LandmarkLayout::IBUG_68 && self.len() == 68 {
            let (left, right) = self.eye_centers(layout)?;
            return Some([
                left,
                right,
                self.points[IBUG_NOSE_TIP],
                self.points[IBUG_MOUTH_LEFT],
                self.points[IBUG_MOUTH_RIGHT],
            ]);
        }
        None
    }

    pub fn translated(&self, dx: f32, dy: f32) -> LandmarkSet {
        LandmarkSet {
            points: self
                .points
                .iter()
                .map(|p| Point::new(p.x + dx, p.y + dy))
                .collect(),
        }
    }
}

/// L2-normalized face embedding.
///
/// Only constructible through [`FeatureVector::normalize`], so every value
/// of this type has unit norm.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    values: Vec<f32>,
}

impl FeatureVector {
    /// Divide `raw` by its L2 norm.
    ///
    /// Returns `None` for an empty input, non-finite components, or a norm
    /// too close to zero to divide by.
    pub fn normalize(raw: &[f32]) -> Option<Self> {
        if raw.is_empty() || raw.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
        if !norm.is_finite() || norm <= MIN_NORM {
            return None;
        }
        Some(Self {
            values: raw.iter().map(|v| v / norm).collect(),
        })
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Cosine similarity in [-1, 1], or `None` if the dimensions differ.
    pub fn similarity(&self, other: &FeatureVector) -> Option<f32> {
        if self.dimension() != other.dimension() {
            return None;
        }
        Some(cosine_similarity(&self.values, &other.values))
    }
}

/// `(a·b) / (‖a‖‖b‖)`, or 0 when either norm is zero.
///
/// Always processes every dimension of the shorter input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        (dot / denom).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}
