//! Affine geometry for face alignment.
//!
//! Two ways to build a similarity transform: from a pair of eye centers
//! (rotation + uniform scale about their midpoint), and by least-squares fit
//! of paired landmark sets.

use crate::types::Point;

/// Eye distances below this cannot be scaled to a target distance.
pub const MIN_EYE_DISTANCE: f32 = 1e-3;

const SINGULAR_EPSILON: f32 = 1e-12;

/// A 2×3 affine matrix `[a, b, tx, c, d, ty]`:
/// ```text
/// | a  b  tx |
/// | c  d  ty |
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine2 {
    pub m: [f32; 6],
}

impl Affine2 {
    pub const IDENTITY: Affine2 = Affine2 {
        m: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
    };

    pub fn apply(&self, p: Point) -> Point {
        let [a, b, tx, c, d, ty] = self.m;
        Point::new(a * p.x + b * p.y + tx, c * p.x + d * p.y + ty)
    }

    pub fn determinant(&self) -> f32 {
        self.m[0] * self.m[4] - self.m[1] * self.m[3]
    }

    /// Inverse transform, or `None` if the linear part is singular.
    pub fn inverse(&self) -> Option<Affine2> {
        let [a, b, tx, c, d, ty] = self.m;
        let det = self.determinant();
        if !det.is_finite() || det.abs() < SINGULAR_EPSILON {
            return None;
        }
        let ia = d / det;
        let ib = -b / det;
        let ic = -c / det;
        let id = a / det;
        Some(Affine2 {
            m: [
                ia,
                ib,
                -(ia * tx + ib * ty),
                ic,
                id,
                -(ic * tx + id * ty),
            ],
        })
    }
}

/// Rotation by `angle_deg` about `center` combined with a uniform `scale`.
///
/// Positive angles rotate counter-clockwise on screen (y pointing down),
/// matching OpenCV's `getRotationMatrix2D`.
pub fn rotation_matrix(center: Point, angle_deg: f32, scale: f32) -> Affine2 {
    let theta = angle_deg.to_radians();
    let alpha = scale * theta.cos();
    let beta = scale * theta.sin();
    Affine2 {
        m: [
            alpha,
            beta,
            (1.0 - alpha) * center.x - beta * center.y,
            -beta,
            alpha,
            beta * center.x + (1.0 - alpha) * center.y,
        ],
    }
}

/// Angle in degrees of the line running from `left` to `right`.
pub fn eye_angle(left: Point, right: Point) -> f32 {
    (right.y - left.y).atan2(right.x - left.x).to_degrees()
}

/// Scale that maps the current eye distance onto `desired`.
pub fn eye_scale(left: Point, right: Point, desired: f32) -> Option<f32> {
    let distance = left.distance(&right);
    if !distance.is_finite() || distance < MIN_EYE_DISTANCE {
        return None;
    }
    Some(desired / distance)
}

/// Rotation, scale and pivot that level the eyes at a fixed distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeAlignment {
    pub angle_deg: f32,
    pub scale: f32,
    /// Integer-truncated midpoint of the two eye centers.
    pub center: Point,
}

impl EyeAlignment {
    pub fn from_eyes(left: Point, right: Point, desired_distance: f32) -> Option<Self> {
        let scale = eye_scale(left, right, desired_distance)?;
        let mid = left.midpoint(&right);
        Some(Self {
            angle_deg: eye_angle(left, right),
            scale,
            center: Point::new(mid.x.trunc(), mid.y.trunc()),
        })
    }

    pub fn matrix(&self) -> Affine2 {
        rotation_matrix(self.center, self.angle_deg, self.scale)
    }
}

/// Least-squares 4-DOF similarity transform (scale, rotation, translation)
/// taking `src` onto `dst`.
///
/// Returns `None` when fewer than two pairs are given, the slices differ in
/// length, or the normal equations are singular (e.g. all points coincide).
pub fn estimate_similarity(src: &[Point], dst: &[Point]) -> Option<Affine2> {
    if src.len() != dst.len() || src.len() < 2 {
        return None;
    }

    // Unknowns [a, b, tx, ty]; each pair contributes
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [[0.0f32; 4]; 4];
    let mut atb = [0.0f32; 4];

    for (s, d) in src.iter().zip(dst.iter()) {
        let r1 = [s.x, -s.y, 1.0, 0.0];
        let r2 = [s.y, s.x, 0.0, 1.0];
        for j in 0..4 {
            for k in 0..4 {
                ata[j][k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * d.x + r2[j] * d.y;
        }
    }

    let [a, b, tx, ty] = solve_4x4(ata, atb)?;
    Some(Affine2 {
        m: [a, -b, tx, b, a, ty],
    })
}

/// Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(a: [[f32; 4]; 4], b: [f32; 4]) -> Option<[f32; 4]> {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        m[i][..4].copy_from_slice(&a[i]);
        m[i][4] = b[i];
    }

    for col in 0..4 {
        let pivot_row = (col..4)
            .max_by(|&x, &y| m[x][col].abs().total_cmp(&m[y][col].abs()))
            .unwrap_or(col);
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        if !pivot.is_finite() || pivot.abs() < SINGULAR_EPSILON {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let mut acc = m[i][4];
        for j in (i + 1)..4 {
            acc -= m[i][j] * x[j];
        }
        x[i] = acc / m[i][i];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Point, b: Point, tol: f32) -> bool {
        (a.x - b.x).abs() < tol && (a.y - b.y).abs() < tol
    }

    #[test]
    fn test_eye_angle_level() {
        assert!(eye_angle(Point::new(10.0, 20.0), Point::new(50.0, 20.0)).abs() < 1e-6);
    }

    #[test]
    fn test_eye_angle_tilted() {
        let angle = eye_angle(Point::new(0.0, 0.0), Point::new(10.0, 10.0));
        assert!((angle - 45.0).abs() < 1e-4, "angle = {angle}");
    }

    #[test]
    fn test_eye_scale() {
        let s = eye_scale(Point::new(0.0, 0.0), Point::new(35.0, 0.0), 70.0).unwrap();
        assert!((s - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_eye_scale_degenerate() {
        let p = Point::new(42.0, 42.0);
        assert!(eye_scale(p, p, 70.0).is_none());
        assert!(EyeAlignment::from_eyes(p, p, 70.0).is_none());
    }

    #[test]
    fn test_rotation_matrix_identity() {
        let m = rotation_matrix(Point::new(30.0, 40.0), 0.0, 1.0);
        for (got, want) in m.m.iter().zip(Affine2::IDENTITY.m.iter()) {
            assert!((got - want).abs() < 1e-6, "{:?}", m.m);
        }
    }

    #[test]
    fn test_rotation_matrix_fixes_center() {
        let center = Point::new(64.0, 48.0);
        let m = rotation_matrix(center, 33.0, 1.7);
        assert!(close(m.apply(center), center, 1e-3));
    }

    #[test]
    fn test_eye_alignment_levels_eyes() {
        let left = Point::new(40.0, 50.0);
        let right = Point::new(60.0, 62.0);
        let align = EyeAlignment::from_eyes(left, right, 70.0).unwrap();
        assert_eq!(align.center, Point::new(50.0, 56.0));

        let m = align.matrix();
        let l = m.apply(left);
        let r = m.apply(right);
        assert!((l.y - r.y).abs() < 1e-3, "eyes not level: {l:?} {r:?}");
        assert!((l.distance(&r) - 70.0).abs() < 1e-2);
    }

    #[test]
    fn test_midpoint_truncated() {
        let align =
            EyeAlignment::from_eyes(Point::new(10.6, 20.9), Point::new(30.7, 20.9), 70.0).unwrap();
        assert_eq!(align.center, Point::new(20.0, 20.0));
    }

    #[test]
    fn test_inverse_roundtrip() {
        let m = rotation_matrix(Point::new(12.0, 7.0), -21.0, 0.8);
        let inv = m.inverse().unwrap();
        let p = Point::new(101.0, -3.5);
        assert!(close(inv.apply(m.apply(p)), p, 1e-3));
    }

    #[test]
    fn test_inverse_singular() {
        let m = Affine2 {
            m: [0.0, 0.0, 5.0, 0.0, 0.0, 5.0],
        };
        assert!(m.inverse().is_none());
    }

    #[test]
    fn test_estimate_identity() {
        let pts = [
            Point::new(38.0, 51.0),
            Point::new(73.0, 51.0),
            Point::new(56.0, 71.0),
            Point::new(41.0, 92.0),
            Point::new(70.0, 92.0),
        ];
        let m = estimate_similarity(&pts, &pts).unwrap();
        assert!((m.m[0] - 1.0).abs() < 1e-4, "a = {}", m.m[0]);
        assert!(m.m[1].abs() < 1e-4);
        assert!(m.m[2].abs() < 1e-2);
        assert!(m.m[5].abs() < 1e-2);
    }

    #[test]
    fn test_estimate_half_scale() {
        let dst = [
            Point::new(38.0, 51.0),
            Point::new(73.0, 51.0),
            Point::new(56.0, 71.0),
        ];
        let src: Vec<Point> = dst.iter().map(|p| Point::new(p.x * 2.0, p.y * 2.0)).collect();
        let m = estimate_similarity(&src, &dst).unwrap();
        assert!((m.m[0] - 0.5).abs() < 1e-3, "a = {}", m.m[0]);
    }

    #[test]
    fn test_estimate_degenerate() {
        let p = [Point::new(5.0, 5.0); 5];
        assert!(estimate_similarity(&p, &p).is_none());
        assert!(estimate_similarity(&p[..1], &p[..1]).is_none());
    }
}
