//! Face alignment: warp, crop and resize to a canonical 112×112 crop.
//!
//! Eye-based alignment levels the eyes at a fixed distance and crops the
//! detected rectangle. Five-point alignment fits the ArcFace reference
//! landmarks by least squares and is what the ArcFace backend feeds its
//! network.

use crate::geometry::{estimate_similarity, Affine2, EyeAlignment};
use crate::types::{FaceRegion, Point};
use image::imageops::FilterType;
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

pub const ALIGNED_SIZE: u32 = 112;

/// Default target distance between eye centers after alignment, in pixels.
pub const DESIRED_EYE_DISTANCE: f32 = 70.0;

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS_112: [Point; 5] = [
    Point::new(38.2946, 51.6963), // left eye
    Point::new(73.5318, 51.5014), // right eye
    Point::new(56.0252, 71.7366), // nose
    Point::new(41.5493, 92.3655), // left mouth
    Point::new(70.7299, 92.2041), // right mouth
];

/// A normalized face crop, always `ALIGNED_SIZE × ALIGNED_SIZE`.
#[derive(Debug, Clone)]
pub struct AlignedFace {
    pub image: RgbImage,
}

impl AlignedFace {
    /// PNG encoding, used as the stored reference image.
    pub fn encode_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut buf = Vec::new();
        self.image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
        Ok(buf)
    }
}

/// Apply `matrix` (source → destination) to `src`, producing an
/// `out_width × out_height` image.
///
/// Bilinear sampling; pixels that map outside the source are black.
/// Returns `None` if the matrix cannot be inverted.
pub fn warp_affine(
    src: &RgbImage,
    matrix: &Affine2,
    out_width: u32,
    out_height: u32,
) -> Option<RgbImage> {
    let inv = matrix.inverse()?;
    let (w, h) = (src.width() as i64, src.height() as i64);

    let sample = |x: i64, y: i64| -> [f32; 3] {
        if x >= 0 && x < w && y >= 0 && y < h {
            let p = src.get_pixel(x as u32, y as u32).0;
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let out = RgbImage::from_fn(out_width, out_height, |ox, oy| {
        let s = inv.apply(Point::new(ox as f32, oy as f32));
        if !s.x.is_finite() || !s.y.is_finite() {
            return Rgb([0, 0, 0]);
        }
        let x0 = s.x.floor() as i64;
        let y0 = s.y.floor() as i64;
        let fx = s.x - x0 as f32;
        let fy = s.y - y0 as f32;

        let tl = sample(x0, y0);
        let tr = sample(x0 + 1, y0);
        let bl = sample(x0, y0 + 1);
        let br = sample(x0 + 1, y0 + 1);

        let mut px = [0u8; 3];
        for c in 0..3 {
            let v = tl[c] * (1.0 - fx) * (1.0 - fy)
                + tr[c] * fx * (1.0 - fy)
                + bl[c] * (1.0 - fx) * fy
                + br[c] * fx * fy;
            px[c] = v.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(px)
    });

    Some(out)
}

/// Crop `region` (clipped to the image) and resize it to `size × size`.
pub fn crop_resize(image: &RgbImage, region: &FaceRegion, size: u32) -> Option<RgbImage> {
    let r = region.clipped(image.width(), image.height())?;
    let crop = image::imageops::crop_imm(
        image,
        r.x1 as u32,
        r.y1 as u32,
        r.width() as u32,
        r.height() as u32,
    )
    .to_image();
    Some(image::imageops::resize(&crop, size, size, FilterType::Triangle))
}

/// Rotate and scale the whole image so the eyes are level and
/// `desired_distance` apart, then crop `region` and resize to 112×112.
///
/// `None` when the eyes coincide or the crop is empty.
pub fn align_by_eyes(
    image: &RgbImage,
    left_eye: Point,
    right_eye: Point,
    region: &FaceRegion,
    desired_distance: f32,
) -> Option<AlignedFace> {
    let params = EyeAlignment::from_eyes(left_eye, right_eye, desired_distance)?;
    tracing::trace!(
        angle = params.angle_deg,
        scale = params.scale,
        cx = params.center.x,
        cy = params.center.y,
        "eye alignment"
    );
    let warped = warp_affine(image, &params.matrix(), image.width(), image.height())?;
    let face = crop_resize(&warped, region, ALIGNED_SIZE)?;
    Some(AlignedFace { image: face })
}

/// Warp five landmarks onto the ArcFace reference positions.
pub fn align_five_point(image: &RgbImage, landmarks: &[Point; 5]) -> Option<AlignedFace> {
    let matrix = estimate_similarity(landmarks, &REFERENCE_LANDMARKS_112)?;
    let face = warp_affine(image, &matrix, ALIGNED_SIZE, ALIGNED_SIZE)?;
    Some(AlignedFace { image: face })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::rotation_matrix;

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]))
    }

    #[test]
    fn test_warp_identity_preserves_pixels() {
        let img = gradient(40, 30);
        let out = warp_affine(&img, &Affine2::IDENTITY, 40, 30).unwrap();
        assert_eq!(out, img);
    }

    #[test]
    fn test_warp_output_size() {
        let img = gradient(64, 48);
        let m = rotation_matrix(Point::new(32.0, 24.0), 15.0, 1.3);
        let out = warp_affine(&img, &m, 112, 112).unwrap();
        assert_eq!(out.dimensions(), (112, 112));
    }

    #[test]
    fn test_warp_singular_matrix() {
        let img = gradient(10, 10);
        let m = Affine2 { m: [0.0; 6] };
        assert!(warp_affine(&img, &m, 10, 10).is_none());
    }

    #[test]
    fn test_warp_out_of_bounds_is_black() {
        let img = RgbImage::from_pixel(10, 10, Rgb([255, 255, 255]));
        let shift = Affine2 {
            m: [1.0, 0.0, 100.0, 0.0, 1.0, 100.0],
        };
        let out = warp_affine(&img, &shift, 10, 10).unwrap();
        assert!(out.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn test_crop_resize_size() {
        let img = gradient(200, 150);
        let region = FaceRegion::new(20, 10, 120, 140, 1.0);
        let out = crop_resize(&img, &region, ALIGNED_SIZE).unwrap();
        assert_eq!(out.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
    }

    #[test]
    fn test_crop_resize_outside_image() {
        let img = gradient(50, 50);
        let region = FaceRegion::new(60, 60, 90, 90, 1.0);
        assert!(crop_resize(&img, &region, ALIGNED_SIZE).is_none());
    }

    #[test]
    fn test_align_by_eyes_output() {
        let img = gradient(200, 200);
        let region = FaceRegion::new(50, 40, 150, 160, 0.9);
        let face = align_by_eyes(
            &img,
            Point::new(80.0, 80.0),
            Point::new(120.0, 84.0),
            &region,
            DESIRED_EYE_DISTANCE,
        )
        .unwrap();
        assert_eq!(face.image.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
    }

    #[test]
    fn test_align_by_eyes_degenerate() {
        let img = gradient(100, 100);
        let region = FaceRegion::new(10, 10, 90, 90, 0.9);
        let eye = Point::new(50.0, 50.0);
        assert!(align_by_eyes(&img, eye, eye, &region, DESIRED_EYE_DISTANCE).is_none());
    }

    #[test]
    fn test_align_does_not_mutate_input() {
        let img = gradient(120, 120);
        let before = img.clone();
        let region = FaceRegion::new(10, 10, 110, 110, 0.9);
        let _ = align_by_eyes(
            &img,
            Point::new(40.0, 50.0),
            Point::new(80.0, 45.0),
            &region,
            DESIRED_EYE_DISTANCE,
        );
        assert_eq!(img, before);
    }

    #[test]
    fn test_five_point_landmark_lands_on_reference() {
        let (w, h) = (200u32, 200u32);
        let mut img = RgbImage::new(w, h);
        let src = [
            Point::new(80.0, 60.0),
            Point::new(120.0, 60.0),
            Point::new(100.0, 85.0),
            Point::new(85.0, 110.0),
            Point::new(115.0, 110.0),
        ];

        // 5×5 bright patch on the left eye survives bilinear sampling.
        for dy in 0..5 {
            for dx in 0..5 {
                img.put_pixel(78 + dx, 58 + dy, Rgb([255, 255, 255]));
            }
        }

        let face = align_five_point(&img, &src).unwrap();
        let rx = REFERENCE_LANDMARKS_112[0].x.round() as u32;
        let ry = REFERENCE_LANDMARKS_112[0].y.round() as u32;

        let mut max_val = 0u8;
        for y in ry - 1..=ry + 1 {
            for x in rx - 1..=rx + 1 {
                max_val = max_val.max(face.image.get_pixel(x, y).0[0]);
            }
        }
        assert!(max_val > 100, "expected bright patch near ({rx}, {ry}), max={max_val}");
    }

    #[test]
    fn test_encode_png_decodes() {
        let face = AlignedFace {
            image: gradient(ALIGNED_SIZE, ALIGNED_SIZE),
        };
        let bytes = face.encode_png().unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert_eq!(decoded, face.image);
    }
}
