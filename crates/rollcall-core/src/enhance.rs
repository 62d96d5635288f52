//! Pixel-level enhancement applied before detection.

use image::{GrayImage, Luma, RgbImage};

/// Contrast gain applied before detection.
pub const DETECT_ALPHA: f32 = 1.2;
/// Brightness offset applied before detection.
pub const DETECT_BETA: f32 = 10.0;

/// Luma conversion (ITU-R BT.601 weights).
pub fn to_grayscale(image: &RgbImage) -> GrayImage {
    image::imageops::grayscale(image)
}

/// `saturate(|alpha * p + beta|)` on every sample.
pub fn scale_abs(gray: &GrayImage, alpha: f32, beta: f32) -> GrayImage {
    let mut out = gray.clone();
    for p in out.pixels_mut() {
        let v = (alpha * p.0[0] as f32 + beta).abs();
        p.0[0] = v.round().clamp(0.0, 255.0) as u8;
    }
    out
}

/// Same as [`scale_abs`], per channel of an RGB image.
pub fn scale_abs_rgb(image: &RgbImage, alpha: f32, beta: f32) -> RgbImage {
    let mut out = image.clone();
    for p in out.pixels_mut() {
        for c in p.0.iter_mut() {
            *c = (alpha * *c as f32 + beta).abs().round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Global histogram equalization.
///
/// Spreads the cumulative distribution over 0–255. A constant image is
/// returned unchanged.
pub fn equalize_histogram(gray: &GrayImage) -> GrayImage {
    let total = gray.width() as usize * gray.height() as usize;
    if total == 0 {
        return gray.clone();
    }

    let mut hist = [0usize; 256];
    for p in gray.pixels() {
        hist[p.0[0] as usize] += 1;
    }

    let mut cdf = [0usize; 256];
    let mut running = 0usize;
    for (i, count) in hist.iter().enumerate() {
        running += count;
        cdf[i] = running;
    }

    let cdf_min = cdf.iter().copied().find(|&c| c > 0).unwrap_or(0);
    let denom = total - cdf_min;
    if denom == 0 {
        return gray.clone();
    }

    let mut lut = [0u8; 256];
    for (i, slot) in lut.iter_mut().enumerate() {
        let scaled = (cdf[i].saturating_sub(cdf_min)) as f32 / denom as f32 * 255.0;
        *slot = scaled.round().clamp(0.0, 255.0) as u8;
    }

    let mut out = gray.clone();
    for p in out.pixels_mut() {
        *p = Luma([lut[p.0[0] as usize]]);
    }
    out
}

/// Detector input: brightness/contrast boost, then grayscale.
pub fn detection_input(image: &RgbImage) -> GrayImage {
    to_grayscale(&scale_abs_rgb(image, DETECT_ALPHA, DETECT_BETA))
}

/// Live-frame detector input: equalize, then boost.
pub fn enhance_frame(image: &RgbImage) -> GrayImage {
    scale_abs(&equalize_histogram(&to_grayscale(image)), DETECT_ALPHA, DETECT_BETA)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_scale_abs_saturates() {
        let gray = GrayImage::from_pixel(2, 2, Luma([250]));
        let out = scale_abs(&gray, 1.2, 10.0);
        assert!(out.pixels().all(|p| p.0[0] == 255));
    }

    #[test]
    fn test_scale_abs_values() {
        let gray = GrayImage::from_pixel(1, 1, Luma([100]));
        assert_eq!(scale_abs(&gray, 1.2, 10.0).get_pixel(0, 0).0[0], 130);
        // Negative results are mirrored, not clamped to zero.
        assert_eq!(scale_abs(&gray, 1.0, -150.0).get_pixel(0, 0).0[0], 50);
    }

    #[test]
    fn test_equalize_stretches_range() {
        let gray = GrayImage::from_fn(16, 16, |x, y| Luma([100 + ((x + y) % 11) as u8]));
        let out = equalize_histogram(&gray);
        let min = out.pixels().map(|p| p.0[0]).min().unwrap();
        let max = out.pixels().map(|p| p.0[0]).max().unwrap();
        assert_eq!(min, 0);
        assert_eq!(max, 255);
    }

    #[test]
    fn test_equalize_constant_image() {
        let gray = GrayImage::from_pixel(8, 8, Luma([77]));
        assert_eq!(equalize_histogram(&gray), gray);
    }

    #[test]
    fn test_equalize_empty_image() {
        let gray = GrayImage::new(0, 0);
        assert_eq!(equalize_histogram(&gray).dimensions(), (0, 0));
    }

    #[test]
    fn test_detection_input_brightens() {
        let rgb = RgbImage::from_pixel(4, 4, Rgb([100, 100, 100]));
        let gray = detection_input(&rgb);
        assert_eq!(gray.dimensions(), (4, 4));
        assert!(gray.pixels().all(|p| p.0[0] == 130));
    }

    #[test]
    fn test_enhance_frame_stretches_dim_frame() {
        let rgb = RgbImage::from_fn(4, 2, |x, _| {
            let v = 60 + x as u8;
            Rgb([v, v, v])
        });
        let out = enhance_frame(&rgb);
        assert_eq!(out.dimensions(), (4, 2));
        // Darkest level equalizes to 0 and is lifted by beta; brightest saturates.
        assert_eq!(out.get_pixel(0, 0).0[0], 10);
        assert_eq!(out.get_pixel(3, 1).0[0], 255);
        assert!(out.get_pixel(1, 0).0[0] < out.get_pixel(2, 0).0[0]);
    }
}
