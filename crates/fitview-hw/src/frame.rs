//! Pixel-format conversion to RGB and dark-frame detection.

use image::{Rgb, RgbImage};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {format} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// BT.601 limited-range YCbCr → RGB, integer arithmetic.
fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> Rgb<u8> {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| (x >> 8).clamp(0, 255) as u8;
    Rgb([
        clamp(298 * c + 409 * e + 128),
        clamp(298 * c - 100 * d - 208 * e + 128),
        clamp(298 * c + 516 * d + 128),
    ])
}

/// Convert packed YUYV (4:2:2) to RGB.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share the
/// chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len("YUYV", yuyv, expected)?;

    let mut raw = Vec::with_capacity((width * height * 3) as usize);
    for quad in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        raw.extend_from_slice(&ycbcr_to_rgb(y0, u, v).0);
        raw.extend_from_slice(&ycbcr_to_rgb(y1, u, v).0);
    }
    Ok(RgbImage::from_vec(width, height, raw).unwrap_or_else(|| RgbImage::new(width, height)))
}

/// Packed 24-bit RGB (V4L2 `RGB3`).
pub fn rgb24_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 3) as usize;
    check_len("RGB3", buf, expected)?;
    Ok(RgbImage::from_vec(width, height, buf[..expected].to_vec())
        .unwrap_or_else(|| RgbImage::new(width, height)))
}

/// 8-bit grayscale replicated to three channels.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len("GREY", gray, pixels)?;
    Ok(RgbImage::from_fn(width, height, |x, y| {
        let g = gray[(y * width + x) as usize];
        Rgb([g, g, g])
    }))
}

/// BT.601 luma.
pub fn luma(p: &Rgb<u8>) -> u8 {
    ((77 * p[0] as u32 + 150 * p[1] as u32 + 29 * p[2] as u32) >> 8) as u8
}

/// True if more than `threshold_pct` of pixels have luma below 32.
pub fn is_dark_frame(image: &RgbImage, threshold_pct: f32) -> bool {
    let total = image.pixels().len();
    if total == 0 {
        return true;
    }
    let dark = image.pixels().filter(|p| luma(p) < 32).count();
    (dark as f32 / total as f32) > threshold_pct
}

/// Average luma (0.0–255.0).
pub fn avg_brightness(image: &RgbImage) -> f32 {
    let total = image.pixels().len();
    if total == 0 {
        return 0.0;
    }
    image.pixels().map(|p| luma(p) as f32).sum::<f32>() / total as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_neutral_chroma_is_gray() {
        // 2x1 image: [Y0=16, U=128, Y1=235, V=128] → black, white
        let rgb = yuyv_to_rgb(&[16, 128, 235, 128], 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_yuyv_red_chroma() {
        // strong Cr pushes red up and green down
        let rgb = yuyv_to_rgb(&[81, 90, 81, 240], 2, 1).unwrap();
        let p = rgb.get_pixel(0, 0);
        assert!(p[0] > 200 && p[1] < 40 && p[2] < 40, "{p:?}");
        assert_eq!(rgb.get_pixel(0, 0), rgb.get_pixel(1, 0));
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(matches!(
            yuyv_to_rgb(&[100, 128], 2, 1),
            Err(FrameError::InvalidLength { expected: 4, actual: 2, .. })
        ));
    }

    #[test]
    fn test_grey_and_rgb24() {
        let grey = grey_to_rgb(&[7, 9], 2, 1).unwrap();
        assert_eq!(grey.get_pixel(1, 0), &Rgb([9, 9, 9]));

        let rgb = rgb24_to_rgb(&[1, 2, 3, 4, 5, 6, 99], 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([4, 5, 6]));
        assert!(rgb24_to_rgb(&[1, 2, 3], 2, 1).is_err());
    }

    #[test]
    fn test_dark_frame_all_black() {
        assert!(is_dark_frame(&RgbImage::new(40, 25), 0.95));
    }

    #[test]
    fn test_dark_frame_normal() {
        let image = RgbImage::from_pixel(40, 25, Rgb([128, 128, 128]));
        assert!(!is_dark_frame(&image, 0.95));
        assert!((avg_brightness(&image) - 127.0).abs() < 1.5);
    }

    #[test]
    fn test_dark_frame_empty() {
        assert!(is_dark_frame(&RgbImage::new(0, 0), 0.95));
    }

    #[test]
    fn test_dark_frame_borderline() {
        // 96% dark → dark; 94% dark → not dark
        let mostly = RgbImage::from_fn(100, 10, |x, _| {
            if x < 96 { Rgb([10, 10, 10]) } else { Rgb([128, 128, 128]) }
        });
        assert!(is_dark_frame(&mostly, 0.95));

        let borderline = RgbImage::from_fn(100, 10, |x, _| {
            if x < 94 { Rgb([10, 10, 10]) } else { Rgb([128, 128, 128]) }
        });
        assert!(!is_dark_frame(&borderline, 0.95));
    }
}
