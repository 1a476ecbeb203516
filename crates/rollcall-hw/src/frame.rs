//! Frame type and pixel conversion: YUYV/GREY to RGB, sampling downscale.

use image::imageops::{self, FilterType};
use image::RgbImage;
use std::time::Instant;

/// A captured colour frame tagged with its position in the stream.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// Strictly increasing across the whole run, including reconnects.
    pub sequence: u64,
    pub captured_at: Instant,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Average luma-ish brightness (0.0–255.0) over all channels.
    pub fn avg_brightness(&self) -> f32 {
        let raw = self.image.as_raw();
        if raw.is_empty() {
            return 0.0;
        }
        raw.iter().map(|&b| b as f32).sum::<f32>() / raw.len() as f32
    }
}

/// Convert packed YUYV (4:2:2) to interleaved RGB using BT.601 integer coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }

    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

/// Expand 8-bit grayscale (native output of many IR sensors) to RGB.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height) as usize;
    if gray.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: gray.len(),
        });
    }
    let rgb: Vec<u8> = gray[..expected].iter().flat_map(|&p| [p, p, p]).collect();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: gray.len(),
    })
}

/// Shrink an image by `factor` (0 < factor ≤ 1) with bilinear filtering.
///
/// A factor of 1.0 returns an exact copy so that an unoptimised pass sees the
/// original pixels.
pub fn downscale(image: &RgbImage, factor: f32) -> RgbImage {
    if factor >= 1.0 {
        return image.clone();
    }
    let width = ((image.width() as f32 * factor).round() as u32).max(1);
    let height = ((image.height() as f32 * factor).round() as u32).max(1);
    imageops::resize(image, width, height, FilterType::Triangle)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_rgb_gray_levels() {
        // Neutral chroma (U=V=128) should map luma straight to gray.
        let yuyv = vec![16, 128, 235, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(rgb.get_pixel(1, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_yuyv_to_rgb_red_dominant() {
        // High V pushes red up and green down.
        let yuyv = vec![82, 90, 82, 240];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        let [r, g, b] = rgb.get_pixel(0, 0).0;
        assert!(r > 200, "r={r}");
        assert!(g < 40, "g={g}");
        assert!(b < 40, "b={b}");
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128];
        assert!(yuyv_to_rgb(&yuyv, 2, 1).is_err());
    }

    #[test]
    fn test_grey_to_rgb() {
        let rgb = grey_to_rgb(&[7, 200], 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [7, 7, 7]);
        assert_eq!(rgb.get_pixel(1, 0).0, [200, 200, 200]);
    }

    #[test]
    fn test_downscale_half() {
        let image = RgbImage::from_pixel(640, 360, image::Rgb([10, 20, 30]));
        let small = downscale(&image, 0.5);
        assert_eq!(small.dimensions(), (320, 180));
        assert_eq!(small.get_pixel(100, 100).0, [10, 20, 30]);
    }

    #[test]
    fn test_downscale_identity() {
        let mut image = RgbImage::new(4, 4);
        image.put_pixel(1, 2, image::Rgb([1, 2, 3]));
        let same = downscale(&image, 1.0);
        assert_eq!(same, image);
    }

    #[test]
    fn test_downscale_never_empty() {
        let image = RgbImage::new(3, 3);
        let tiny = downscale(&image, 0.01);
        assert_eq!(tiny.dimensions(), (1, 1));
    }

    #[test]
    fn test_avg_brightness() {
        let frame = Frame {
            image: RgbImage::from_pixel(2, 2, image::Rgb([100, 100, 100])),
            sequence: 0,
            captured_at: Instant::now(),
        };
        assert!((frame.avg_brightness() - 100.0).abs() < 1e-6);
    }
}
