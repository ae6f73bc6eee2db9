//! Pixel-format conversion to RGB and dark-frame detection.

use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn build(width: u32, height: u32, rgb: Vec<u8>) -> Result<RgbImage, FrameError> {
    let actual = rgb.len();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected: (width * height * 3) as usize,
        actual,
    })
}

fn clamp(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Packed RGB24 (`RGB3`), truncating any trailing padding.
pub fn rgb24_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 3) as usize;
    check_len(buf, expected)?;
    build(width, height, buf[..expected].to_vec())
}

/// Convert packed YUYV (4:2:2) to RGB with BT.601 coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len(buf, expected)?;

    let mut out = Vec::with_capacity((width * height * 3) as usize);
    for chunk in buf[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0] as f32, chunk[2] as f32] {
            out.push(clamp(y + 1.402 * v));
            out.push(clamp(y - 0.344_136 * u - 0.714_136 * v));
            out.push(clamp(y + 1.772 * u));
        }
    }
    build(width, height, out)
}

/// 8-bit grayscale replicated into three channels.
pub fn grey_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len(buf, pixels)?;
    build(width, height, buf[..pixels].iter().flat_map(|&g| [g, g, g]).collect())
}

/// 16-bit little-endian grayscale, high byte kept.
pub fn y16_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len(buf, pixels * 2)?;
    build(
        width,
        height,
        buf[..pixels * 2]
            .chunks_exact(2)
            .flat_map(|p| {
                let g = (u16::from_le_bytes([p[0], p[1]]) >> 8) as u8;
                [g, g, g]
            })
            .collect(),
    )
}

fn luma(p: &image::Rgb<u8>) -> f32 {
    0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32
}

/// Average luma (0.0–255.0).
pub fn avg_brightness(image: &RgbImage) -> f32 {
    let n = (image.width() * image.height()) as usize;
    if n == 0 {
        return 0.0;
    }
    image.pixels().map(luma).sum::<f32>() / n as f32
}

/// True if more than `threshold_pct` of pixels have luma below 32.
pub fn is_dark_frame(image: &RgbImage, threshold_pct: f32) -> bool {
    let n = (image.width() * image.height()) as usize;
    if n == 0 {
        return true;
    }
    let dark = image.pixels().filter(|p| luma(p) < 32.0).count();
    (dark as f32 / n as f32) > threshold_pct
}
