//! Reference enrollment from an uploaded photo.
//!
//! The upload is decoded in memory and never written to disk; only its
//! SHA-256 digest outlives the call, inside the [`ReferenceDescriptor`].

use crate::matcher::{crosses_threshold, ExtractError, FaceMatcher};
use crate::types::{MatchDecision, ReferenceDescriptor};
use image::{ImageFormat, RgbImage};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Upload size cap used when the caller has no configured limit.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 20 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("uploaded file is empty")]
    Empty,
    #[error("uploaded file is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("unsupported image format {0} (need JPEG or PNG)")]
    UnsupportedFormat(String),
    #[error("cannot decode image: {0}")]
    Undecodable(String),
    #[error("no face detected in reference photo")]
    NoFaceDetected,
    #[error("no face detected in probe photo")]
    NoFaceInProbe,
    #[error("descriptor length {actual} does not match reference length {expected}")]
    DescriptorMismatch { expected: usize, actual: usize },
    #[error("matcher error: {0}")]
    Extractor(#[from] ExtractError),
}

/// Validate and decode an uploaded JPEG or PNG into RGB pixels.
pub fn decode_upload(bytes: &[u8], max_bytes: u64) -> Result<RgbImage, EnrollError> {
    if bytes.is_empty() {
        return Err(EnrollError::Empty);
    }
    let size = bytes.len() as u64;
    if size > max_bytes {
        return Err(EnrollError::TooLarge {
            size,
            limit: max_bytes,
        });
    }

    let format = image::guess_format(bytes)
        .map_err(|_| EnrollError::UnsupportedFormat("unknown".to_string()))?;
    if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png) {
        return Err(EnrollError::UnsupportedFormat(format!("{format:?}")));
    }

    let image = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| EnrollError::Undecodable(e.to_string()))?;

    tracing::debug!(
        format = ?format,
        width = image.width(),
        height = image.height(),
        "decoded upload"
    );

    Ok(image.to_rgb8())
}

/// Derive the reference descriptor from an uploaded photo.
///
/// When the photo holds several faces the most confident detection wins.
pub fn enroll_reference<M: FaceMatcher + ?Sized>(
    matcher: &mut M,
    bytes: &[u8],
    max_bytes: u64,
) -> Result<ReferenceDescriptor, EnrollError> {
    let image = decode_upload(bytes, max_bytes)?;
    let faces = matcher.extract(&image)?;

    let face_count = faces.len();
    let descriptor = faces
        .into_iter()
        .find(|d| !d.is_empty())
        .ok_or(EnrollError::NoFaceDetected)?;

    if face_count > 1 {
        tracing::warn!(faces = face_count, "reference photo has several faces; using the most confident");
    }

    let reference = ReferenceDescriptor::new(descriptor, hex_digest(bytes));
    tracing::info!(
        digest = reference.digest(),
        dimension = reference.dimension(),
        "reference enrolled"
    );
    Ok(reference)
}

/// Read `path` and enroll it. IO failures are reported as [`EnrollError::Unreadable`].
pub fn enroll_reference_file<M: FaceMatcher + ?Sized>(
    matcher: &mut M,
    path: &Path,
    max_bytes: u64,
) -> Result<ReferenceDescriptor, EnrollError> {
    let bytes = std::fs::read(path).map_err(|source| EnrollError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    enroll_reference(matcher, &bytes, max_bytes)
}

/// Decide whether two photos show the same person, without a camera.
///
/// `reference` contributes its most confident face; any face in `probe` may match.
pub fn verify_pair<M: FaceMatcher + ?Sized>(
    matcher: &mut M,
    reference: &[u8],
    probe: &[u8],
    threshold: f32,
    max_bytes: u64,
) -> Result<MatchDecision, EnrollError> {
    let reference = enroll_reference(matcher, reference, max_bytes)?;
    let probe_image = decode_upload(probe, max_bytes)?;
    let faces = matcher.extract(&probe_image)?;
    if faces.is_empty() {
        return Err(EnrollError::NoFaceInProbe);
    }

    for face in &faces {
        if face.len() != reference.dimension() {
            return Err(EnrollError::DescriptorMismatch {
                expected: reference.dimension(),
                actual: face.len(),
            });
        }
        let similarity = matcher.compare(reference.descriptor(), face);
        tracing::debug!(similarity, "pair compared");
        if crosses_threshold(similarity, threshold) {
            return Ok(MatchDecision::Verified);
        }
    }
    Ok(MatchDecision::NotVerified)
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{desc, ScriptedMatcher};
    use image::{DynamicImage, Rgb};
    use std::io::Cursor;

    fn encoded(format: ImageFormat) -> Vec<u8> {
        let img = RgbImage::from_pixel(8, 6, Rgb([120, 80, 40]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img).write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_decode_png() {
        let img = decode_upload(&encoded(ImageFormat::Png), DEFAULT_MAX_UPLOAD_BYTES).unwrap();
        assert_eq!(img.dimensions(), (8, 6));
        assert_eq!(img.get_pixel(0, 0), &Rgb([120, 80, 40]));
    }

    #[test]
    fn test_decode_jpeg() {
        let img = decode_upload(&encoded(ImageFormat::Jpeg), DEFAULT_MAX_UPLOAD_BYTES).unwrap();
        assert_eq!(img.dimensions(), (8, 6));
    }

    #[test]
    fn test_rejects_empty_upload() {
        assert!(matches!(decode_upload(&[], 100), Err(EnrollError::Empty)));
    }

    #[test]
    fn test_rejects_oversized_upload() {
        let bytes = encoded(ImageFormat::Png);
        let limit = bytes.len() as u64 - 1;
        assert!(matches!(
            decode_upload(&bytes, limit),
            Err(EnrollError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_rejects_other_formats() {
        let gif = b"GIF89a\x01\x00\x01\x00\x00\x00\x00;";
        assert!(matches!(
            decode_upload(gif, DEFAULT_MAX_UPLOAD_BYTES),
            Err(EnrollError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            decode_upload(b"definitely not an image", DEFAULT_MAX_UPLOAD_BYTES),
            Err(EnrollError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_rejects_truncated_png() {
        let bytes = encoded(ImageFormat::Png);
        let truncated = &bytes[..bytes.len() / 2];
        assert!(matches!(
            decode_upload(truncated, DEFAULT_MAX_UPLOAD_BYTES),
            Err(EnrollError::Undecodable(_))
        ));
    }

    #[test]
    fn test_enroll_takes_first_face() {
        let mut matcher = ScriptedMatcher::new().faces(vec![desc(&[1.0, 0.0]), desc(&[0.0, 1.0])]);
        let bytes = encoded(ImageFormat::Png);
        let reference = enroll_reference(&mut matcher, &bytes, DEFAULT_MAX_UPLOAD_BYTES).unwrap();
        assert_eq!(reference.descriptor().values, vec![1.0, 0.0]);
        assert_eq!(reference.digest().len(), 64);
    }

    #[test]
    fn test_enroll_without_face_is_input_error() {
        let mut matcher = ScriptedMatcher::new().no_face();
        let bytes = encoded(ImageFormat::Png);
        assert!(matches!(
            enroll_reference(&mut matcher, &bytes, DEFAULT_MAX_UPLOAD_BYTES),
            Err(EnrollError::NoFaceDetected)
        ));
    }

    #[test]
    fn test_enroll_missing_file_is_unreadable() {
        let mut matcher = ScriptedMatcher::new();
        let err = enroll_reference_file(
            &mut matcher,
            Path::new("/nonexistent/veriface/reference.jpg"),
            DEFAULT_MAX_UPLOAD_BYTES,
        )
        .unwrap_err();
        assert!(matches!(err, EnrollError::Unreadable { .. }));
        assert_eq!(matcher.extract_calls, 0);
    }

    #[test]
    fn test_digest_is_stable() {
        assert_eq!(
            hex_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_verify_pair_any_probe_face() {
        let bytes = encoded(ImageFormat::Png);
        let mut matcher = ScriptedMatcher::new()
            .faces(vec![desc(&[1.0, 0.0])])
            .faces(vec![desc(&[0.0, 1.0]), desc(&[1.0, 0.1])]);
        let decision = verify_pair(&mut matcher, &bytes, &bytes, 0.5, DEFAULT_MAX_UPLOAD_BYTES).unwrap();
        assert_eq!(decision, MatchDecision::Verified);

        let mut matcher = ScriptedMatcher::new()
            .faces(vec![desc(&[1.0, 0.0])])
            .faces(vec![desc(&[0.0, 1.0])]);
        let decision = verify_pair(&mut matcher, &bytes, &bytes, 0.5, DEFAULT_MAX_UPLOAD_BYTES).unwrap();
        assert_eq!(decision, MatchDecision::NotVerified);
    }

    #[test]
    fn test_verify_pair_compared_photo_without_face() {
        let bytes = encoded(ImageFormat::Png);
        let mut matcher = ScriptedMatcher::new().faces(vec![desc(&[1.0, 0.0])]).no_face();
        let err = verify_pair(&mut matcher, &bytes, &bytes, 0.5, DEFAULT_MAX_UPLOAD_BYTES).unwrap_err();
        assert!(matches!(err, EnrollError::NoFaceInProbe));
        assert!(err.to_string().contains("probe"));
    }

    #[test]
    fn test_verify_pair_reference_without_face() {
        let bytes = encoded(ImageFormat::Png);
        let mut matcher = ScriptedMatcher::new().no_face().faces(vec![desc(&[1.0, 0.0])]);
        assert!(matches!(
            verify_pair(&mut matcher, &bytes, &bytes, 0.5, DEFAULT_MAX_UPLOAD_BYTES),
            Err(EnrollError::NoFaceDetected)
        ));
        assert_eq!(matcher.extract_calls, 1);
    }

    #[test]
    fn test_verify_pair_descriptor_length_mismatch() {
        let bytes = encoded(ImageFormat::Png);
        let mut matcher = ScriptedMatcher::new()
            .faces(vec![desc(&[1.0, 0.0])])
            .faces(vec![desc(&[1.0, 0.0, 0.0])]);
        let err = verify_pair(&mut matcher, &bytes, &bytes, 0.5, DEFAULT_MAX_UPLOAD_BYTES).unwrap_err();
        assert!(matches!(
            err,
            EnrollError::DescriptorMismatch {
                expected: 2,
                actual: 3
            }
        ));
    }
}
