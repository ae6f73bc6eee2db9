//! Face-matching capability: descriptor extraction and descriptor comparison.
//!
//! The live-match loop and enrollment only ever talk to a [`FaceMatcher`],
//! so the ONNX backend and test doubles are interchangeable.

use crate::types::Descriptor;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("detector error: {0}")]
    Detector(#[from] crate::detector::DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] crate::recognizer::RecognizerError),
    #[error("extraction failed: {0}")]
    Other(String),
}

/// Injectable face-matching backend.
pub trait FaceMatcher {
    /// Extract one descriptor per detected face, highest detection confidence first.
    ///
    /// An image without faces yields an empty vector, not an error.
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<Descriptor>, ExtractError>;

    /// Similarity between two descriptors. Higher = more similar.
    fn compare(&self, a: &Descriptor, b: &Descriptor) -> f32;
}

impl<M: FaceMatcher + ?Sized> FaceMatcher for &mut M {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<Descriptor>, ExtractError> {
        (**self).extract(image)
    }

    fn compare(&self, a: &Descriptor, b: &Descriptor) -> f32 {
        (**self).compare(a, b)
    }
}

impl<M: FaceMatcher + ?Sized> FaceMatcher for Box<M> {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<Descriptor>, ExtractError> {
        (**self).extract(image)
    }

    fn compare(&self, a: &Descriptor, b: &Descriptor) -> f32 {
        (**self).compare(a, b)
    }
}

/// Similarity function used to compare descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Cosine similarity in [-1, 1].
    #[default]
    Cosine,
    /// Euclidean distance of L2-normalised vectors, mapped to `1 - d / 2` in [0, 1].
    EuclideanL2,
}

impl Metric {
    pub fn similarity(self, a: &Descriptor, b: &Descriptor) -> f32 {
        match self {
            Metric::Cosine => a.similarity(b),
            Metric::EuclideanL2 => {
                let d = a.l2_normalized().euclidean_distance(&b.l2_normalized());
                1.0 - d / 2.0
            }
        }
    }
}

/// Inclusive threshold test shared by enrollment checks and the live loop.
pub fn crosses_threshold(similarity: f32, threshold: f32) -> bool {
    similarity >= threshold
}
