//! ONNX-backed [`FaceMatcher`]: SCRFD detection, alignment, ArcFace descriptors.

use crate::detector::FaceDetector;
use crate::matcher::{ExtractError, FaceMatcher, Metric};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Descriptor;
use image::RgbImage;
use std::path::{Path, PathBuf};

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Default model directory: `$XDG_DATA_HOME/veriface/models`, falling back to
/// `~/.local/share/veriface/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("veriface")
        .join("models")
}

pub struct OnnxFaceMatcher {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    metric: Metric,
    /// Upper bound on faces embedded per image; the rest are ignored.
    max_faces: usize,
}

impl OnnxFaceMatcher {
    /// Load `det_10g.onnx` and `w600k_r50.onnx` from `model_dir`.
    pub fn load(model_dir: &Path, metric: Metric) -> Result<Self, ExtractError> {
        let detector = FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        Ok(Self {
            detector,
            recognizer,
            metric,
            max_faces: 4,
        })
    }

    pub fn with_max_faces(mut self, max_faces: usize) -> Self {
        self.max_faces = max_faces.max(1);
        self
    }
}

impl FaceMatcher for OnnxFaceMatcher {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<Descriptor>, ExtractError> {
        let faces = self.detector.detect(image)?;
        tracing::debug!(faces = faces.len(), "detected faces");

        let mut descriptors = Vec::with_capacity(faces.len().min(self.max_faces));
        for face in faces.iter().take(self.max_faces) {
            match self.recognizer.extract(image, face) {
                Ok(d) => descriptors.push(d),
                // SCRFD can emit boxes without keypoints at the tensor edge; skip them.
                Err(RecognizerError::NoLandmarks) => {
                    tracing::debug!(confidence = face.confidence, "face without landmarks skipped");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(descriptors)
    }

    fn compare(&self, a: &Descriptor, b: &Descriptor) -> f32 {
        self.metric.similarity(a, b)
    }
}
