use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face descriptor (512-dimensional for the ArcFace backend).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
    /// Model version that produced this descriptor (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// A zero-norm operand yields 0.0.
    pub fn similarity(&self, other: &Descriptor) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Euclidean distance between the raw vectors.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Copy of this descriptor scaled to unit length. Zero vectors are returned unchanged.
    pub fn l2_normalized(&self) -> Descriptor {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            self.values.iter().map(|x| x / norm).collect()
        } else {
            self.values.clone()
        };
        Descriptor {
            values,
            model_version: self.model_version.clone(),
        }
    }
}

/// The descriptor derived from the uploaded reference photo.
///
/// Immutable once built; a session holds at most one and drops it on reset.
#[derive(Debug, Clone)]
pub struct ReferenceDescriptor {
    descriptor: Descriptor,
    digest: String,
    enrolled_at: DateTime<Utc>,
}

impl ReferenceDescriptor {
    pub fn new(descriptor: Descriptor, digest: String) -> Self {
        Self {
            descriptor,
            digest,
            enrolled_at: Utc::now(),
        }
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Hex SHA-256 of the uploaded bytes.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn enrolled_at(&self) -> DateTime<Utc> {
        self.enrolled_at
    }

    pub fn dimension(&self) -> usize {
        self.descriptor.len()
    }
}

/// Terminal verification decision surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchDecision {
    Verified,
    NotVerified,
}

impl MatchDecision {
    pub fn is_verified(self) -> bool {
        matches!(self, MatchDecision::Verified)
    }
}

impl From<bool> for MatchDecision {
    fn from(verified: bool) -> Self {
        if verified {
            MatchDecision::Verified
        } else {
            MatchDecision::NotVerified
        }
    }
}
