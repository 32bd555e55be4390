use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dimension of a face encoding produced by the SFace recognizer.
pub const ENCODING_DIM: usize = 128;

/// Default maximum Euclidean distance for two encodings to count as the same person.
///
/// SFace encodings are L2-normalized, so a distance `d` corresponds to a cosine
/// similarity of `1 - d² / 2`. 0.6 therefore demands a cosine of at least 0.82,
/// which is strict: OpenCV's same-person cutoff for this model is an L2 distance
/// of 1.128 (cosine 0.363). Deployments that see missed matches should raise it.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

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

#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("malformed encoding text: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("expected {ENCODING_DIM}-dim encoding, got {0}")]
    WrongDimension(usize),
    #[error("encoding contains a non-finite value at index {0}")]
    NonFinite(usize),
}

/// Fixed-length face encoding.
///
/// Persisted as a JSON array of numbers so the stored text stays readable
/// from any SQLite client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct FaceEncoding {
    values: Vec<f32>,
}

impl FaceEncoding {
    /// Wrap raw values, checking the dimension and that every value is finite.
    pub fn new(values: Vec<f32>) -> Result<Self, EncodingError> {
        if values.len() != ENCODING_DIM {
            return Err(EncodingError::WrongDimension(values.len()));
        }
        if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
            return Err(EncodingError::NonFinite(idx));
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn to_json(&self) -> String {
        // A Vec<f32> always serializes; fall back to an empty array rather than panic.
        serde_json::to_string(&self.values).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn from_json(text: &str) -> Result<Self, EncodingError> {
        let values: Vec<f32> = serde_json::from_str(text)?;
        Self::new(values)
    }

    /// Euclidean distance between two encodings.
    pub fn distance(&self, other: &FaceEncoding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl TryFrom<Vec<f32>> for FaceEncoding {
    type Error = EncodingError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<FaceEncoding> for Vec<f32> {
    fn from(encoding: FaceEncoding) -> Self {
        encoding.values
    }
}

/// A gallery entry that fell within the match threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceMatch<K> {
    pub key: K,
    /// `(1 - distance) * 100`; 100 means identical encodings.
    pub similarity: f32,
    pub distance: f32,
}

/// Strategy for ranking a gallery of stored encodings against a target.
pub trait Matcher {
    fn rank<K: Clone>(
        &self,
        target: &FaceEncoding,
        gallery: &[(K, FaceEncoding)],
        threshold: f32,
    ) -> Vec<FaceMatch<K>>;
}

/// Linear-scan Euclidean matcher.
///
/// Keeps every entry with `distance <= threshold` and orders them by
/// similarity, best first. The sort is stable, so ties keep gallery order.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn rank<K: Clone>(
        &self,
        target: &FaceEncoding,
        gallery: &[(K, FaceEncoding)],
        threshold: f32,
    ) -> Vec<FaceMatch<K>> {
        let mut matches: Vec<FaceMatch<K>> = gallery
            .iter()
            .filter_map(|(key, encoding)| {
                let distance = target.distance(encoding);
                (distance <= threshold).then(|| FaceMatch {
                    key: key.clone(),
                    similarity: (1.0 - distance) * 100.0,
                    distance,
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        tracing::debug!(
            gallery = gallery.len(),
            matched = matches.len(),
            threshold,
            "ranked gallery"
        );
        matches
    }
}
