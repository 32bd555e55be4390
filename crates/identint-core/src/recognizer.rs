//! SFace face recognizer via ONNX Runtime.
//!
//! Aligns a detected face to 112×112 and extracts a 128-dimensional,
//! L2-normalized encoding with OpenCV's `face_recognition_sface_2021dec` model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{BoundingBox, EncodingError, FaceEncoding, ENCODING_DIM};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (face_recognition_sface_2021dec.onnx, OpenCV zoo)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks; detector must return landmarks for alignment")]
    NoLandmarks,
    #[error("invalid encoding: {0}")]
    Encoding(#[from] EncodingError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// SFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the SFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded SFace model"
        );

        Ok(Self { session })
    }

    /// Extract the encoding of one detected face.
    pub fn extract(
        &mut self,
        image: &RgbImage,
        face: &BoundingBox,
    ) -> Result<FaceEncoding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let aligned = alignment::align_face(image, landmarks);
        let input = preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("encoding extraction: {e}")))?;

        if raw.len() != ENCODING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ENCODING_DIM}-dim encoding, got {}",
                raw.len()
            )));
        }

        Ok(FaceEncoding::new(l2_normalize(raw))?)
    }
}

/// SFace takes raw 0–255 RGB values, no mean/std normalization.
fn preprocess(aligned: &RgbImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in aligned.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel.0[c] as f32;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|v| v / norm).collect()
    } else {
        raw.to_vec()
    }
}
