//! Photo-level operations built on a [`FaceBackend`]: quality gate,
//! single-face encoding, and the combined inspection used for uploads.

use crate::detector::{DetectorError, FaceDetector};
use crate::quality::QualityReport;
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, FaceEncoding};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

/// File name of the SCRFD detection model inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the SFace recognition model inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "face_recognition_sface_2021dec.onnx";

#[derive(Error, Debug)]
pub enum FaceError {
    #[error("cannot read image: {0}")]
    Image(#[from] image::ImageError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("no face detected")]
    NoFaceDetected,
}

/// Face detection plus encoding extraction.
pub trait FaceBackend {
    /// Detected faces, best first.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, FaceError>;
    fn encode(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<FaceEncoding, FaceError>;
}

/// SCRFD + SFace running on ONNX Runtime.
pub struct OnnxBackend {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxBackend {
    pub fn load(model_dir: &Path) -> Result<Self, FaceError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE))?;
        Ok(Self { detector, recognizer })
    }
}

impl FaceBackend for OnnxBackend {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, FaceError> {
        Ok(self.detector.detect(image)?)
    }

    fn encode(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<FaceEncoding, FaceError> {
        Ok(self.recognizer.extract(image, face)?)
    }
}

/// Quality verdict plus, when the photo passes, the encoding of its face.
#[derive(Debug, Clone)]
pub struct Inspection {
    pub report: QualityReport,
    pub encoding: Option<FaceEncoding>,
}

/// Encoding of the first detected face in a photo.
#[derive(Debug, Clone)]
pub struct EncodedPhoto {
    pub encoding: FaceEncoding,
    pub face_count: usize,
}

/// Decode a photo, sniffing the format from its content rather than its extension.
pub fn load_image(path: &Path) -> Result<RgbImage, FaceError> {
    let reader = image::ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(image::ImageError::IoError)?;
    Ok(reader.decode()?.to_rgb8())
}

/// Run the quality gate on a photo file.
pub fn analyze_photo<B: FaceBackend + ?Sized>(
    backend: &mut B,
    path: &Path,
) -> Result<QualityReport, FaceError> {
    let image = load_image(path)?;
    let faces = backend.detect(&image)?;
    Ok(QualityReport::assess(faces.len()))
}

/// Encode a photo file; see [`encode_image`].
pub fn encode_photo<B: FaceBackend + ?Sized>(
    backend: &mut B,
    path: &Path,
) -> Result<EncodedPhoto, FaceError> {
    encode_image(backend, &load_image(path)?)
}

/// Encode the first (highest-confidence) face. Extra faces are logged and ignored.
pub fn encode_image<B: FaceBackend + ?Sized>(
    backend: &mut B,
    image: &RgbImage,
) -> Result<EncodedPhoto, FaceError> {
    let faces = backend.detect(image)?;
    let face = faces.first().ok_or(FaceError::NoFaceDetected)?;
    if faces.len() > 1 {
        tracing::warn!(faces = faces.len(), "multiple faces detected, encoding the first");
    }

    let encoding = backend.encode(image, face)?;
    Ok(EncodedPhoto { encoding, face_count: faces.len() })
}

/// Inspect a photo file; see [`inspect_image`].
pub fn inspect_photo<B: FaceBackend + ?Sized>(
    backend: &mut B,
    path: &Path,
) -> Result<Inspection, FaceError> {
    inspect_image(backend, &load_image(path)?)
}

/// Detect once, apply the quality gate, and encode only if the gate passes.
pub fn inspect_image<B: FaceBackend + ?Sized>(
    backend: &mut B,
    image: &RgbImage,
) -> Result<Inspection, FaceError> {
    let faces = backend.detect(image)?;
    let report = QualityReport::assess(faces.len());

    let encoding = match faces.first() {
        Some(face) if report.is_good_quality() => Some(backend.encode(image, face)?),
        _ => None,
    };

    tracing::debug!(faces = report.face_count, encoded = encoding.is_some(), "photo inspected");
    Ok(Inspection { report, encoding })
}
