//! identint-core: Face detection, encoding and matching engine.
//!
//! Uses SCRFD for face detection and SFace for 128-dimensional face
//! encodings, both running via ONNX Runtime for CPU inference. Matching is
//! a Euclidean linear scan over stored encodings.

pub mod alignment;
pub mod detector;
pub mod pipeline;
pub mod quality;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use image::RgbImage;
pub use pipeline::{
    analyze_photo, encode_photo, inspect_photo, EncodedPhoto, FaceBackend, FaceError, Inspection,
    OnnxBackend,
};
pub use quality::QualityReport;
pub use types::{
    BoundingBox, EncodingError, EuclideanMatcher, FaceEncoding, FaceMatch, Matcher,
    DEFAULT_MATCH_THRESHOLD, ENCODING_DIM,
};

/// Per-user data directory: `$XDG_DATA_HOME/identint`, else `~/.local/share/identint`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("identint")
}

/// Directory searched for the ONNX model files.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}
