//! Photo quality gate: a usable photo shows exactly one face.

use serde::Serialize;

/// Outcome of the quality gate for one photo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityReport {
    pub face_count: usize,
}

impl QualityReport {
    pub fn assess(face_count: usize) -> Self {
        Self { face_count }
    }

    pub fn has_face(&self) -> bool {
        self.face_count > 0
    }

    pub fn is_good_quality(&self) -> bool {
        self.face_count == 1
    }

    /// Human-readable reason, suitable for showing to the uploader.
    pub fn message(&self) -> String {
        match self.face_count {
            0 => "No face detected".to_string(),
            1 => "Good quality photo".to_string(),
            n => format!("{n} faces detected. Please upload a photo with a single person."),
        }
    }
}
