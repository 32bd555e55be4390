//! Glue between the engine and the student store: matching an upload
//! against the gallery and encoding student photos.

use identint_core::{EuclideanMatcher, Matcher};
use identint_store::{Student, StudentId};
use std::path::Path;

use crate::engine::EngineError;
use crate::error::AppError;
use crate::routes::AppState;
use crate::session::StoredMatch;

/// Outcome of analysing an uploaded photo.
#[derive(Debug)]
pub enum Analysis {
    /// The photo failed the quality gate or could not be processed.
    Rejected { message: String },
    /// The photo passed; `matches` is ordered best first and may be empty.
    Matched { message: String, matches: Vec<StoredMatch> },
}

impl Analysis {
    pub fn message(&self) -> &str {
        match self {
            Analysis::Rejected { message } | Analysis::Matched { message, .. } => message,
        }
    }
}

/// Quality-check an upload and rank the stored encodings against it.
pub async fn analyze_upload(state: &AppState, path: &Path) -> Result<Analysis, AppError> {
    let inspection = match state.engine.inspect(path.to_path_buf()).await {
        Ok(inspection) => inspection,
        Err(EngineError::Face(err)) => {
            tracing::warn!(error = %err, "upload analysis failed");
            return Ok(Analysis::Rejected { message: format!("Error: {err}") });
        }
        Err(err) => return Err(err.into()),
    };

    let message = inspection.report.message();
    let Some(encoding) = inspection.encoding else {
        return Ok(Analysis::Rejected { message });
    };

    let gallery = state.store.run(|s| s.gallery()).await?;
    let matches = EuclideanMatcher
        .rank(&encoding, &gallery, state.config.match_threshold)
        .into_iter()
        .map(|m| StoredMatch {
            student_id: m.key,
            similarity: m.similarity,
            distance: m.distance,
        })
        .collect::<Vec<_>>();

    tracing::info!(gallery = gallery.len(), matches = matches.len(), "upload matched");
    Ok(Analysis::Matched { message, matches })
}

/// Result of a bulk encode.
#[derive(Debug, Default)]
pub struct EncodeSummary {
    pub encoded: usize,
    /// Student display name and the reason it was skipped.
    pub failures: Vec<(String, String)>,
}

/// Encode the stored photo of each student. Students without a usable photo
/// or face are reported as failures; the rest of the batch continues.
pub async fn encode_students(
    state: &AppState,
    ids: Vec<StudentId>,
) -> Result<EncodeSummary, AppError> {
    let students = state.store.run(move |s| s.get_many(&ids)).await?;
    let mut summary = EncodeSummary::default();

    for student in students {
        match encode_one(state, &student).await {
            Ok(()) => summary.encoded += 1,
            Err(EncodeFailure::Skipped(reason)) => {
                tracing::warn!(student_id = student.id, reason = %reason, "student not encoded");
                summary.failures.push((student.full_name(), reason));
            }
            Err(EncodeFailure::Fatal(err)) => return Err(err),
        }
    }

    Ok(summary)
}

enum EncodeFailure {
    Skipped(String),
    Fatal(AppError),
}

async fn encode_one(state: &AppState, student: &Student) -> Result<(), EncodeFailure> {
    let Some(photo) = &student.photo else {
        return Err(EncodeFailure::Skipped("no photo".into()));
    };

    let encoded = match state.engine.encode(state.config.media_dir.join(photo)).await {
        Ok(encoded) => encoded,
        Err(EngineError::Face(err)) => return Err(EncodeFailure::Skipped(err.to_string())),
        Err(err) => return Err(EncodeFailure::Fatal(err.into())),
    };

    let id = student.id;
    let photo = photo.clone();
    let stored = state
        .store
        .run(move |s| s.set_encoding_for_photo(id, &photo, &encoded.encoding))
        .await
        .map_err(|e| EncodeFailure::Fatal(e.into()))?;
    if !stored {
        return Err(EncodeFailure::Skipped("photo changed during encoding".into()));
    }
    tracing::info!(student_id = id, faces = encoded.face_count, "encoded");
    Ok(())
}
