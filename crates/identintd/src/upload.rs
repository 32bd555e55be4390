//! Multipart photo uploads: validation and storage under the media directory.

use axum::body::Bytes;
use axum::extract::multipart::{Multipart, MultipartError};
use axum::http::StatusCode;
use image::ImageFormat;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Media subdirectory for uploads awaiting preview.
pub const TEMP_SUBDIR: &str = "temp";
/// Media subdirectory for photos attached to student records.
pub const STUDENT_PHOTO_SUBDIR: &str = "students_photos";

const ACCEPTED_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/jpg"];
const FILE_NAME_MAX: usize = 100;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("No photo was submitted.")]
    MissingFile,
    #[error("Unsupported format. Use JPG or PNG.")]
    UnsupportedType,
    #[error("The photo is too large (max {} MB).", .max_bytes / (1024 * 1024))]
    TooLarge { max_bytes: usize },
    #[error("The file is not a valid JPG or PNG image.")]
    InvalidImage,
    #[error("Malformed upload: {0}")]
    Multipart(String),
    #[error("cannot store upload: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// Whether the uploader caused the error and should see it as a form message.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, UploadError::Io(_))
    }

    fn from_multipart(err: MultipartError, max_bytes: usize) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            UploadError::TooLarge { max_bytes }
        } else {
            UploadError::Multipart(err.body_text())
        }
    }
}

/// A file part of a multipart form.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

impl UploadedFile {
    /// Check the declared type, the size and the actual content.
    /// Returns the detected image format.
    pub fn validate(&self, max_bytes: usize) -> Result<ImageFormat, UploadError> {
        let declared = self.content_type.as_deref().unwrap_or_default();
        if !ACCEPTED_TYPES.contains(&declared) {
            return Err(UploadError::UnsupportedType);
        }
        if self.bytes.len() > max_bytes {
            return Err(UploadError::TooLarge { max_bytes });
        }
        match image::guess_format(&self.bytes) {
            Ok(format @ (ImageFormat::Jpeg | ImageFormat::Png)) => Ok(format),
            _ => Err(UploadError::InvalidImage),
        }
    }
}

/// Text fields plus at most one file from a multipart body.
#[derive(Debug, Default)]
pub struct MultipartForm {
    pub fields: HashMap<String, String>,
    pub file: Option<UploadedFile>,
}

impl MultipartForm {
    pub fn text(&self, name: &str) -> Option<String> {
        self.fields.get(name).cloned()
    }

    pub fn checked(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }
}

/// Drain a multipart body. The part named `file_field` becomes the file;
/// an empty file input (no name, no bytes) counts as no file.
pub async fn read_form(
    mut multipart: Multipart,
    file_field: &str,
    max_bytes: usize,
) -> Result<MultipartForm, UploadError> {
    let mut form = MultipartForm::default();
    let multipart_err = |e| UploadError::from_multipart(e, max_bytes);

    while let Some(field) = multipart.next_field().await.map_err(multipart_err)? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };

        if name == file_field {
            let file_name = field.file_name().unwrap_or_default().to_string();
            let content_type = field.content_type().map(str::to_string);
            let bytes = field.bytes().await.map_err(multipart_err)?;
            if file_name.is_empty() && bytes.is_empty() {
                continue;
            }
            form.file = Some(UploadedFile { file_name, content_type, bytes });
        } else {
            let value = field.text().await.map_err(multipart_err)?;
            form.fields.insert(name, value);
        }
    }

    Ok(form)
}

/// Reduce a client-supplied file name to a safe single path component.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .take(FILE_NAME_MAX)
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "photo".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Store an upload under `temp/` as `<uuid>-<name>`; returns the media-relative path.
pub async fn save_temp(media_dir: &Path, file: &UploadedFile) -> Result<String, UploadError> {
    let name = format!("{}-{}", uuid::Uuid::new_v4(), sanitize_file_name(&file.file_name));
    write_media(media_dir, TEMP_SUBDIR, &name, &file.bytes).await
}

/// Store a student photo as `students_photos/<uuid>.<ext>`.
pub async fn save_student_photo(
    media_dir: &Path,
    file: &UploadedFile,
    format: ImageFormat,
) -> Result<String, UploadError> {
    let ext = match format {
        ImageFormat::Png => "png",
        _ => "jpg",
    };
    let name = format!("{}.{ext}", uuid::Uuid::new_v4());
    write_media(media_dir, STUDENT_PHOTO_SUBDIR, &name, &file.bytes).await
}

async fn write_media(
    media_dir: &Path,
    subdir: &str,
    name: &str,
    bytes: &[u8],
) -> Result<String, UploadError> {
    let dir = media_dir.join(subdir);
    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::write(dir.join(name), bytes).await?;
    tracing::debug!(subdir, name, size = bytes.len(), "media file stored");
    Ok(format!("{subdir}/{name}"))
}

/// Delete a media file; a file that is already gone is not an error.
pub async fn remove_media(media_dir: &Path, relative: &str) {
    match tokio::fs::remove_file(media_dir.join(relative)).await {
        Ok(()) => tracing::debug!(path = relative, "media file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = relative, error = %e, "cannot remove media file"),
    }
}
