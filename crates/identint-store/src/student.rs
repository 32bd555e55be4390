use chrono::{DateTime, Utc};
use identint_core::{EncodingError, FaceEncoding};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::StoreError;

pub type StudentId = i64;

const NAME_MAX: usize = 100;
const AFFILIATION_MAX: usize = 100;
const PROMOTION_MAX: usize = 50;

/// A stored student record.
#[derive(Debug, Clone, Serialize)]
pub struct Student {
    pub id: StudentId,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub school: Option<String>,
    pub year: Option<String>,
    pub promotion: Option<String>,
    /// Photo path relative to the media directory.
    pub photo: Option<String>,
    /// External photo URL (e.g. a yearbook page).
    pub photo_url: Option<String>,
    /// Serialized face encoding (JSON array).
    pub face_encoding: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Student {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// Whether a decodable encoding is stored. Corrupt text counts as missing.
    pub fn has_encoding(&self) -> bool {
        matches!(self.encoding(), Ok(Some(_)))
    }

    /// Decode the stored encoding; `Ok(None)` when the student was never encoded.
    pub fn encoding(&self) -> Result<Option<FaceEncoding>, EncodingError> {
        match self.face_encoding.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => FaceEncoding::from_json(text).map(Some),
        }
    }
}

impl fmt::Display for Student {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({})",
            self.first_name,
            self.last_name,
            self.year.as_deref().unwrap_or("N/A")
        )
    }
}

/// Editable fields of a student, as submitted by a form or the CLI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudentDraft {
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub school: Option<String>,
    pub year: Option<String>,
    pub promotion: Option<String>,
    pub photo_url: Option<String>,
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn check_len(field: &'static str, value: Option<&str>, max: usize) -> Result<(), StoreError> {
    match value {
        Some(v) if v.chars().count() > max => Err(StoreError::Invalid {
            field,
            message: format!("must be at most {max} characters"),
        }),
        _ => Ok(()),
    }
}

impl StudentDraft {
    /// Trim every field and turn blank optionals into `None`.
    pub fn normalized(self) -> Self {
        Self {
            first_name: self.first_name.trim().to_string(),
            last_name: self.last_name.trim().to_string(),
            email: clean(self.email),
            school: clean(self.school),
            year: clean(self.year),
            promotion: clean(self.promotion),
            photo_url: clean(self.photo_url),
        }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.first_name.is_empty() {
            return Err(StoreError::Invalid { field: "first_name", message: "is required".into() });
        }
        if self.last_name.is_empty() {
            return Err(StoreError::Invalid { field: "last_name", message: "is required".into() });
        }
        check_len("first_name", Some(&self.first_name), NAME_MAX)?;
        check_len("last_name", Some(&self.last_name), NAME_MAX)?;
        check_len("school", self.school.as_deref(), AFFILIATION_MAX)?;
        check_len("year", self.year.as_deref(), AFFILIATION_MAX)?;
        check_len("promotion", self.promotion.as_deref(), PROMOTION_MAX)?;

        // Single-label domains such as `localhost` are valid.
        if let Some(email) = &self.email {
            let valid = email.split_once('@').is_some_and(|(user, domain)| {
                !user.is_empty() && !domain.is_empty() && !domain.contains('@')
            });
            if !valid || email.contains(char::is_whitespace) {
                return Err(StoreError::Invalid {
                    field: "email",
                    message: "is not a valid address".into(),
                });
            }
        }

        if let Some(url) = &self.photo_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(StoreError::Invalid {
                    field: "photo_url",
                    message: "must be an http(s) URL".into(),
                });
            }
        }

        Ok(())
    }
}

impl From<&Student> for StudentDraft {
    fn from(s: &Student) -> Self {
        Self {
            first_name: s.first_name.clone(),
            last_name: s.last_name.clone(),
            email: s.email.clone(),
            school: s.school.clone(),
            year: s.year.clone(),
            promotion: s.promotion.clone(),
            photo_url: s.photo_url.clone(),
        }
    }
}

/// Search and filter options for listing students.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StudentQuery {
    /// Substring matched against first name, last name and email.
    #[serde(rename = "q")]
    pub search: Option<String>,
    pub school: Option<String>,
    pub year: Option<String>,
}
