//! identint-store: Student records and their face encodings in SQLite.
//!
//! [`Students`] holds every query and borrows a `rusqlite::Connection`, so
//! the same code serves the synchronous [`StudentStore`] used by the CLI and
//! the [`AsyncStore`] used by the web server.

mod schema;
mod store;
mod student;

use thiserror::Error;

pub use store::{AsyncStore, StoreStats, StudentStore, Students};
pub use student::{Student, StudentDraft, StudentId, StudentQuery};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{field} {message}")]
    Invalid { field: &'static str, message: String },
    #[error("a student with the same first name, last name and email already exists")]
    Duplicate,
    #[error("student {0} not found")]
    NotFound(StudentId),
    #[error("cannot create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("database connection: {0}")]
    Connection(String),
}

impl StoreError {
    /// Recover the original error from a `tokio-rusqlite` call.
    fn from_call(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(e) => StoreError::Sqlite(e),
            tokio_rusqlite::Error::Other(e) => match e.downcast::<StoreError>() {
                Ok(inner) => *inner,
                Err(other) => StoreError::Connection(other.to_string()),
            },
            other => StoreError::Connection(other.to_string()),
        }
    }
}
