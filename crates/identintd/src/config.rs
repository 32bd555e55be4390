use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: 127.0.0.1:8000).
    pub bind: SocketAddr,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Root for student photos (`students_photos/`) and uploads (`temp/`).
    pub media_dir: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Maximum Euclidean distance for a gallery entry to count as a match
    /// (`IDENTINT_MATCH_THRESHOLD`). The 0.6 default is strict for SFace; see
    /// [`identint_core::DEFAULT_MATCH_THRESHOLD`].
    pub match_threshold: f32,
    /// Largest accepted photo upload, in bytes.
    pub max_upload_bytes: usize,
    /// Idle time after which a browser session and its upload are discarded.
    pub session_ttl: Duration,
}

impl Config {
    /// Load configuration from `IDENTINT_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = identint_core::default_data_dir();

        let bind = std::env::var("IDENTINT_BIND")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8000)));

        Self {
            bind,
            db_path: env_path("IDENTINT_DB_PATH").unwrap_or_else(|| data_dir.join("students.db")),
            media_dir: env_path("IDENTINT_MEDIA_DIR").unwrap_or_else(|| data_dir.join("media")),
            model_dir: env_path("IDENTINT_MODEL_DIR")
                .unwrap_or_else(identint_core::default_model_dir),
            match_threshold: env_parse(
                "IDENTINT_MATCH_THRESHOLD",
                identint_core::DEFAULT_MATCH_THRESHOLD,
            ),
            max_upload_bytes: env_parse("IDENTINT_MAX_UPLOAD_BYTES", 10 * 1024 * 1024),
            session_ttl: Duration::from_secs(env_parse("IDENTINT_SESSION_TTL_SECS", 3600)),
        }
    }

    /// Where uploaded photos are kept while their session lives.
    pub fn temp_dir(&self) -> PathBuf {
        self.media_dir.join(crate::upload::TEMP_SUBDIR)
    }

    /// Where student photos set through the admin pages are stored.
    pub fn student_photo_dir(&self) -> PathBuf {
        self.media_dir.join(crate::upload::STUDENT_PHOTO_SUBDIR)
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
