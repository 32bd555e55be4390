//! In-memory browser sessions keyed by an HTTP-only cookie.
//!
//! A session carries the last uploaded photo, its match results and pending
//! flash messages. Sessions idle for longer than the TTL are treated as
//! missing and purged; their temporary upload is handed back for deletion.

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use identint_store::StudentId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "identint_session";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashLevel {
    Success,
    Warning,
    Error,
}

impl FlashLevel {
    pub fn css_class(self) -> &'static str {
        match self {
            FlashLevel::Success => "success",
            FlashLevel::Warning => "warning",
            FlashLevel::Error => "error",
        }
    }
}

/// One-shot notice shown on the next rendered page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flash {
    pub level: FlashLevel,
    pub message: String,
}

/// The uploaded photo awaiting preview.
#[derive(Debug, Clone)]
pub struct UploadedPhoto {
    /// Media-relative path of the temporary copy.
    pub path: String,
    /// File name as sent by the browser.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMatch {
    pub student_id: StudentId,
    pub similarity: f32,
    pub distance: f32,
}

#[derive(Debug, Clone, Default)]
pub struct SessionData {
    pub upload: Option<UploadedPhoto>,
    pub quality_message: Option<String>,
    pub matches: Vec<StoredMatch>,
    pub flashes: Vec<Flash>,
}

impl SessionData {
    pub fn flash(&mut self, level: FlashLevel, message: impl Into<String>) {
        self.flashes.push(Flash { level, message: message.into() });
    }
}

struct Entry {
    data: SessionData,
    last_seen: Instant,
}

pub struct SessionStore {
    entries: Mutex<HashMap<Uuid, Entry>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: Mutex::new(HashMap::new()), ttl }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The live session named by the cookie, or a fresh one with the cookie set.
    pub fn resolve(&self, jar: CookieJar) -> (Uuid, CookieJar) {
        let now = Instant::now();
        let existing = jar
            .get(SESSION_COOKIE)
            .and_then(|c| Uuid::parse_str(c.value()).ok());

        let mut entries = self.lock();
        if let Some(id) = existing {
            if let Some(entry) = entries.get_mut(&id) {
                if now.duration_since(entry.last_seen) <= self.ttl {
                    entry.last_seen = now;
                    return (id, jar);
                }
            }
        }

        let id = Uuid::new_v4();
        entries.insert(id, Entry { data: SessionData::default(), last_seen: now });
        drop(entries);

        let cookie = Cookie::build((SESSION_COOKIE, id.to_string()))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .build();
        (id, jar.add(cookie))
    }

    /// Run `f` on the session's data. Unknown ids get an empty session.
    pub fn with<R>(&self, id: Uuid, f: impl FnOnce(&mut SessionData) -> R) -> R {
        let mut entries = self.lock();
        let entry = entries.entry(id).or_insert_with(|| Entry {
            data: SessionData::default(),
            last_seen: Instant::now(),
        });
        f(&mut entry.data)
    }

    pub fn flash(&self, id: Uuid, level: FlashLevel, message: impl Into<String>) {
        self.with(id, |data| data.flash(level, message));
    }

    /// Remove and return the pending flash messages.
    pub fn take_flashes(&self, id: Uuid) -> Vec<Flash> {
        self.with(id, |data| std::mem::take(&mut data.flashes))
    }

    /// Drop expired sessions, returning the temporary uploads they owned.
    pub fn purge_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let mut stale = Vec::new();
        self.lock().retain(|_, entry| {
            let alive = now.duration_since(entry.last_seen) <= self.ttl;
            if !alive {
                if let Some(upload) = entry.data.upload.take() {
                    stale.push(upload.path);
                }
            }
            alive
        });
        stale
    }

    /// Number of sessions currently held, expired ones included until purged.
    pub fn active_count(&self) -> usize {
        self.lock().len()
    }
}
