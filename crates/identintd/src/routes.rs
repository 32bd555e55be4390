use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::CookieJar;
use identint_store::AsyncStore;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::error::AppError;
use crate::recognition::{self, Analysis};
use crate::session::{FlashLevel, SessionStore, UploadedPhoto};
use crate::upload::{self, UploadError};
use crate::views::{self, MatchRow};
use crate::admin;

/// Room for multipart boundaries and text fields on top of the photo itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: AsyncStore,
    pub engine: EngineHandle,
    pub sessions: Arc<SessionStore>,
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes + MULTIPART_OVERHEAD;
    let media = ServeDir::new(&state.config.media_dir);

    Router::new()
        .route("/", get(home))
        .route("/upload", post(upload_photo))
        .route("/preview", get(preview))
        .route("/about", get(about))
        .route("/health", get(health))
        .nest("/admin/students", admin::router())
        .nest_service("/media", media)
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn home(State(state): State<AppState>, jar: CookieJar) -> (CookieJar, Html<String>) {
    let (sid, jar) = state.sessions.resolve(jar);
    let flashes = state.sessions.take_flashes(sid);
    (jar, views::home(&flashes, state.config.max_upload_bytes))
}

async fn upload_photo(
    State(state): State<AppState>,
    jar: CookieJar,
    multipart: Multipart,
) -> Result<(CookieJar, Redirect), AppError> {
    let (sid, jar) = state.sessions.resolve(jar);
    let max = state.config.max_upload_bytes;

    let file = match accept_photo(multipart, max).await {
        Ok(file) => file,
        Err(err) if err.is_client_error() => {
            tracing::info!(error = %err, "upload rejected");
            state.sessions.flash(sid, FlashLevel::Error, err.to_string());
            return Ok((jar, Redirect::to("/")));
        }
        Err(err) => return Err(err.into()),
    };

    let temp = upload::save_temp(&state.config.media_dir, &file).await?;
    // Results of the previous photo go with it, so a failed analysis below
    // never shows them against the new upload.
    let previous = state.sessions.with(sid, |data| {
        data.quality_message = None;
        data.matches.clear();
        data.upload.replace(UploadedPhoto { path: temp.clone(), name: file.file_name.clone() })
    });
    if let Some(previous) = previous {
        upload::remove_media(&state.config.media_dir, &previous.path).await;
    }

    let temp_path = state.config.media_dir.join(&temp);
    let analysis = recognition::analyze_upload(&state, &temp_path).await?;
    state.sessions.with(sid, |data| {
        data.quality_message = Some(analysis.message().to_string());
        match analysis {
            Analysis::Matched { matches, .. } => {
                data.matches = matches;
                data.flash(FlashLevel::Success, "Photo uploaded successfully!");
            }
            Analysis::Rejected { message } => {
                data.matches.clear();
                data.flash(FlashLevel::Warning, message);
            }
        }
    });

    Ok((jar, Redirect::to("/preview")))
}

async fn accept_photo(
    multipart: Multipart,
    max: usize,
) -> Result<upload::UploadedFile, UploadError> {
    let form = upload::read_form(multipart, "photo", max).await?;
    let file = form.file.ok_or(UploadError::MissingFile)?;
    file.validate(max)?;
    Ok(file)
}

async fn preview(State(state): State<AppState>, jar: CookieJar) -> Result<Response, AppError> {
    let (sid, jar) = state.sessions.resolve(jar);
    let (upload, quality, matches) = state.sessions.with(sid, |data| {
        (data.upload.clone(), data.quality_message.clone(), data.matches.clone())
    });

    let Some(upload) = upload else {
        state.sessions.flash(sid, FlashLevel::Warning, "No photo has been uploaded.");
        return Ok((jar, Redirect::to("/")).into_response());
    };

    let ids: Vec<_> = matches.iter().map(|m| m.student_id).collect();
    let students: HashMap<_, _> = state
        .store
        .run(move |s| s.get_many(&ids))
        .await?
        .into_iter()
        .map(|s| (s.id, s))
        .collect();

    // Students deleted since the upload drop out of the results.
    let rows: Vec<MatchRow<'_>> = matches
        .iter()
        .filter_map(|m| {
            students.get(&m.student_id).map(|student| MatchRow {
                student,
                similarity: m.similarity,
                distance: m.distance,
            })
        })
        .collect();

    let flashes = state.sessions.take_flashes(sid);
    let html = views::preview(&flashes, &upload.path, &upload.name, quality.as_deref(), &rows);
    Ok((jar, html).into_response())
}

async fn about(State(state): State<AppState>, jar: CookieJar) -> (CookieJar, Html<String>) {
    let (sid, jar) = state.sessions.resolve(jar);
    let flashes = state.sessions.take_flashes(sid);
    (jar, views::about(&flashes, state.config.match_threshold))
}

async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let stats = state.store.run(|s| s.stats()).await?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "students": stats.students,
        "encoded": stats.encoded,
        "sessions": state.sessions.active_count(),
    })))
}

async fn not_found() -> (StatusCode, Html<String>) {
    (StatusCode::NOT_FOUND, views::not_found())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::testing::{axis_encoding, png_bytes, ColorBackend, CRASH_FACES};
    use axum::body::Body;
    use axum::http::{header, Request};
    use identint_store::StudentDraft;
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "identint-test-boundary";

    struct TestApp {
        router: Router,
        state: AppState,
        _media: tempfile::TempDir,
    }

    async fn test_app(max_upload_bytes: usize) -> TestApp {
        let media = tempfile::tempdir().unwrap();
        let config = Config {
            bind: "127.0.0.1:0".parse().unwrap(),
            db_path: media.path().join("unused.db"),
            media_dir: media.path().to_path_buf(),
            model_dir: media.path().join("models"),
            match_threshold: identint_core::DEFAULT_MATCH_THRESHOLD,
            max_upload_bytes,
            session_ttl: Duration::from_secs(3600),
        };
        let state = AppState {
            config: Arc::new(config),
            store: AsyncStore::open_in_memory().await.unwrap(),
            engine: spawn_engine(ColorBackend).unwrap(),
            sessions: Arc::new(SessionStore::new(Duration::from_secs(3600))),
        };
        TestApp { router: router(state.clone()), state, _media: media }
    }

    impl TestApp {
        async fn send(&self, req: Request<Body>) -> Response {
            self.router.clone().oneshot(req).await.unwrap()
        }

        async fn get(&self, uri: &str, cookie: Option<&str>) -> Response {
            let mut req = Request::get(uri);
            if let Some(cookie) = cookie {
                req = req.header(header::COOKIE, cookie);
            }
            self.send(req.body(Body::empty()).unwrap()).await
        }

        async fn add_student(&self, first: &str, last: &str, axis: Option<usize>) -> i64 {
            let draft = StudentDraft {
                first_name: first.into(),
                last_name: last.into(),
                ..Default::default()
            };
            self.state
                .store
                .run(move |s| {
                    let student = s.insert(&draft)?;
                    if let Some(axis) = axis {
                        s.set_encoding(student.id, &axis_encoding(axis))?;
                    }
                    Ok(student.id)
                })
                .await
                .unwrap()
        }
    }

    /// Multipart body with text fields and an optional `photo` file part.
    fn form_body(fields: &[(&str, &str)], photo: Option<(&str, &[u8])>) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            let part = format!(
                "--{BOUNDARY}\r\n\
                 Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            );
            body.extend_from_slice(part.as_bytes());
        }
        if let Some((content_type, bytes)) = photo {
            let head = format!(
                "--{BOUNDARY}\r\n\
                 Content-Disposition: form-data; name=\"photo\"; filename=\"me.png\"\r\n\
                 Content-Type: {content_type}\r\n\r\n"
            );
            body.extend_from_slice(head.as_bytes());
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn multipart_request(
        uri: &str,
        fields: &[(&str, &str)],
        photo: Option<(&str, &[u8])>,
        cookie: Option<&str>,
    ) -> Request<Body> {
        let mut req = Request::post(uri)
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"));
        if let Some(cookie) = cookie {
            req = req.header(header::COOKIE, cookie);
        }
        req.body(Body::from(form_body(fields, photo))).unwrap()
    }

    fn upload_request(content_type: &str, bytes: &[u8], cookie: Option<&str>) -> Request<Body> {
        multipart_request("/upload", &[], Some((content_type, bytes)), cookie)
    }

    fn location(resp: &Response) -> &str {
        resp.headers()[header::LOCATION].to_str().unwrap()
    }

    /// `name=value` of the session cookie set by a response.
    fn session_cookie(resp: &Response) -> String {
        let set = resp.headers()[header::SET_COOKIE].to_str().unwrap();
        set.split(';').next().unwrap().to_string()
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_wrong_type_redirects_home_with_error() {
        let app = test_app(1024 * 1024).await;
        let resp = app.send(upload_request("image/gif", &png_bytes(1, 0), None)).await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&resp), "/");

        let cookie = session_cookie(&resp);
        let html = body_text(app.get("/", Some(&cookie)).await).await;
        assert!(html.contains("Unsupported format. Use JPG or PNG."));
    }

    #[tokio::test]
    async fn test_oversized_upload_redirects_home_with_error() {
        let app = test_app(1024).await;
        let resp = app.send(upload_request("image/png", &[0u8; 4096], None)).await;
        assert_eq!(location(&resp), "/");

        let cookie = session_cookie(&resp);
        let html = body_text(app.get("/", Some(&cookie)).await).await;
        assert!(html.contains("The photo is too large"));
    }

    #[tokio::test]
    async fn test_good_upload_previews_matched_student() {
        let app = test_app(1024 * 1024).await;
        app.add_student("Ada", "Lovelace", Some(3)).await;
        app.add_student("Alan", "Turing", Some(7)).await;

        let resp = app.send(upload_request("image/png", &png_bytes(1, 3), None)).await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&resp), "/preview");

        let cookie = session_cookie(&resp);
        let resp = app.get("/preview", Some(&cookie)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let html = body_text(resp).await;
        assert!(html.contains("Ada Lovelace"));
        assert!(html.contains("100.0%"));
        assert!(!html.contains("Alan Turing"), "orthogonal encoding is beyond the threshold");
        assert!(html.contains("Good quality photo"));
        assert!(html.contains("/media/temp/"));
    }

    #[tokio::test]
    async fn test_group_photo_is_rejected() {
        let app = test_app(1024 * 1024).await;
        app.add_student("Ada", "Lovelace", Some(3)).await;

        let resp = app.send(upload_request("image/png", &png_bytes(2, 3), None)).await;
        let cookie = session_cookie(&resp);
        let html = body_text(app.get("/preview", Some(&cookie)).await).await;
        assert!(html.contains("2 faces detected. Please upload a photo with a single person."));
        assert!(!html.contains("Ada Lovelace"));
    }

    #[tokio::test]
    async fn test_second_upload_replaces_temp_file() {
        let app = test_app(1024 * 1024).await;
        let resp = app.send(upload_request("image/png", &png_bytes(1, 0), None)).await;
        let cookie = session_cookie(&resp);
        app.send(upload_request("image/png", &png_bytes(1, 1), Some(&cookie))).await;

        let temp = std::fs::read_dir(app.state.config.temp_dir()).unwrap().count();
        assert_eq!(temp, 1);
    }

    #[tokio::test]
    async fn test_preview_without_upload_redirects_home() {
        let app = test_app(1024 * 1024).await;
        let resp = app.get("/preview", None).await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&resp), "/");

        let cookie = session_cookie(&resp);
        let html = body_text(app.get("/", Some(&cookie)).await).await;
        assert!(html.contains("No photo has been uploaded."));
    }

    #[tokio::test]
    async fn test_static_pages_and_fallback() {
        let app = test_app(1024 * 1024).await;
        assert_eq!(app.get("/about", None).await.status(), StatusCode::OK);
        assert_eq!(app.get("/no/such/page", None).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let app = test_app(1024 * 1024).await;
        app.add_student("Ada", "Lovelace", Some(3)).await;
        app.add_student("Alan", "Turing", None).await;

        let resp = app.get("/health", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(json["students"], 2);
        assert_eq!(json["encoded"], 1);
    }

    #[tokio::test]
    async fn test_admin_encode_selected() {
        let app = test_app(1024 * 1024).await;
        let id = app.add_student("Ada", "Lovelace", None).await;
        let no_photo = app.add_student("Alan", "Turing", None).await;

        let dir = app.state.config.student_photo_dir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("ada.png"), png_bytes(1, 5)).unwrap();
        app.state
            .store
            .run(move |s| s.set_photo(id, Some("students_photos/ada.png")))
            .await
            .unwrap();

        let req = Request::post("/admin/students/encode")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(format!("ids={id}&ids={no_photo}")))
            .unwrap();
        let resp = app.send(req).await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&resp), "/admin/students");

        let student = app.state.store.run(move |s| s.get(id)).await.unwrap().unwrap();
        assert_eq!(student.encoding().unwrap(), Some(axis_encoding(5)));

        let cookie = session_cookie(&resp);
        let html = body_text(app.get("/admin/students", Some(&cookie)).await).await;
        assert!(html.contains("1 student(s) encoded successfully."));
        assert!(html.contains("Alan Turing: no photo"));
    }

    #[tokio::test]
    async fn test_admin_create_and_duplicate() {
        let app = test_app(1024 * 1024).await;
        let form = |first: &str| {
            let fields = [
                ("first_name", first),
                ("last_name", "Lovelace"),
                ("email", "ada@example.org"),
            ];
            multipart_request("/admin/students", &fields, None, None)
        };

        let resp = app.send(form("Ada")).await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert!(location(&resp).starts_with("/admin/students/"));

        let resp = app.send(form("Ada")).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body_text(resp).await.contains("already exists"));

        let resp = app.send(form("")).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body_text(resp).await.contains("first_name is required"));
    }

    #[tokio::test]
    async fn test_failed_reupload_drops_previous_matches() {
        let app = test_app(1024 * 1024).await;
        app.add_student("Ada", "Lovelace", Some(3)).await;

        let resp = app.send(upload_request("image/png", &png_bytes(1, 3), None)).await;
        let cookie = session_cookie(&resp);
        let html = body_text(app.get("/preview", Some(&cookie)).await).await;
        assert!(html.contains("Ada Lovelace"));

        let crash = png_bytes(CRASH_FACES, 0);
        let resp = app.send(upload_request("image/png", &crash, Some(&cookie))).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let html = body_text(app.get("/preview", Some(&cookie)).await).await;
        assert!(!html.contains("Ada Lovelace"));
        assert!(!html.contains("Good quality photo"));
        assert!(html.contains("No matching student found."));
    }

    #[tokio::test]
    async fn test_admin_update_with_new_photo_and_clear_checkbox() {
        let app = test_app(1024 * 1024).await;
        let id = app.add_student("Ada", "Lovelace", None).await;
        let dir = app.state.config.student_photo_dir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("old.png"), png_bytes(1, 3)).unwrap();
        app.state
            .store
            .run(move |s| s.set_photo(id, Some("students_photos/old.png")))
            .await
            .unwrap();

        let uri = format!("/admin/students/{id}");
        let fields = [("first_name", "Ada"), ("last_name", "Lovelace"), ("clear_photo", "on")];
        let png = png_bytes(1, 4);
        let resp = app
            .send(multipart_request(&uri, &fields, Some(("image/png", png.as_slice())), None))
            .await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&resp), uri);

        // An uploaded file wins over the checkbox.
        let student = app.state.store.run(move |s| s.get(id)).await.unwrap().unwrap();
        let photo = student.photo.expect("new photo stored");
        assert!(photo.starts_with("students_photos/"));
        assert_ne!(photo, "students_photos/old.png");
        assert!(app.state.config.media_dir.join(&photo).exists());
        assert!(!dir.join("old.png").exists());

        // The checkbox alone removes the photo.
        let resp = app.send(multipart_request(&uri, &fields, None, None)).await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        let student = app.state.store.run(move |s| s.get(id)).await.unwrap().unwrap();
        assert_eq!(student.photo, None);
        assert!(!app.state.config.media_dir.join(&photo).exists());
    }

    #[tokio::test]
    async fn test_about_page_states_match_threshold() {
        let app = test_app(1024 * 1024).await;
        let html = body_text(app.get("/about", None).await).await;
        assert!(html.contains("is at most 0.60"));
        assert!(html.contains("cosine similarity of at least 0.82"));
        assert!(html.contains("IDENTINT_MATCH_THRESHOLD"));
    }

    #[tokio::test]
    async fn test_admin_list_filters_and_unknown_student() {
        let app = test_app(1024 * 1024).await;
        app.add_student("Ada", "Lovelace", None).await;
        app.add_student("Alan", "Turing", None).await;

        let html = body_text(app.get("/admin/students?q=turing", None).await).await;
        assert!(html.contains("Alan Turing"));
        assert!(!html.contains("Ada Lovelace"));

        assert_eq!(app.get("/admin/students/999", None).await.status(), StatusCode::NOT_FOUND);
    }
}
