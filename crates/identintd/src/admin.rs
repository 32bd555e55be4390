//! Student administration pages under `/admin/students`.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use axum_extra::extract::cookie::CookieJar;
use axum_extra::extract::Form;
use identint_store::{StoreError, Student, StudentDraft, StudentId, StudentQuery};
use serde::Deserialize;

use crate::error::AppError;
use crate::recognition;
use crate::routes::AppState;
use crate::session::FlashLevel;
use crate::upload::{self, MultipartForm};
use crate::views;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/new", get(new_form))
        .route("/encode", post(encode))
        .route("/:id", get(detail).post(update))
        .route("/:id/delete", post(delete))
}

async fn list(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<StudentQuery>,
) -> Result<(CookieJar, Html<String>), AppError> {
    let (sid, jar) = state.sessions.resolve(jar);
    let q = query.clone();
    let (students, schools, years) = state
        .store
        .run(move |s| Ok((s.list(&q)?, s.schools()?, s.years()?)))
        .await?;

    let flashes = state.sessions.take_flashes(sid);
    Ok((jar, views::student_list(&flashes, &students, &query, &schools, &years)))
}

async fn new_form(State(state): State<AppState>, jar: CookieJar) -> (CookieJar, Html<String>) {
    let (sid, jar) = state.sessions.resolve(jar);
    let flashes = state.sessions.take_flashes(sid);
    (jar, views::student_form(&flashes, None, &StudentDraft::default(), None))
}

async fn detail(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(id): Path<StudentId>,
) -> Result<(CookieJar, Html<String>), AppError> {
    let (sid, jar) = state.sessions.resolve(jar);
    let student = load(&state, id).await?;
    let flashes = state.sessions.take_flashes(sid);
    let draft = StudentDraft::from(&student);
    Ok((jar, views::student_form(&flashes, Some(&student), &draft, None)))
}

async fn create(
    State(state): State<AppState>,
    jar: CookieJar,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let (sid, jar) = state.sessions.resolve(jar);
    let submitted = match Submitted::read(multipart, state.config.max_upload_bytes).await {
        Ok(submitted) => submitted,
        Err(rejected) => return rejected.respond(jar, None),
    };

    let draft = submitted.draft.clone();
    let student = match state.store.run(move |s| s.insert(&draft)).await {
        Ok(student) => student,
        Err(err) => return submitted.reject(err, jar, None),
    };

    if let Some((file, format)) = &submitted.photo {
        let path = upload::save_student_photo(&state.config.media_dir, file, *format).await?;
        let id = student.id;
        state.store.run(move |s| s.set_photo(id, Some(&path))).await?;
    }

    state
        .sessions
        .flash(sid, FlashLevel::Success, format!("Student \"{}\" was added.", student.full_name()));
    Ok((jar, Redirect::to(&format!("/admin/students/{}", student.id))).into_response())
}

async fn update(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(id): Path<StudentId>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let (sid, jar) = state.sessions.resolve(jar);
    let existing = load(&state, id).await?;
    let submitted = match Submitted::read(multipart, state.config.max_upload_bytes).await {
        Ok(submitted) => submitted,
        Err(rejected) => return rejected.respond(jar, Some(&existing)),
    };

    let draft = submitted.draft.clone();
    let student = match state.store.run(move |s| s.update(id, &draft)).await {
        Ok(student) => student,
        Err(err) => return submitted.reject(err, jar, Some(&existing)),
    };

    let new_photo = match &submitted.photo {
        Some((file, format)) => {
            Some(upload::save_student_photo(&state.config.media_dir, file, *format).await?)
        }
        None => None,
    };
    if new_photo.is_some() || submitted.clear_photo {
        state.store.run(move |s| s.set_photo(id, new_photo.as_deref())).await?;
        if let Some(old) = &existing.photo {
            upload::remove_media(&state.config.media_dir, old).await;
        }
    }

    let message = format!("Student \"{}\" was updated.", student.full_name());
    state.sessions.flash(sid, FlashLevel::Success, message);
    Ok((jar, Redirect::to(&format!("/admin/students/{id}"))).into_response())
}

async fn delete(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(id): Path<StudentId>,
) -> Result<(CookieJar, Redirect), AppError> {
    let (sid, jar) = state.sessions.resolve(jar);
    let removed = state
        .store
        .run(move |s| s.delete(id))
        .await?
        .ok_or(AppError::NotFound)?;

    if let Some(photo) = &removed.photo {
        upload::remove_media(&state.config.media_dir, photo).await;
    }
    let message = format!("Student \"{}\" was deleted.", removed.full_name());
    state.sessions.flash(sid, FlashLevel::Success, message);
    Ok((jar, Redirect::to("/admin/students")))
}

#[derive(Debug, Deserialize)]
struct EncodeForm {
    #[serde(default)]
    ids: Vec<StudentId>,
}

async fn encode(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<EncodeForm>,
) -> Result<(CookieJar, Redirect), AppError> {
    let (sid, jar) = state.sessions.resolve(jar);
    if form.ids.is_empty() {
        state.sessions.flash(sid, FlashLevel::Warning, "No students selected.");
        return Ok((jar, Redirect::to("/admin/students")));
    }

    let summary = recognition::encode_students(&state, form.ids).await?;
    state.sessions.with(sid, |data| {
        data.flash(
            FlashLevel::Success,
            format!("{} student(s) encoded successfully.", summary.encoded),
        );
        for (name, reason) in &summary.failures {
            data.flash(FlashLevel::Warning, format!("{name}: {reason}"));
        }
    });
    Ok((jar, Redirect::to("/admin/students")))
}

async fn load(state: &AppState, id: StudentId) -> Result<Student, AppError> {
    state
        .store
        .run(move |s| s.get(id))
        .await?
        .ok_or(AppError::NotFound)
}

/// A parsed student form: text fields plus an optional validated photo.
struct Submitted {
    draft: StudentDraft,
    photo: Option<(upload::UploadedFile, image::ImageFormat)>,
    clear_photo: bool,
}

/// A form that must be shown again with an error message.
struct Rejected {
    draft: StudentDraft,
    message: String,
}

impl Submitted {
    async fn read(multipart: Multipart, max_bytes: usize) -> Result<Self, Rejected> {
        let form = match upload::read_form(multipart, "photo", max_bytes).await {
            Ok(form) => form,
            Err(err) => {
                return Err(Rejected { draft: StudentDraft::default(), message: err.to_string() })
            }
        };

        let draft = draft_from(&form);
        let clear_photo = form.checked("clear_photo");
        let photo = match form.file {
            Some(file) => match file.validate(max_bytes) {
                Ok(format) => Some((file, format)),
                Err(err) => return Err(Rejected { draft, message: format!("Photo: {err}") }),
            },
            None => None,
        };

        Ok(Self { draft, photo, clear_photo })
    }

    /// Re-render for validation and uniqueness errors; anything else is a server error.
    fn reject(
        self,
        err: StoreError,
        jar: CookieJar,
        student: Option<&Student>,
    ) -> Result<Response, AppError> {
        match err {
            StoreError::Invalid { .. } | StoreError::Duplicate => Rejected {
                draft: self.draft,
                message: err.to_string(),
            }
            .respond(jar, student),
            err => Err(err.into()),
        }
    }
}

impl Rejected {
    fn respond(self, jar: CookieJar, student: Option<&Student>) -> Result<Response, AppError> {
        let html = views::student_form(&[], student, &self.draft, Some(&self.message));
        Ok((StatusCode::UNPROCESSABLE_ENTITY, jar, html).into_response())
    }
}

fn draft_from(form: &MultipartForm) -> StudentDraft {
    StudentDraft {
        first_name: form.text("first_name").unwrap_or_default(),
        last_name: form.text("last_name").unwrap_or_default(),
        email: form.text("email"),
        school: form.text("school"),
        year: form.text("year"),
        promotion: form.text("promotion"),
        photo_url: form.text("photo_url"),
    }
    .normalized()
}
