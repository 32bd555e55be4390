//! HTML rendering. Pages are small enough to build with `format!`; every
//! interpolated value goes through [`escape`].

use axum::response::Html;
use identint_store::{Student, StudentDraft, StudentQuery};
use std::fmt::Write;

use crate::session::Flash;

const STYLE: &str = "body{font-family:sans-serif;max-width:60rem;margin:0 auto;padding:1rem}\
nav a{margin-right:1rem}.flash{padding:.5rem;margin:.5rem 0;border-radius:4px}\
.success{background:#dfd}.warning{background:#ffd}.error{background:#fdd}\
table{border-collapse:collapse;width:100%}\
td,th{border-bottom:1px solid #ccc;padding:.25rem;text-align:left}\
img.thumb{max-height:3rem}img.large{max-width:100%;max-height:24rem}";

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// URL under which a media-relative path is served.
pub fn media_url(relative: &str) -> String {
    format!("/media/{}", escape(relative))
}

fn opt(value: &Option<String>) -> String {
    value.as_deref().map(escape).unwrap_or_default()
}

pub fn page(title: &str, flashes: &[Flash], body: &str) -> Html<String> {
    let mut notices = String::new();
    for flash in flashes {
        let _ = write!(
            notices,
            r#"<div class="flash {}">{}</div>"#,
            flash.level.css_class(),
            escape(&flash.message)
        );
    }

    Html(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>{title} · IDENTINT</title><style>{STYLE}</style></head>
<body>
<nav><a href="/">Home</a><a href="/about">About</a><a href="/admin/students">Students</a></nav>
{notices}
<main>
{body}
</main>
</body>
</html>"#,
        title = escape(title),
    ))
}

pub fn home(flashes: &[Flash], max_upload_bytes: usize) -> Html<String> {
    let body = format!(
        r#"<h1>Identify a student</h1>
<p>Upload a photo showing a single face (JPG or PNG, max {} MB).</p>
<form method="post" action="/upload" enctype="multipart/form-data">
<input type="file" name="photo" accept="image/jpeg,image/png,image/jpg" required>
<button type="submit">Upload</button>
</form>"#,
        max_upload_bytes / (1024 * 1024)
    );
    page("Home", flashes, &body)
}

/// One row of the preview results.
pub struct MatchRow<'a> {
    pub student: &'a Student,
    pub similarity: f32,
    pub distance: f32,
}

pub fn preview(
    flashes: &[Flash],
    photo_path: &str,
    photo_name: &str,
    quality_message: Option<&str>,
    matches: &[MatchRow<'_>],
) -> Html<String> {
    let mut body = format!(
        r#"<h1>Uploaded photo</h1>
<figure><img class="large" src="{}" alt="{name}"><figcaption>{name}</figcaption></figure>"#,
        media_url(photo_path),
        name = escape(photo_name),
    );

    if let Some(message) = quality_message {
        let _ = write!(body, "<p><strong>{}</strong></p>", escape(message));
    }

    if matches.is_empty() {
        body.push_str("<p>No matching student found.</p>");
    } else {
        body.push_str(
            "<h2>Matches</h2><table><tr><th>Photo</th><th>Name</th><th>School</th>\
             <th>Year</th><th>Email</th><th>Similarity</th><th>Distance</th></tr>",
        );
        for row in matches {
            let s = row.student;
            let _ = write!(
                body,
                "<tr><td>{}</td><td><a href=\"/admin/students/{}\">{}</a></td><td>{}</td>\
                 <td>{}</td><td>{}</td><td>{:.1}%</td><td>{:.3}</td></tr>",
                thumbnail(s),
                s.id,
                escape(&s.full_name()),
                opt(&s.school),
                opt(&s.year),
                opt(&s.email),
                row.similarity,
                row.distance,
            );
        }
        body.push_str("</table>");
    }

    body.push_str(r#"<p><a href="/">Upload another photo</a></p>"#);
    page("Preview", flashes, &body)
}

pub fn about(flashes: &[Flash], match_threshold: f32) -> Html<String> {
    let body = format!(
        "<h1>About</h1>\
         <p>IDENTINT recognises students from a photo. The uploaded face is encoded \
         into a {}-dimensional vector and compared with the encodings stored for \
         every registered student.</p>\
         <p>A student matches when the Euclidean distance between the encodings is \
         at most {:.2}. Encodings have unit length, so this is a cosine similarity \
         of at least {:.2}. Raise <code>IDENTINT_MATCH_THRESHOLD</code> if the same \
         person is missed (the SFace model's reference cutoff is 1.128).</p>\
         <p>Version {}.</p>",
        identint_core::ENCODING_DIM,
        match_threshold,
        1.0 - match_threshold * match_threshold / 2.0,
        env!("CARGO_PKG_VERSION"),
    );
    page("About", flashes, &body)
}

pub fn not_found() -> Html<String> {
    page(
        "Not found",
        &[],
        r#"<h1>Page not found</h1>
<p>The page you requested does not exist. <a href="/">Back home</a></p>"#,
    )
}

pub fn server_error() -> Html<String> {
    page(
        "Server error",
        &[],
        r#"<h1>Something went wrong</h1>
<p>The error has been logged. <a href="/">Back home</a></p>"#,
    )
}

fn thumbnail(s: &Student) -> String {
    match (&s.photo, &s.photo_url) {
        (Some(photo), _) => format!(r#"<img class="thumb" src="{}" alt="">"#, media_url(photo)),
        (None, Some(url)) => format!(r#"<img class="thumb" src="{}" alt="">"#, escape(url)),
        (None, None) => String::new(),
    }
}

fn options(values: &[String], selected: &Option<String>) -> String {
    let mut out = String::from(r#"<option value="">All</option>"#);
    for v in values {
        let sel = if selected.as_deref() == Some(v.as_str()) { " selected" } else { "" };
        let _ = write!(out, r#"<option value="{v}"{sel}>{v}</option>"#, v = escape(v));
    }
    out
}

pub fn student_list(
    flashes: &[Flash],
    students: &[Student],
    query: &StudentQuery,
    schools: &[String],
    years: &[String],
) -> Html<String> {
    let mut body = format!(
        r#"<h1>Students</h1>
<p><a href="/admin/students/new">Add student</a></p>
<form method="get" action="/admin/students">
<input type="search" name="q" value="{}" placeholder="Name or email">
<select name="school">{}</select>
<select name="year">{}</select>
<button type="submit">Filter</button>
</form>
<form method="post" action="/admin/students/encode">
<table><tr><th></th><th>Photo</th><th>Name</th><th>School</th><th>Year</th><th>Email</th>
<th>Encoded</th><th>Created</th></tr>"#,
        opt(&query.search),
        options(schools, &query.school),
        options(years, &query.year),
    );

    for s in students {
        let _ = write!(
            body,
            "<tr><td><input type=\"checkbox\" name=\"ids\" value=\"{id}\"></td><td>{}</td>\
             <td><a href=\"/admin/students/{id}\">{}</a></td><td>{}</td><td>{}</td><td>{}</td>\
             <td>{}</td><td>{}</td></tr>",
            thumbnail(s),
            escape(&s.full_name()),
            opt(&s.school),
            opt(&s.year),
            opt(&s.email),
            if s.has_encoding() { "yes" } else { "no" },
            s.created_at.format("%Y-%m-%d %H:%M"),
            id = s.id,
        );
    }

    let _ = write!(
        body,
        "</table><p>{} student(s). <button type=\"submit\">Encode selected</button></p></form>",
        students.len()
    );
    page("Students", flashes, &body)
}

fn text_input(label: &str, name: &str, value: &str, required: bool) -> String {
    format!(
        r#"<p><label>{label}<br><input type="text" name="{name}" value="{}"{}></label></p>"#,
        escape(value),
        if required { " required" } else { "" },
    )
}

/// Create form when `student` is `None`, edit form otherwise.
pub fn student_form(
    flashes: &[Flash],
    student: Option<&Student>,
    draft: &StudentDraft,
    error: Option<&str>,
) -> Html<String> {
    let (title, action) = match student {
        Some(s) => (s.full_name(), format!("/admin/students/{}", s.id)),
        None => ("New student".to_string(), "/admin/students".to_string()),
    };

    let mut body = format!("<h1>{}</h1>", escape(&title));
    if let Some(error) = error {
        let _ = write!(body, r#"<div class="flash error">{}</div>"#, escape(error));
    }

    if let Some(s) = student {
        let photo = match (&s.photo, &s.photo_url) {
            (Some(p), _) => format!(r#"<img class="large" src="{}" alt="">"#, media_url(p)),
            (None, Some(u)) => format!(r#"<img class="large" src="{}" alt="">"#, escape(u)),
            (None, None) => "<p>No photo.</p>".to_string(),
        };
        body.push_str(&photo);
    }

    let _ = write!(
        body,
        r#"<form method="post" action="{action}" enctype="multipart/form-data">{}{}{}{}{}{}{}"#,
        text_input("First name", "first_name", &draft.first_name, true),
        text_input("Last name", "last_name", &draft.last_name, true),
        text_input("Email", "email", draft.email.as_deref().unwrap_or_default(), false),
        text_input("School", "school", draft.school.as_deref().unwrap_or_default(), false),
        text_input("Year", "year", draft.year.as_deref().unwrap_or_default(), false),
        text_input("Promotion", "promotion", draft.promotion.as_deref().unwrap_or_default(), false),
        text_input("Photo URL", "photo_url", draft.photo_url.as_deref().unwrap_or_default(), false),
    );
    body.push_str(
        r#"<p><label>Photo<br>
<input type="file" name="photo" accept="image/jpeg,image/png,image/jpg"></label></p>"#,
    );
    if student.is_some_and(|s| s.photo.is_some()) {
        body.push_str(
            r#"<p><label><input type="checkbox" name="clear_photo">
Remove current photo</label></p>"#,
        );
    }
    body.push_str(r#"<button type="submit">Save</button></form>"#);

    if let Some(s) = student {
        let encoding = if s.has_encoding() { "stored" } else { "not computed" };
        let _ = write!(
            body,
            r#"<dl><dt>Face encoding</dt><dd>{encoding}</dd>
<dt>Created</dt><dd>{}</dd><dt>Updated</dt><dd>{}</dd></dl>
<form method="post" action="/admin/students/encode">
<input type="hidden" name="ids" value="{id}"><button type="submit">Encode</button></form>
<form method="post" action="/admin/students/{id}/delete">
<button type="submit">Delete</button></form>"#,
            s.created_at.format("%Y-%m-%d %H:%M:%S"),
            s.updated_at.format("%Y-%m-%d %H:%M:%S"),
            id = s.id,
        );
    }

    body.push_str(r#"<p><a href="/admin/students">Back to list</a></p>"#);
    page(&title, flashes, &body)
}
