/// Student table. `UNIQUE` treats NULL emails as distinct, so two students
/// without an email may share a name.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS students (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    first_name    TEXT NOT NULL,
    last_name     TEXT NOT NULL,
    email         TEXT,
    school        TEXT,
    year          TEXT,
    promotion     TEXT,
    photo         TEXT,
    photo_url     TEXT,
    face_encoding TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    UNIQUE (first_name, last_name, email)
);

CREATE INDEX IF NOT EXISTS idx_students_name ON students (last_name, first_name);
CREATE INDEX IF NOT EXISTS idx_students_school_year ON students (school, year);
"#;

pub const STUDENT_COLUMNS: &str = "id, first_name, last_name, email, school, year, promotion, \
     photo, photo_url, face_encoding, created_at, updated_at";
