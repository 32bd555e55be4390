use chrono::{DateTime, Utc};
use identint_core::FaceEncoding;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;

use crate::schema::{SCHEMA, STUDENT_COLUMNS};
use crate::student::{Student, StudentDraft, StudentId, StudentQuery};
use crate::StoreError;

/// Record counts, reported by the health endpoint and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub students: i64,
    pub encoded: i64,
}

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: row.get(0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        email: row.get(3)?,
        school: row.get(4)?,
        year: row.get(5)?,
        promotion: row.get(6)?,
        photo: row.get(7)?,
        photo_url: row.get(8)?,
        face_encoding: row.get(9)?,
        created_at: row.get::<_, DateTime<Utc>>(10)?,
        updated_at: row.get::<_, DateTime<Utc>>(11)?,
    })
}

/// Map a UNIQUE violation to [`StoreError::Duplicate`].
fn unique_violation(err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(e, _) = &err {
        if e.code == ErrorCode::ConstraintViolation
            && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        {
            return StoreError::Duplicate;
        }
    }
    StoreError::Sqlite(err)
}

/// Escape `%`, `_` and `\` so user input matches literally inside `LIKE`.
fn like_pattern(search: &str) -> String {
    let mut escaped = String::with_capacity(search.len() + 2);
    escaped.push('%');
    for c in search.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Student queries over a borrowed connection.
pub struct Students<'c> {
    conn: &'c Connection,
}

impl<'c> Students<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, draft: &StudentDraft) -> Result<Student, StoreError> {
        draft.validate()?;
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO students
                    (first_name, last_name, email, school, year, promotion, photo_url,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    draft.first_name,
                    draft.last_name,
                    draft.email,
                    draft.school,
                    draft.year,
                    draft.promotion,
                    draft.photo_url,
                    now,
                ],
            )
            .map_err(unique_violation)?;

        let id = self.conn.last_insert_rowid();
        tracing::info!(student_id = id, "student created");
        self.require(id)
    }

    pub fn update(&self, id: StudentId, draft: &StudentDraft) -> Result<Student, StoreError> {
        draft.validate()?;
        let changed = self
            .conn
            .execute(
                "UPDATE students
                 SET first_name = ?1, last_name = ?2, email = ?3, school = ?4, year = ?5,
                     promotion = ?6, photo_url = ?7, updated_at = ?8
                 WHERE id = ?9",
                params![
                    draft.first_name,
                    draft.last_name,
                    draft.email,
                    draft.school,
                    draft.year,
                    draft.promotion,
                    draft.photo_url,
                    Utc::now(),
                    id,
                ],
            )
            .map_err(unique_violation)?;

        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        tracing::info!(student_id = id, "student updated");
        self.require(id)
    }

    /// Replace the photo reference. Any existing encoding belonged to the old
    /// photo and is cleared.
    pub fn set_photo(&self, id: StudentId, photo: Option<&str>) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE students SET photo = ?1, face_encoding = NULL, updated_at = ?2 WHERE id = ?3",
            params![photo, Utc::now(), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Store an encoding only if the student still has the photo it was computed
    /// from. Returns `false` when the photo changed in the meantime.
    pub fn set_encoding_for_photo(
        &self,
        id: StudentId,
        photo: &str,
        encoding: &FaceEncoding,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE students SET face_encoding = ?1, updated_at = ?2 WHERE id = ?3 AND photo = ?4",
            params![encoding.to_json(), Utc::now(), id, photo],
        )?;
        if changed == 0 {
            self.require(id)?;
            tracing::warn!(student_id = id, "photo changed while encoding, result dropped");
            return Ok(false);
        }
        tracing::info!(student_id = id, "face encoding stored");
        Ok(true)
    }

    pub fn set_encoding(&self, id: StudentId, encoding: &FaceEncoding) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE students SET face_encoding = ?1, updated_at = ?2 WHERE id = ?3",
            params![encoding.to_json(), Utc::now(), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        tracing::info!(student_id = id, "face encoding stored");
        Ok(())
    }

    pub fn get(&self, id: StudentId) -> Result<Option<Student>, StoreError> {
        let sql = format!("SELECT {STUDENT_COLUMNS} FROM students WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, [id], student_from_row)
            .optional()?)
    }

    fn require(&self, id: StudentId) -> Result<Student, StoreError> {
        self.get(id)?.ok_or(StoreError::NotFound(id))
    }

    /// Fetch several students, keeping the order of `ids` and skipping unknown ones.
    pub fn get_many(&self, ids: &[StudentId]) -> Result<Vec<Student>, StoreError> {
        let mut students = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some(student) = self.get(id)? {
                students.push(student);
            }
        }
        Ok(students)
    }

    /// Students matching the query, ordered by last name then first name.
    pub fn list(&self, query: &StudentQuery) -> Result<Vec<Student>, StoreError> {
        let sql = format!(
            "SELECT {STUDENT_COLUMNS} FROM students
             WHERE (?1 IS NULL
                    OR first_name LIKE ?1 ESCAPE '\\'
                    OR last_name LIKE ?1 ESCAPE '\\'
                    OR email LIKE ?1 ESCAPE '\\')
               AND (?2 IS NULL OR school = ?2)
               AND (?3 IS NULL OR year = ?3)
             ORDER BY last_name, first_name, id"
        );
        let search = non_blank(&query.search).map(like_pattern);
        let mut stmt = self.conn.prepare(&sql)?;
        let students = stmt
            .query_map(
                params![search, non_blank(&query.school), non_blank(&query.year)],
                student_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(students)
    }

    /// Distinct non-empty schools, for list filters.
    pub fn schools(&self) -> Result<Vec<String>, StoreError> {
        self.distinct(
            "SELECT DISTINCT school FROM students WHERE school IS NOT NULL ORDER BY school",
        )
    }

    /// Distinct non-empty years, for list filters.
    pub fn years(&self) -> Result<Vec<String>, StoreError> {
        self.distinct("SELECT DISTINCT year FROM students WHERE year IS NOT NULL ORDER BY year")
    }

    fn distinct(&self, sql: &str) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let values = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(values)
    }

    /// Delete a student, returning the removed record so its photo can be cleaned up.
    pub fn delete(&self, id: StudentId) -> Result<Option<Student>, StoreError> {
        let Some(student) = self.get(id)? else {
            return Ok(None);
        };
        self.conn.execute("DELETE FROM students WHERE id = ?1", [id])?;
        tracing::info!(student_id = id, "student deleted");
        Ok(Some(student))
    }

    fn stored_encodings(&self) -> Result<Vec<(StudentId, String)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, face_encoding FROM students
             WHERE face_encoding IS NOT NULL AND TRIM(face_encoding) != ''
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, StudentId>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every decodable stored encoding. Corrupt entries are logged and skipped
    /// so one bad row never hides the rest of the gallery.
    pub fn gallery(&self) -> Result<Vec<(StudentId, FaceEncoding)>, StoreError> {
        let rows = self.stored_encodings()?;
        let mut gallery = Vec::with_capacity(rows.len());
        for (id, text) in rows {
            match FaceEncoding::from_json(&text) {
                Ok(encoding) => gallery.push((id, encoding)),
                Err(err) => {
                    tracing::warn!(student_id = id, error = %err, "skipping invalid face encoding")
                }
            }
        }
        Ok(gallery)
    }

    /// Student count and the number of students with a usable encoding.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let students = self
            .conn
            .query_row("SELECT COUNT(*) FROM students", [], |row| row.get(0))?;
        let encoded = self
            .stored_encodings()?
            .iter()
            .filter(|(_, text)| FaceEncoding::from_json(text).is_ok())
            .count() as i64;
        Ok(StoreStats { students, encoded })
    }
}

fn prepare_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

/// Synchronous store owning its connection.
pub struct StudentStore {
    conn: Connection,
}

impl StudentStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        prepare_connection(&conn)?;
        tracing::debug!(path = %path.display(), "student database opened");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        prepare_connection(&conn)?;
        Ok(Self { conn })
    }

    pub fn students(&self) -> Students<'_> {
        Students::new(&self.conn)
    }
}

/// Async store: the connection lives on a `tokio-rusqlite` background thread.
#[derive(Clone)]
pub struct AsyncStore {
    conn: tokio_rusqlite::Connection,
}

impl AsyncStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .map_err(StoreError::from_call)?;
        Self::prepare(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory()
            .await
            .map_err(StoreError::from_call)?;
        Self::prepare(conn).await
    }

    async fn prepare(conn: tokio_rusqlite::Connection) -> Result<Self, StoreError> {
        conn.call(|c| Ok(prepare_connection(c)?))
            .await
            .map_err(StoreError::from_call)?;
        Ok(Self { conn })
    }

    /// Run `f` against the connection on the database thread.
    pub async fn run<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Students<'_>) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        self.conn
            .call(move |conn| {
                f(&Students::new(conn)).map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))
            })
            .await
            .map_err(StoreError::from_call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use identint_core::ENCODING_DIM;

    fn draft(first: &str, last: &str, email: Option<&str>) -> StudentDraft {
        StudentDraft {
            first_name: first.into(),
            last_name: last.into(),
            email: email.map(Into::into),
            ..Default::default()
        }
    }

    fn encoding(v: f32) -> FaceEncoding {
        FaceEncoding::new(vec![v; ENCODING_DIM]).unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let store = StudentStore::open_in_memory().unwrap();
        let s = store
            .students()
            .insert(&StudentDraft { year: Some("2A".into()), ..draft("Ada", "Lovelace", None) })
            .unwrap();
        let fetched = store.students().get(s.id).unwrap().unwrap();
        assert_eq!(fetched.full_name(), "Ada Lovelace");
        assert_eq!(fetched.to_string(), "Ada Lovelace (2A)");
        assert!(!fetched.has_encoding());
    }

    #[test]
    fn test_unique_together_reports_duplicate() {
        let store = StudentStore::open_in_memory().unwrap();
        let students = store.students();
        students.insert(&draft("Ada", "Lovelace", Some("ada@x.org"))).unwrap();
        let err = students.insert(&draft("Ada", "Lovelace", Some("ada@x.org"))).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate));

        // Different email is a different student.
        assert!(students.insert(&draft("Ada", "Lovelace", Some("ada@y.org"))).is_ok());
    }

    #[test]
    fn test_update_missing_student() {
        let store = StudentStore::open_in_memory().unwrap();
        let err = store.students().update(42, &draft("A", "B", None)).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(42)));
    }

    #[test]
    fn test_list_orders_by_last_then_first_name() {
        let store = StudentStore::open_in_memory().unwrap();
        let students = store.students();
        students.insert(&draft("Grace", "Hopper", None)).unwrap();
        students.insert(&draft("Alan", "Turing", None)).unwrap();
        students.insert(&draft("Adele", "Hopper", None)).unwrap();

        let names: Vec<String> = students
            .list(&StudentQuery::default())
            .unwrap()
            .iter()
            .map(Student::full_name)
            .collect();
        assert_eq!(names, ["Adele Hopper", "Grace Hopper", "Alan Turing"]);
    }

    #[test]
    fn test_list_search_and_filters() {
        let store = StudentStore::open_in_memory().unwrap();
        let students = store.students();
        students
            .insert(&StudentDraft {
                school: Some("TSP".into()),
                ..draft("Grace", "Hopper", Some("grace@navy.mil"))
            })
            .unwrap();
        students
            .insert(&StudentDraft { school: Some("IMT".into()), ..draft("Alan", "Turing", None) })
            .unwrap();

        let q = StudentQuery { search: Some("navy".into()), ..Default::default() };
        assert_eq!(students.list(&q).unwrap().len(), 1);

        let q = StudentQuery { school: Some("IMT".into()), ..Default::default() };
        assert_eq!(students.list(&q).unwrap()[0].last_name, "Turing");

        let q = StudentQuery { search: Some("%".into()), ..Default::default() };
        assert!(students.list(&q).unwrap().is_empty(), "wildcards match literally");

        assert_eq!(students.schools().unwrap(), ["IMT", "TSP"]);
    }

    #[test]
    fn test_encoding_roundtrip_through_store() {
        let store = StudentStore::open_in_memory().unwrap();
        let students = store.students();
        let s = students.insert(&draft("Ada", "Lovelace", None)).unwrap();
        students.set_encoding(s.id, &encoding(0.125)).unwrap();

        let fetched = students.get(s.id).unwrap().unwrap();
        assert!(fetched.has_encoding());
        assert_eq!(fetched.encoding().unwrap(), Some(encoding(0.125)));
    }

    #[test]
    fn test_set_photo_clears_encoding() {
        let store = StudentStore::open_in_memory().unwrap();
        let students = store.students();
        let s = students.insert(&draft("Ada", "Lovelace", None)).unwrap();
        students.set_encoding(s.id, &encoding(0.5)).unwrap();
        students.set_photo(s.id, Some("students_photos/new.jpg")).unwrap();

        let fetched = students.get(s.id).unwrap().unwrap();
        assert_eq!(fetched.photo.as_deref(), Some("students_photos/new.jpg"));
        assert!(!fetched.has_encoding());
    }

    #[test]
    fn test_encoding_for_replaced_photo_is_dropped() {
        let store = StudentStore::open_in_memory().unwrap();
        let students = store.students();
        let s = students.insert(&draft("Ada", "Lovelace", None)).unwrap();
        students.set_photo(s.id, Some("students_photos/old.jpg")).unwrap();
        students.set_photo(s.id, Some("students_photos/new.jpg")).unwrap();

        let stored = students
            .set_encoding_for_photo(s.id, "students_photos/old.jpg", &encoding(0.5))
            .unwrap();
        assert!(!stored);
        assert!(!students.get(s.id).unwrap().unwrap().has_encoding());

        let stored = students
            .set_encoding_for_photo(s.id, "students_photos/new.jpg", &encoding(0.5))
            .unwrap();
        assert!(stored);
        assert!(students.get(s.id).unwrap().unwrap().has_encoding());

        let err = students.set_encoding_for_photo(99, "x.jpg", &encoding(0.5)).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(99)));
    }

    #[test]
    fn test_gallery_skips_missing_and_corrupt_encodings() {
        let store = StudentStore::open_in_memory().unwrap();
        let students = store.students();
        let a = students.insert(&draft("A", "One", None)).unwrap();
        let b = students.insert(&draft("B", "Two", None)).unwrap();
        let _c = students.insert(&draft("C", "Three", None)).unwrap();
        students.set_encoding(a.id, &encoding(0.1)).unwrap();
        store
            .conn
            .execute("UPDATE students SET face_encoding = '[1.0, 2.0]' WHERE id = ?1", [b.id])
            .unwrap();

        let gallery = students.gallery().unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery[0].0, a.id);

        let stats = students.stats().unwrap();
        assert_eq!(stats, StoreStats { students: 3, encoded: 1 });
    }

    #[test]
    fn test_delete_returns_removed_student() {
        let store = StudentStore::open_in_memory().unwrap();
        let students = store.students();
        let s = students.insert(&draft("Ada", "Lovelace", None)).unwrap();
        assert_eq!(students.delete(s.id).unwrap().map(|d| d.id), Some(s.id));
        assert!(students.delete(s.id).unwrap().is_none());
    }

    #[test]
    fn test_get_many_keeps_order_and_skips_unknown() {
        let store = StudentStore::open_in_memory().unwrap();
        let students = store.students();
        let a = students.insert(&draft("A", "One", None)).unwrap();
        let b = students.insert(&draft("B", "Two", None)).unwrap();
        let ids: Vec<StudentId> = students
            .get_many(&[b.id, 999, a.id])
            .unwrap()
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, [b.id, a.id]);
    }

    #[tokio::test]
    async fn test_async_store_maps_errors_back() {
        let store = AsyncStore::open_in_memory().await.unwrap();
        let created = store
            .run(|s| s.insert(&draft("Ada", "Lovelace", Some("ada@x.org"))))
            .await
            .unwrap();
        assert_eq!(created.first_name, "Ada");

        let err = store
            .run(|s| s.insert(&draft("Ada", "Lovelace", Some("ada@x.org"))))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate));

        let err = store.run(|s| s.update(77, &draft("X", "Y", None))).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(77)));
    }
}
