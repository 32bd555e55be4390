use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use identint_core::{
    EuclideanMatcher, FaceBackend, Matcher, OnnxBackend, DEFAULT_MATCH_THRESHOLD,
};
use image::ImageFormat;
use identint_store::{Student, StudentDraft, StudentId, StudentQuery, StudentStore};
use std::path::{Path, PathBuf};

/// Media subdirectory shared with the web server.
const STUDENT_PHOTO_SUBDIR: &str = "students_photos";

#[derive(Parser)]
#[command(name = "identint", version, about = "IDENTINT student face recognition CLI")]
struct Cli {
    #[command(flatten)]
    paths: Paths,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Paths {
    /// SQLite database file
    #[arg(long, env = "IDENTINT_DB_PATH", global = true)]
    db: Option<PathBuf>,
    /// Media directory holding student photos
    #[arg(long, env = "IDENTINT_MEDIA_DIR", global = true)]
    media_dir: Option<PathBuf>,
    /// Directory containing the ONNX models
    #[arg(long, env = "IDENTINT_MODEL_DIR", global = true)]
    model_dir: Option<PathBuf>,
}

impl Paths {
    fn db(&self) -> PathBuf {
        self.db
            .clone()
            .unwrap_or_else(|| identint_core::default_data_dir().join("students.db"))
    }

    fn media_dir(&self) -> PathBuf {
        self.media_dir
            .clone()
            .unwrap_or_else(|| identint_core::default_data_dir().join("media"))
    }

    fn model_dir(&self) -> PathBuf {
        self.model_dir
            .clone()
            .unwrap_or_else(identint_core::default_model_dir)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new student
    Add {
        first_name: String,
        last_name: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        school: Option<String>,
        #[arg(long)]
        year: Option<String>,
        #[arg(long)]
        promotion: Option<String>,
        /// External photo URL
        #[arg(long)]
        photo_url: Option<String>,
        /// Photo file to copy into the media directory (JPG or PNG)
        #[arg(long)]
        photo: Option<PathBuf>,
    },
    /// List students
    List {
        /// Substring of first name, last name or email
        #[arg(short, long)]
        search: Option<String>,
        #[arg(long)]
        school: Option<String>,
        #[arg(long)]
        year: Option<String>,
    },
    /// Remove a student and their stored photo
    Remove { id: StudentId },
    /// Compute face encodings from student photos
    Encode {
        /// Students to encode
        ids: Vec<StudentId>,
        /// Encode every student that has a photo
        #[arg(long, conflicts_with = "ids")]
        all: bool,
    },
    /// Find the students matching the face in a photo
    Match {
        photo: PathBuf,
        /// Maximum Euclidean distance for a match. SFace encodings are unit
        /// length, so 0.6 means cosine >= 0.82; OpenCV suggests up to 1.128
        #[arg(long, default_value_t = DEFAULT_MATCH_THRESHOLD)]
        threshold: f32,
    },
    /// Check that a photo shows exactly one face
    Quality { photo: PathBuf },
    /// Show record counts
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let paths = &cli.paths;

    match cli.command {
        Commands::Add {
            first_name,
            last_name,
            email,
            school,
            year,
            promotion,
            photo_url,
            photo,
        } => {
            let draft = StudentDraft {
                first_name,
                last_name,
                email,
                school,
                year,
                promotion,
                photo_url,
            }
            .normalized();
            let store = open_store(paths)?;
            let student = add_student(&store, &paths.media_dir(), &draft, photo.as_deref())?;
            println!("Added student {}: {}", student.id, student);
        }
        Commands::List { search, school, year } => {
            let store = open_store(paths)?;
            let students = store.students().list(&StudentQuery { search, school, year })?;
            if students.is_empty() {
                println!("No students found");
            }
            for s in &students {
                println!("{}", list_line(s));
            }
        }
        Commands::Remove { id } => {
            let store = open_store(paths)?;
            let Some(removed) = store.students().delete(id)? else {
                bail!("student {id} not found");
            };
            if let Some(photo) = &removed.photo {
                remove_photo(&paths.media_dir(), photo);
            }
            println!("Removed student {}: {}", removed.id, removed);
        }
        Commands::Encode { ids, all } => {
            let store = open_store(paths)?;
            let students: Vec<Student> = if all {
                store
                    .students()
                    .list(&StudentQuery::default())?
                    .into_iter()
                    .filter(|s| s.photo.is_some())
                    .collect()
            } else if ids.is_empty() {
                bail!("give student ids or --all");
            } else {
                store.students().get_many(&ids)?
            };

            let mut backend = load_backend(paths)?;
            let summary = encode_students(&store, &mut backend, &paths.media_dir(), &students)?;
            for (student, reason) in &summary.failures {
                eprintln!("{student}: {reason}");
            }
            println!("{} student(s) encoded successfully.", summary.encoded);
        }
        Commands::Match { photo, threshold } => {
            let mut backend = load_backend(paths)?;
            let inspection = identint_core::inspect_photo(&mut backend, &photo)
                .with_context(|| format!("cannot analyze {}", photo.display()))?;
            println!("{}", inspection.report.message());
            let Some(target) = inspection.encoding else {
                return Ok(());
            };

            let store = open_store(paths)?;
            let students = store.students();
            let gallery = students.gallery()?;
            let matches = EuclideanMatcher.rank(&target, &gallery, threshold);
            if matches.is_empty() {
                println!("No matching student found");
            }
            for m in matches {
                if let Some(student) = students.get(m.key)? {
                    println!(
                        "{:>6.1}%  d={:.3}  [{}] {}",
                        m.similarity, m.distance, student.id, student
                    );
                }
            }
        }
        Commands::Quality { photo } => {
            let mut backend = load_backend(paths)?;
            let report = identint_core::analyze_photo(&mut backend, &photo)
                .with_context(|| format!("cannot analyze {}", photo.display()))?;
            println!("{}", report.message());
            if !report.is_good_quality() {
                std::process::exit(1);
            }
        }
        Commands::Status => {
            let store = open_store(paths)?;
            let stats = store.students().stats()?;
            println!("database: {}", paths.db().display());
            println!("students: {}", stats.students);
            println!("encoded:  {}", stats.encoded);
        }
    }

    Ok(())
}

fn open_store(paths: &Paths) -> Result<StudentStore> {
    let db = paths.db();
    StudentStore::open(&db).with_context(|| format!("cannot open database {}", db.display()))
}

fn load_backend(paths: &Paths) -> Result<OnnxBackend> {
    let dir = paths.model_dir();
    OnnxBackend::load(&dir).with_context(|| format!("cannot load models from {}", dir.display()))
}

fn list_line(s: &Student) -> String {
    format!(
        "{:>5}  {:<30} {:<12} {:<8} {:<30} {}",
        s.id,
        s.full_name(),
        s.school.as_deref().unwrap_or("-"),
        s.year.as_deref().unwrap_or("-"),
        s.email.as_deref().unwrap_or("-"),
        if s.has_encoding() { "encoded" } else { "-" },
    )
}

/// Register a student. The photo is checked before the insert so a bad file
/// never leaves a record behind; a failed copy removes the new record again.
fn add_student(
    store: &StudentStore,
    media_dir: &Path,
    draft: &StudentDraft,
    photo: Option<&Path>,
) -> Result<Student> {
    let photo = photo.map(|p| check_photo(p).map(|ext| (p, ext))).transpose()?;
    let students = store.students();
    let mut student = students.insert(draft)?;

    if let Some((source, ext)) = photo {
        let relative = match copy_student_photo(media_dir, source, ext) {
            Ok(relative) => relative,
            Err(err) => {
                students.delete(student.id)?;
                return Err(err);
            }
        };
        students.set_photo(student.id, Some(&relative))?;
        student.photo = Some(relative);
    }
    Ok(student)
}

#[derive(Debug, Default)]
struct EncodeSummary {
    encoded: usize,
    /// Student display name and the reason it was skipped.
    failures: Vec<(String, String)>,
}

/// Encode each student's stored photo. Any per-photo failure is recorded
/// and the batch moves on; only database errors abort it.
fn encode_students<B: FaceBackend + ?Sized>(
    store: &StudentStore,
    backend: &mut B,
    media_dir: &Path,
    students: &[Student],
) -> Result<EncodeSummary> {
    let mut summary = EncodeSummary::default();
    for student in students {
        let Some(photo) = &student.photo else {
            summary.failures.push((student.to_string(), "no photo".into()));
            continue;
        };
        let result = match identint_core::encode_photo(backend, &media_dir.join(photo)) {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(student_id = student.id, error = %err, "student not encoded");
                summary.failures.push((student.to_string(), err.to_string()));
                continue;
            }
        };
        if store.students().set_encoding_for_photo(student.id, photo, &result.encoding)? {
            tracing::info!(student_id = student.id, "encoded");
            summary.encoded += 1;
        } else {
            summary
                .failures
                .push((student.to_string(), "photo changed during encoding".into()));
        }
    }
    Ok(summary)
}

/// Lower-case extension of a JPG or PNG photo.
fn photo_extension(path: &Path) -> Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("jpg" | "jpeg") => Ok("jpg"),
        Some("png") => Ok("png"),
        _ => bail!("unsupported photo format: {} (use JPG or PNG)", path.display()),
    }
}

/// Check a photo by name and by content; returns the extension to store it under.
fn check_photo(path: &Path) -> Result<&'static str> {
    photo_extension(path)?;
    let bytes = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    match image::guess_format(&bytes) {
        Ok(ImageFormat::Jpeg) => Ok("jpg"),
        Ok(ImageFormat::Png) => Ok("png"),
        _ => bail!("{} is not a valid JPG or PNG image", path.display()),
    }
}

/// Copy a checked photo into `students_photos/`; returns the media-relative path.
fn copy_student_photo(media_dir: &Path, source: &Path, ext: &str) -> Result<String> {
    let dir = media_dir.join(STUDENT_PHOTO_SUBDIR);
    std::fs::create_dir_all(&dir).with_context(|| format!("cannot create {}", dir.display()))?;

    let name = format!("{}.{ext}", uuid::Uuid::new_v4());
    std::fs::copy(source, dir.join(&name))
        .with_context(|| format!("cannot copy {}", source.display()))?;
    Ok(format!("{STUDENT_PHOTO_SUBDIR}/{name}"))
}

fn remove_photo(media_dir: &Path, relative: &str) {
    match std::fs::remove_file(media_dir.join(relative)) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = relative, error = %e, "cannot remove photo"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use identint_core::recognizer::RecognizerError;
    use identint_core::{BoundingBox, FaceEncoding, FaceError, RgbImage, ENCODING_DIM};

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_encode_all_conflicts_with_ids() {
        assert!(Cli::try_parse_from(["identint", "encode", "1", "--all"]).is_err());
        assert!(Cli::try_parse_from(["identint", "encode", "--all"]).is_ok());
    }

    #[test]
    fn test_match_threshold_default() {
        let cli = Cli::try_parse_from(["identint", "match", "me.jpg"]).unwrap();
        match cli.command {
            Commands::Match { threshold, .. } => assert_eq!(threshold, DEFAULT_MATCH_THRESHOLD),
            _ => panic!("expected match command"),
        }
    }

    #[test]
    fn test_photo_extension() {
        assert_eq!(photo_extension(Path::new("a/Me.JPEG")).unwrap(), "jpg");
        assert_eq!(photo_extension(Path::new("me.png")).unwrap(), "png");
        assert!(photo_extension(Path::new("me.gif")).is_err());
        assert!(photo_extension(Path::new("me")).is_err());
    }

    fn write_png(dir: &Path, name: &str, red: u8) -> PathBuf {
        let path = dir.join(name);
        image::RgbImage::from_pixel(4, 4, image::Rgb([red, 0, 0]))
            .save_with_format(&path, ImageFormat::Png)
            .unwrap();
        path
    }

    fn draft(first: &str) -> StudentDraft {
        StudentDraft {
            first_name: first.into(),
            last_name: "Lovelace".into(),
            ..Default::default()
        }
    }

    /// One face per image; encoding fails when the top-left pixel has no red.
    struct RedBackend;

    impl FaceBackend for RedBackend {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<BoundingBox>, FaceError> {
            Ok(vec![BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 4.0,
                height: 4.0,
                confidence: 0.9,
                landmarks: None,
            }])
        }

        fn encode(
            &mut self,
            image: &RgbImage,
            _face: &BoundingBox,
        ) -> Result<FaceEncoding, FaceError> {
            if image.get_pixel(0, 0)[0] == 0 {
                return Err(RecognizerError::NoLandmarks.into());
            }
            let encoding = FaceEncoding::new(vec![0.5; ENCODING_DIM]);
            Ok(encoding.map_err(RecognizerError::from)?)
        }
    }

    #[test]
    fn test_add_rejects_bad_photo_before_insert() {
        let media = tempfile::tempdir().unwrap();
        let store = StudentStore::open_in_memory().unwrap();

        let fake = media.path().join("fake.png");
        std::fs::write(&fake, b"not an image").unwrap();
        let gif = write_png(media.path(), "real.gif", 1);

        for bad in [&fake, &gif] {
            let added = add_student(&store, media.path(), &draft("Ada"), Some(bad.as_path()));
            assert!(added.is_err(), "{} should be rejected", bad.display());
        }
        assert!(store.students().list(&StudentQuery::default()).unwrap().is_empty());
        assert!(!media.path().join(STUDENT_PHOTO_SUBDIR).exists());

        // A JPG-named file holding PNG data is stored under its real format.
        let disguised = write_png(media.path(), "me.jpg", 1);
        let student =
            add_student(&store, media.path(), &draft("Ada"), Some(disguised.as_path())).unwrap();
        let photo = student.photo.unwrap();
        assert!(photo.starts_with("students_photos/") && photo.ends_with(".png"));
        let stored = store.students().get(student.id).unwrap().unwrap();
        assert_eq!(stored.photo.as_deref(), Some(photo.as_str()));
    }

    #[test]
    fn test_encode_continues_past_recognizer_errors() {
        let media = tempfile::tempdir().unwrap();
        let store = StudentStore::open_in_memory().unwrap();
        let failing = write_png(media.path(), "failing.png", 0);
        let good = write_png(media.path(), "good.png", 1);

        let a = add_student(&store, media.path(), &draft("Ada"), Some(failing.as_path())).unwrap();
        let b = add_student(&store, media.path(), &draft("Alan"), Some(good.as_path())).unwrap();
        let c = add_student(&store, media.path(), &draft("Grace"), None).unwrap();

        let summary = encode_students(&store, &mut RedBackend, media.path(), &[a, b, c]).unwrap();
        assert_eq!(summary.encoded, 1);
        assert_eq!(summary.failures.len(), 2);
        assert!(summary.failures[0].1.contains("landmarks"));
        assert_eq!(summary.failures[1].1, "no photo");

        let encoded = store.students().stats().unwrap().encoded;
        assert_eq!(encoded, 1);
    }

    #[test]
    fn test_copy_and_remove_student_photo() {
        let media = tempfile::tempdir().unwrap();
        let source = media.path().join("source.png");
        std::fs::write(&source, b"png").unwrap();

        let relative = copy_student_photo(media.path(), &source, "png").unwrap();
        assert!(relative.starts_with("students_photos/") && relative.ends_with(".png"));
        assert_eq!(std::fs::read(media.path().join(&relative)).unwrap(), b"png");

        remove_photo(media.path(), &relative);
        assert!(!media.path().join(&relative).exists());
        remove_photo(media.path(), &relative);
    }
}
