//! The pipeline running on an on-disk SQLite database.

use std::io::Cursor;
use std::sync::Arc;

use chrono::Utc;
use image::{ImageFormat, Rgb, RgbImage};

use rollcall_core::store::StoreError;
use rollcall_core::{
    AttendanceFilter, CipherKey, Embedding, EmbeddingCipher, EnrollMode, EnrollRequest,
    ExtractError, FaceEmbedder, Frame, IdentityStore, Pipeline, PipelineError, RecognitionOutcome,
    RecognizeRequest,
};
use rollcall_store::SqliteStore;

/// Embedding derived from the gray level of the frame; level 0 has no face.
struct GrayEmbedder;

impl FaceEmbedder for GrayEmbedder {
    fn extract(&mut self, frame: &Frame) -> Result<Embedding, ExtractError> {
        match frame.pixel(0, 0)[0] {
            0 => Err(ExtractError::NoFaceDetected),
            level => Ok(Embedding::new(vec![level as f64 / 255.0, 0.5])),
        }
    }
}

fn png(level: u8) -> Vec<u8> {
    let img = RgbImage::from_pixel(10, 10, Rgb([level, level, level]));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

fn enroll(email: &str, levels: [u8; 2]) -> EnrollRequest {
    EnrollRequest {
        name: "Linus".into(),
        email: email.into(),
        images: levels.iter().map(|&l| png(l)).collect(),
        mode: EnrollMode::FirstTime,
    }
}

#[test]
fn enrollment_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("data").join("rollcall.db");
    let key = CipherKey::generate();

    let user_id = {
        let pipeline = Pipeline::new(EmbeddingCipher::new(&key), SqliteStore::open(&db).unwrap());
        pipeline
            .enroll(&mut GrayEmbedder, &enroll("linus@example.com", [100, 160]))
            .unwrap()
            .user_id
    };

    let pipeline = Pipeline::new(EmbeddingCipher::new(&key), SqliteStore::open(&db).unwrap());
    let recognition = pipeline
        .recognize(
            &mut GrayEmbedder,
            &RecognizeRequest {
                image: png(130),
                captured_at: Utc::now(),
            },
        )
        .unwrap();
    assert!(matches!(
        recognition.outcome,
        RecognitionOutcome::Recognized { user_id: id, .. } if id == user_id
    ));
    let records = pipeline
        .store()
        .list_attendance(AttendanceFilter::ByUser(user_id))
        .unwrap();
    assert_eq!(records.len(), 1);
}

#[test]
fn duplicate_enrollment_hits_unique_constraint() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let pipeline = Pipeline::new(EmbeddingCipher::new(&CipherKey::generate()), Arc::clone(&store));

    pipeline
        .enroll(&mut GrayEmbedder, &enroll("linus@example.com", [100, 160]))
        .unwrap();
    let err = pipeline
        .enroll(&mut GrayEmbedder, &enroll("linus@example.com", [100, 160]))
        .unwrap_err();
    assert!(matches!(err, PipelineError::AlreadyEnrolled { .. }));

    // Direct insert of the same email is refused by the schema.
    let mut clone = store
        .find_user_by_email("linus@example.com")
        .unwrap()
        .unwrap();
    clone.id = rollcall_core::UserId::new();
    assert!(matches!(
        store.insert_user(&clone),
        Err(StoreError::DuplicateEmail(_))
    ));
}

#[test]
fn key_change_skips_every_candidate() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    Pipeline::new(EmbeddingCipher::new(&CipherKey::generate()), Arc::clone(&store))
        .enroll(&mut GrayEmbedder, &enroll("linus@example.com", [100, 160]))
        .unwrap();

    let rotated = Pipeline::new(EmbeddingCipher::new(&CipherKey::generate()), Arc::clone(&store));
    let recognition = rotated
        .recognize(
            &mut GrayEmbedder,
            &RecognizeRequest {
                image: png(130),
                captured_at: Utc::now(),
            },
        )
        .unwrap();
    assert_eq!(recognition.candidates, 0);
    assert_eq!(recognition.skipped.len(), 1);
    assert!(store.list_attendance(AttendanceFilter::All).unwrap().is_empty());
}
