//! Enrollment and recognition over one explicit context.
//!
//! [`Pipeline`] owns the cipher, store handle, matcher, liveness validator
//! and attendance recorder. The embedder is borrowed per call so that the
//! ONNX sessions can live on a dedicated thread.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::aggregate::aggregate;
use crate::attendance::{AttendanceRecorder, RecordOutcome};
use crate::cipher::{CipherError, EmbeddingCipher, EncryptedEmbedding};
use crate::extractor::{ExtractError, FaceEmbedder};
use crate::frame::{Frame, FrameError};
use crate::liveness::{LivenessReport, LivenessValidator};
use crate::matcher::{Candidate, EuclideanMatcher, MatchOutcome, Matcher};
use crate::store::{IdentityStore, StoreError};
use crate::types::{Role, User, UserId};

pub const MIN_ENROLL_FRAMES: usize = 2;
pub const MAX_ENROLL_FRAMES: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollMode {
    /// Fails if the email already has an enrolled embedding.
    #[default]
    FirstTime,
    /// Replaces name and embedding, inserting the user if the email is new.
    Reenroll,
}

#[derive(Debug, Clone)]
pub struct EnrollRequest {
    pub name: String,
    pub email: String,
    pub images: Vec<Vec<u8>>,
    pub mode: EnrollMode,
}

impl EnrollRequest {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("name is empty".into()));
        }
        if self.email.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("email is empty".into()));
        }
        let n = self.images.len();
        if !(MIN_ENROLL_FRAMES..=MAX_ENROLL_FRAMES).contains(&n) {
            return Err(PipelineError::InvalidRequest(format!(
                "enrollment needs {MIN_ENROLL_FRAMES}-{MAX_ENROLL_FRAMES} images, got {n}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RecognizeRequest {
    pub image: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{undecodable} of {total} images could not be decoded: {source}")]
    DecodeFailure {
        undecodable: usize,
        total: usize,
        #[source]
        source: FrameError,
    },
    #[error("liveness check failed (mean difference {mean_difference:?})")]
    LivenessCheckFailed { mean_difference: Option<f64> },
    #[error("no face detected")]
    NoFaceDetected,
    #[error("already enrolled: {email}")]
    AlreadyEnrolled { email: String },
    #[error("extraction: {0}")]
    Extraction(ExtractError),
    #[error("cipher: {0}")]
    Cipher(#[from] CipherError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl From<ExtractError> for PipelineError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::NoFaceDetected => PipelineError::NoFaceDetected,
            other => PipelineError::Extraction(other),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Enrollment {
    pub user_id: UserId,
    /// Frames whose embeddings went into the aggregate.
    pub frames_used: usize,
    /// Undecodable frames plus frames without a face.
    pub frames_dropped: usize,
    pub liveness: LivenessReport,
    /// `true` when an existing user was updated rather than inserted.
    pub updated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    DecryptionFailure,
    DimensionMismatch { expected: usize, actual: usize },
}

/// An enrolled user excluded from matching because their stored data is
/// unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SkippedCandidate {
    pub user_id: UserId,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RecognitionOutcome {
    Recognized {
        user_id: UserId,
        distance: f64,
        attendance: RecordOutcome,
    },
    NotRecognized { closest: Option<f64> },
}

#[derive(Debug, Clone, Serialize)]
pub struct Recognition {
    pub outcome: RecognitionOutcome,
    /// Candidates actually compared.
    pub candidates: usize,
    pub skipped: Vec<SkippedCandidate>,
}

pub struct Pipeline<S, M = EuclideanMatcher> {
    cipher: EmbeddingCipher,
    store: S,
    matcher: M,
    liveness: LivenessValidator,
    recorder: AttendanceRecorder,
}

impl<S: IdentityStore> Pipeline<S> {
    pub fn new(cipher: EmbeddingCipher, store: S) -> Self {
        Self {
            cipher,
            store,
            matcher: EuclideanMatcher::default(),
            liveness: LivenessValidator::default(),
            recorder: AttendanceRecorder::default(),
        }
    }
}

impl<S: IdentityStore, M: Matcher> Pipeline<S, M> {
    pub fn with_matcher<M2: Matcher>(self, matcher: M2) -> Pipeline<S, M2> {
        Pipeline {
            cipher: self.cipher,
            store: self.store,
            matcher,
            liveness: self.liveness,
            recorder: self.recorder,
        }
    }

    pub fn with_liveness(mut self, liveness: LivenessValidator) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn with_recorder(mut self, recorder: AttendanceRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cipher(&self) -> &EmbeddingCipher {
        &self.cipher
    }

    pub fn liveness(&self) -> &LivenessValidator {
        &self.liveness
    }

    pub fn enroll<E: FaceEmbedder + ?Sized>(
        &self,
        embedder: &mut E,
        request: &EnrollRequest,
    ) -> Result<Enrollment, PipelineError> {
        request.validate()?;
        let name = request.name.trim();
        let email = request.email.trim();

        let frames = decode_tolerant(&request.images)?;
        let undecodable = request.images.len() - frames.len();

        let liveness = self.liveness.check(&frames[0], &frames[1]);
        if !liveness.is_live {
            tracing::info!(
                email,
                mean_difference = ?liveness.mean_difference,
                threshold = liveness.threshold,
                "enrollment rejected by liveness check"
            );
            return Err(PipelineError::LivenessCheckFailed {
                mean_difference: liveness.mean_difference,
            });
        }

        let mut embeddings = Vec::with_capacity(frames.len());
        let mut faceless = 0;
        for (i, frame) in frames.iter().enumerate() {
            match embedder.extract(frame) {
                Ok(embedding) => embeddings.push(embedding),
                Err(ExtractError::NoFaceDetected) => {
                    tracing::debug!(frame = i, "no face in enrollment frame, dropping");
                    faceless += 1;
                }
                Err(e) => return Err(PipelineError::Extraction(e)),
            }
        }

        let aggregated = aggregate(&embeddings).ok_or(PipelineError::NoFaceDetected)?;
        let encrypted = self.cipher.encrypt(&aggregated)?;

        let (user_id, updated) = self.persist(name, email, &encrypted, request.mode)?;

        tracing::info!(
            user_id = %user_id,
            frames_used = embeddings.len(),
            frames_dropped = undecodable + faceless,
            updated,
            "enrolled"
        );

        Ok(Enrollment {
            user_id,
            frames_used: embeddings.len(),
            frames_dropped: undecodable + faceless,
            liveness,
            updated,
        })
    }

    fn persist(
        &self,
        name: &str,
        email: &str,
        encrypted: &EncryptedEmbedding,
        mode: EnrollMode,
    ) -> Result<(UserId, bool), PipelineError> {
        let already_enrolled = || PipelineError::AlreadyEnrolled {
            email: email.to_string(),
        };

        if let Some(existing) = self.store.find_user_by_email(email)? {
            match mode {
                EnrollMode::FirstTime => {
                    // Another enrollment may claim the row between the lookup and here.
                    if existing.is_enrolled()
                        || !self.store.claim_user_embedding(existing.id, name, encrypted)?
                    {
                        return Err(already_enrolled());
                    }
                }
                EnrollMode::Reenroll => {
                    self.store.update_user_embedding(existing.id, name, encrypted)?;
                }
            }
            return Ok((existing.id, true));
        }

        let user = User {
            id: UserId::new(),
            name: name.to_string(),
            email: email.to_string(),
            role: Role::Employee,
            embedding: Some(encrypted.clone()),
            created_at: Utc::now(),
        };
        match self.store.insert_user(&user) {
            Ok(()) => Ok((user.id, false)),
            Err(StoreError::DuplicateEmail(_)) => match mode {
                EnrollMode::FirstTime => Err(already_enrolled()),
                EnrollMode::Reenroll => {
                    // Lost an insert race; the winner's row is ours to overwrite.
                    let existing = self
                        .store
                        .find_user_by_email(email)?
                        .ok_or_else(already_enrolled)?;
                    self.store.update_user_embedding(existing.id, name, encrypted)?;
                    Ok((existing.id, true))
                }
            },
            Err(e) => Err(e.into()),
        }
    }

    pub fn recognize<E: FaceEmbedder + ?Sized>(
        &self,
        embedder: &mut E,
        request: &RecognizeRequest,
    ) -> Result<Recognition, PipelineError> {
        let frame = Frame::decode(&request.image).map_err(|source| PipelineError::DecodeFailure {
            undecodable: 1,
            total: 1,
            source,
        })?;
        let probe = embedder.extract(&frame)?;

        let stored = self.store.list_users_with_embeddings()?;
        let mut candidates = Vec::with_capacity(stored.len());
        let mut skipped = Vec::new();
        for entry in stored {
            match self.cipher.decrypt(&entry.embedding) {
                Ok(embedding) if embedding.dim() == probe.dim() => candidates.push(Candidate {
                    user_id: entry.user_id,
                    embedding,
                }),
                Ok(embedding) => {
                    tracing::warn!(
                        user_id = %entry.user_id,
                        expected = probe.dim(),
                        actual = embedding.dim(),
                        "stored embedding has wrong dimension, skipping"
                    );
                    skipped.push(SkippedCandidate {
                        user_id: entry.user_id,
                        reason: SkipReason::DimensionMismatch {
                            expected: probe.dim(),
                            actual: embedding.dim(),
                        },
                    });
                }
                Err(e) => {
                    tracing::warn!(user_id = %entry.user_id, error = %e, "stored embedding failed to decrypt, skipping");
                    skipped.push(SkippedCandidate {
                        user_id: entry.user_id,
                        reason: SkipReason::DecryptionFailure,
                    });
                }
            }
        }

        let outcome = match self.matcher.find_match(&probe, &candidates) {
            MatchOutcome::Matched { user_id, distance } => {
                tracing::info!(user_id = %user_id, distance, "recognized");
                let attendance = self.recorder.record(&self.store, user_id, request.captured_at)?;
                RecognitionOutcome::Recognized {
                    user_id,
                    distance,
                    attendance,
                }
            }
            MatchOutcome::NoMatch { closest } => {
                tracing::info!(
                    candidates = candidates.len(),
                    closest = ?closest,
                    "no match"
                );
                RecognitionOutcome::NotRecognized { closest }
            }
        };

        Ok(Recognition {
            outcome,
            candidates: candidates.len(),
            skipped,
        })
    }
}

/// Decode all payloads, dropping failures while they are a strict minority
/// and at least [`MIN_ENROLL_FRAMES`] frames survive.
fn decode_tolerant(images: &[Vec<u8>]) -> Result<Vec<Frame>, PipelineError> {
    let total = images.len();
    let mut frames = Vec::with_capacity(total);
    let mut first_error = None;
    let mut undecodable = 0;

    for (i, bytes) in images.iter().enumerate() {
        match Frame::decode(bytes) {
            Ok(frame) => frames.push(frame),
            Err(e) => {
                tracing::warn!(image = i, error = %e, "undecodable enrollment image");
                undecodable += 1;
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(source) if undecodable * 2 >= total || frames.len() < MIN_ENROLL_FRAMES => {
            Err(PipelineError::DecodeFailure {
                undecodable,
                total,
                source,
            })
        }
        _ => Ok(frames),
    }
}
