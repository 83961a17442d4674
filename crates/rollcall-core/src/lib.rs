//! rollcall-core — Face-based attendance engine.
//!
//! Two-frame motion liveness, SCRFD detection and ArcFace embeddings via
//! ONNX Runtime, AES-256-GCM encryption of stored embeddings, threshold
//! matching and append-only attendance records.

pub mod aggregate;
pub mod alignment;
pub mod attendance;
pub mod cipher;
pub mod detector;
pub mod extractor;
pub mod frame;
pub mod liveness;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod store;
pub mod types;

pub use attendance::{AttendanceRecorder, RecordOutcome};
pub use cipher::{CipherError, CipherKey, EmbeddingCipher, EncryptedEmbedding, KeyError};
pub use extractor::{ExtractError, FaceEmbedder, OnnxEmbedder};
pub use frame::{Frame, FrameError};
pub use liveness::{LivenessReport, LivenessValidator};
pub use matcher::{EuclideanMatcher, MatchPolicy, Matcher};
pub use pipeline::{
    EnrollMode, EnrollRequest, Enrollment, Pipeline, PipelineError, Recognition,
    RecognitionOutcome, RecognizeRequest,
};
pub use store::{AttendanceFilter, IdentityStore, MemoryStore, StoreError};
pub use types::{AttendanceId, AttendanceRecord, AttendanceStatus, Embedding, Role, User, UserId};
