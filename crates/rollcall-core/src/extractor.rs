//! Frame → embedding boundary.
//!
//! The pipeline only sees [`FaceEmbedder`]; the ONNX implementation chains
//! SCRFD detection with ArcFace recognition on the most confident face.

use std::path::Path;

use thiserror::Error;

use crate::detector::{DetectorError, FaceDetector};
use crate::frame::Frame;
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Embedding;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ExtractError {
    /// No face in the frame. Enrollment drops such frames; recognition fails.
    #[error("no face detected")]
    NoFaceDetected,
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Produces a fixed-dimension embedding from the dominant face of a frame.
pub trait FaceEmbedder {
    fn extract(&mut self, frame: &Frame) -> Result<Embedding, ExtractError>;
}

impl<E: FaceEmbedder + ?Sized> FaceEmbedder for Box<E> {
    fn extract(&mut self, frame: &Frame) -> Result<Embedding, ExtractError> {
        (**self).extract(frame)
    }
}

pub struct OnnxEmbedder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxEmbedder {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, ExtractError> {
        let detector = FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn extract(&mut self, frame: &Frame) -> Result<Embedding, ExtractError> {
        let faces = self.detector.detect(frame)?;
        let face = faces.first().ok_or(ExtractError::NoFaceDetected)?;
        if faces.len() > 1 {
            tracing::debug!(
                faces = faces.len(),
                confidence = face.confidence,
                "multiple faces, using the most confident"
            );
        }
        Ok(self.recognizer.embed(frame, face)?)
    }
}
