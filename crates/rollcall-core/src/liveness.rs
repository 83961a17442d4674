//! Motion-based liveness check over two consecutive frames.
//!
//! A photograph or a screen replay held still between two captures yields a
//! near-zero luminance difference; a live subject shows micro-motion. This is
//! a weak anti-spoofing signal: it does not stop video replays or a subject
//! waving a printout.

use serde::Serialize;

use crate::frame::Frame;

/// Mean absolute luminance difference (0–255 scale) a pair of frames must
/// exceed to be considered live.
pub const DEFAULT_MOTION_THRESHOLD: f64 = 5.0;

/// Outcome of a two-frame liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LivenessReport {
    pub is_live: bool,
    /// Mean absolute luminance difference, `None` when the frames cannot be
    /// compared (different dimensions or empty).
    pub mean_difference: Option<f64>,
    pub threshold: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct LivenessValidator {
    threshold: f64,
}

impl Default for LivenessValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MOTION_THRESHOLD)
    }
}

impl LivenessValidator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn check(&self, first: &Frame, second: &Frame) -> LivenessReport {
        let mean_difference = mean_luminance_difference(first, second);
        if mean_difference.is_none() {
            tracing::warn!(
                first = ?(first.width(), first.height()),
                second = ?(second.width(), second.height()),
                "liveness: frames are not comparable"
            );
        }
        LivenessReport {
            is_live: mean_difference.is_some_and(|d| d > self.threshold),
            mean_difference,
            threshold: self.threshold,
        }
    }

    /// `true` iff the mean absolute luminance difference exceeds the threshold.
    pub fn validate(&self, first: &Frame, second: &Frame) -> bool {
        self.check(first, second).is_live
    }
}

/// Per-pixel mean of `|Y(first) - Y(second)|`.
pub fn mean_luminance_difference(first: &Frame, second: &Frame) -> Option<f64> {
    if first.width() != second.width() || first.height() != second.height() {
        return None;
    }
    let a = first.luminance();
    let b = second.luminance();
    if a.is_empty() {
        return None;
    }
    let total: u64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| x.abs_diff(y) as u64)
        .sum();
    Some(total as f64 / a.len() as f64)
}
