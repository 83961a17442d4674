use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::cipher::EncryptedEmbedding;

const F64_BYTES: usize = std::mem::size_of::<f64>();

/// Face embedding vector (512-dimensional for ArcFace w600k_r50).
///
/// Embeddings compared against each other must share a dimension. Comparing
/// mismatched dimensions is a programming error and panics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f64>,
}

impl Embedding {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance between two embeddings of the same dimension.
    pub fn euclidean_distance(&self, other: &Embedding) -> f64 {
        assert_eq!(
            self.dim(),
            other.dim(),
            "embedding dimension mismatch: {} vs {}",
            self.dim(),
            other.dim()
        );
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    /// Wire encoding: each value as little-endian IEEE-754 bytes, in order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.values.len() * F64_BYTES);
        for v in &self.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Inverse of [`to_bytes`](Self::to_bytes). Returns `None` when the input
    /// is empty or not a whole number of `f64` values.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() % F64_BYTES != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(F64_BYTES)
            .map(|chunk| {
                let mut raw = [0u8; F64_BYTES];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            })
            .collect();
        Some(Self { values })
    }
}

/// Stable, unique user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of one appended attendance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttendanceId(Uuid);

impl AttendanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AttendanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttendanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for AttendanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Error, Debug)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Employee,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Employee => "employee",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "employee" => Ok(Role::Employee),
            other => Err(ParseEnumError::new("role", other)),
        }
    }
}

/// Attendance status. `Present` is the only status the core writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(AttendanceStatus::Present),
            other => Err(ParseEnumError::new("attendance status", other)),
        }
    }
}

/// Identity record. `embedding` is absent until the user is enrolled.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub embedding: Option<EncryptedEmbedding>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_enrolled(&self) -> bool {
        self.embedding.is_some()
    }
}

/// Append-only attendance log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: AttendanceId,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub status: AttendanceStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert_eq!(a.euclidean_distance(&b), 5.0);
        assert_eq!(b.euclidean_distance(&a), 5.0);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    #[should_panic(expected = "embedding dimension mismatch")]
    fn test_euclidean_distance_dimension_mismatch_panics() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![0.0, 0.0, 0.0]);
        a.euclidean_distance(&b);
    }

    #[test]
    fn test_wire_encoding_is_little_endian() {
        let e = Embedding::new(vec![1.0]);
        assert_eq!(e.to_bytes(), vec![0, 0, 0, 0, 0, 0, 0xF0, 0x3F]);
    }

    #[test]
    fn test_wire_encoding_preserves_bits() {
        let values = vec![-0.0, f64::MIN_POSITIVE / 2.0, f64::MAX, 0.1, f64::NAN];
        let e = Embedding::new(values.clone());
        let decoded = Embedding::from_bytes(&e.to_bytes()).unwrap();
        let original: Vec<u64> = values.iter().map(|v| v.to_bits()).collect();
        let restored: Vec<u64> = decoded.values.iter().map(|v| v.to_bits()).collect();
        assert_eq!(original, restored);
    }

    #[test]
    fn test_from_bytes_rejects_partial_values() {
        assert!(Embedding::from_bytes(&[]).is_none());
        assert!(Embedding::from_bytes(&[0u8; 7]).is_none());
        assert!(Embedding::from_bytes(&[0u8; 17]).is_none());
        assert_eq!(Embedding::from_bytes(&[0u8; 16]).unwrap().dim(), 2);
    }

    #[test]
    fn test_role_and_status_parse() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("employee".parse::<Role>().unwrap(), Role::Employee);
        assert!("root".parse::<Role>().is_err());
        assert_eq!(
            "present".parse::<AttendanceStatus>().unwrap(),
            AttendanceStatus::Present
        );
        assert!("absent".parse::<AttendanceStatus>().is_err());
    }

    #[test]
    fn test_ids_round_trip_through_strings() {
        let id = UserId::new();
        assert_eq!(id.to_string().parse::<UserId>().unwrap(), id);
        let rec = AttendanceId::new();
        assert_eq!(rec.to_string().parse::<AttendanceId>().unwrap(), rec);
        assert!("not-a-uuid".parse::<UserId>().is_err());
    }
}
