//! Authenticated encryption of embeddings at rest.
//!
//! AES-256-GCM with a fresh 96-bit nonce per encryption. Stored layout is
//! `nonce (12) || ciphertext || tag (16)`; the plaintext is the little-endian
//! `f64` encoding from [`Embedding::to_bytes`].

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::Embedding;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("failed to read key file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write key file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("key file {path} holds {actual} bytes, expected {KEY_LEN}")]
    InvalidKeyLength { path: PathBuf, actual: usize },
}

#[derive(Error, Debug, PartialEq)]
pub enum CipherError {
    #[error("embedding encryption failed")]
    EncryptionFailure,
    #[error("embedding decryption failed: {reason}")]
    DecryptionFailure { reason: &'static str },
}

/// 256-bit symmetric key. Never printed.
#[derive(Clone)]
pub struct CipherKey([u8; KEY_LEN]);

impl CipherKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Short non-secret identifier: first 8 bytes of SHA-256(key), hex.
    pub fn fingerprint(&self) -> String {
        Sha256::digest(self.0)
            .iter()
            .take(8)
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Read the raw 32-byte key at `path`, creating it (mode 0600) when
    /// absent. If another process creates the file first, its key is used.
    pub fn load_or_generate(path: &Path) -> Result<Self, KeyError> {
        match fs::read(path) {
            Ok(bytes) => return Self::from_file_bytes(path, &bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(KeyError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        let write_err = |source| KeyError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        let key = Self::generate();
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        match options.open(path) {
            Ok(mut file) => {
                file.write_all(&key.0).map_err(write_err)?;
                file.sync_all().map_err(write_err)?;
                tracing::info!(
                    path = %path.display(),
                    fingerprint = %key.fingerprint(),
                    "generated new embedding key"
                );
                Ok(key)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                tracing::debug!(path = %path.display(), "key file created concurrently, re-reading");
                let bytes = fs::read(path).map_err(|source| KeyError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_file_bytes(path, &bytes)
            }
            Err(source) => Err(write_err(source)),
        }
    }

    fn from_file_bytes(path: &Path, bytes: &[u8]) -> Result<Self, KeyError> {
        let raw: [u8; KEY_LEN] = bytes.try_into().map_err(|_| KeyError::InvalidKeyLength {
            path: path.to_path_buf(),
            actual: bytes.len(),
        })?;
        Ok(Self(raw))
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CipherKey").field(&"<redacted>").finish()
    }
}

/// Opaque ciphertext of one embedding, as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEmbedding(Vec<u8>);

impl EncryptedEmbedding {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for EncryptedEmbedding {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

pub struct EmbeddingCipher {
    cipher: Aes256Gcm,
    fingerprint: String,
}

impl EmbeddingCipher {
    pub fn new(key: &CipherKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0)),
            fingerprint: key.fingerprint(),
        }
    }

    pub fn key_fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn encrypt(&self, embedding: &Embedding) -> Result<EncryptedEmbedding, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, embedding.to_bytes().as_slice())
            .map_err(|_| CipherError::EncryptionFailure)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(EncryptedEmbedding(out))
    }

    /// Fails on wrong key, any tampering, truncation, or a plaintext that is
    /// not a whole number of `f64` values.
    pub fn decrypt(&self, encrypted: &EncryptedEmbedding) -> Result<Embedding, CipherError> {
        let data = encrypted.as_bytes();
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::DecryptionFailure {
                reason: "ciphertext too short",
            });
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CipherError::DecryptionFailure {
                reason: "authentication failed",
            })?;

        Embedding::from_bytes(&plaintext).ok_or(CipherError::DecryptionFailure {
            reason: "malformed embedding payload",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Embedding {
        Embedding::new(vec![0.1, -0.25, 3.5e-9, f64::MAX, -0.0])
    }

    #[test]
    fn test_round_trip_is_bit_exact() {
        let cipher = EmbeddingCipher::new(&CipherKey::generate());
        let e = sample();
        let restored = cipher.decrypt(&cipher.encrypt(&e).unwrap()).unwrap();
        let bits = |e: &Embedding| e.values.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&e), bits(&restored));
    }

    #[test]
    fn test_layout_is_nonce_ciphertext_tag() {
        let cipher = EmbeddingCipher::new(&CipherKey::generate());
        let e = sample();
        let encrypted = cipher.encrypt(&e).unwrap();
        assert_eq!(encrypted.as_bytes().len(), NONCE_LEN + e.dim() * 8 + TAG_LEN);
    }

    #[test]
    fn test_nonces_are_fresh() {
        let cipher = EmbeddingCipher::new(&CipherKey::generate());
        let e = sample();
        let a = cipher.encrypt(&e).unwrap();
        let b = cipher.encrypt(&e).unwrap();
        assert_ne!(a.as_bytes()[..NONCE_LEN], b.as_bytes()[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_any_flipped_byte_fails() {
        let cipher = EmbeddingCipher::new(&CipherKey::generate());
        let encrypted = cipher.encrypt(&sample()).unwrap();
        for i in 0..encrypted.as_bytes().len() {
            let mut bytes = encrypted.as_bytes().to_vec();
            bytes[i] ^= 0x01;
            assert!(
                cipher.decrypt(&EncryptedEmbedding::from(bytes)).is_err(),
                "tampering at byte {i} went unnoticed"
            );
        }
    }

    #[test]
    fn test_foreign_key_fails() {
        let a = EmbeddingCipher::new(&CipherKey::generate());
        let b = EmbeddingCipher::new(&CipherKey::generate());
        let encrypted = a.encrypt(&sample()).unwrap();
        assert_eq!(
            b.decrypt(&encrypted),
            Err(CipherError::DecryptionFailure {
                reason: "authentication failed"
            })
        );
    }

    #[test]
    fn test_truncated_input_fails() {
        let cipher = EmbeddingCipher::new(&CipherKey::generate());
        let encrypted = cipher.encrypt(&sample()).unwrap();
        let short = EncryptedEmbedding::from(encrypted.as_bytes()[..NONCE_LEN + 4].to_vec());
        assert!(matches!(
            cipher.decrypt(&short),
            Err(CipherError::DecryptionFailure { .. })
        ));
        assert!(cipher.decrypt(&EncryptedEmbedding::from(Vec::new())).is_err());
    }

    #[test]
    fn test_authentic_but_malformed_plaintext_fails() {
        let key = CipherKey::from_bytes([3; KEY_LEN]);
        let nonce = [9u8; NONCE_LEN];
        let sealed = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&[3; KEY_LEN]))
            .encrypt(Nonce::from_slice(&nonce), [1u8; 12].as_slice())
            .unwrap();
        let mut payload = nonce.to_vec();
        payload.extend_from_slice(&sealed);

        assert_eq!(
            EmbeddingCipher::new(&key).decrypt(&EncryptedEmbedding::from(payload)),
            Err(CipherError::DecryptionFailure {
                reason: "malformed embedding payload"
            })
        );
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let key = CipherKey::from_bytes([0xAB; KEY_LEN]);
        let printed = format!("{key:?}");
        assert!(!printed.contains("171"));
        assert!(printed.contains("redacted"));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let key = CipherKey::from_bytes([7; KEY_LEN]);
        assert_eq!(key.fingerprint(), key.clone().fingerprint());
        assert_eq!(key.fingerprint().len(), 16);
        assert_ne!(key.fingerprint(), CipherKey::from_bytes([8; KEY_LEN]).fingerprint());
    }

    #[test]
    fn test_key_file_is_created_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("embedding.key");

        let first = CipherKey::load_or_generate(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap().len(), KEY_LEN);
        let second = CipherKey::load_or_generate(&path).unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());

        // Data encrypted under the first load decrypts under the second.
        let encrypted = EmbeddingCipher::new(&first).encrypt(&sample()).unwrap();
        assert!(EmbeddingCipher::new(&second).decrypt(&encrypted).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embedding.key");
        CipherKey::load_or_generate(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_wrong_length_key_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embedding.key");
        fs::write(&path, [0u8; 16]).unwrap();
        assert!(matches!(
            CipherKey::load_or_generate(&path),
            Err(KeyError::InvalidKeyLength { actual: 16, .. })
        ));
    }
}
