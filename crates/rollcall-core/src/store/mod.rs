//! Persistence seam for identities and attendance.
//!
//! Implementations must be `Send + Sync` with interior locking and must
//! enforce email uniqueness themselves.

mod memory;

pub use memory::MemoryStore;

use std::sync::Arc;

use thiserror::Error;

use crate::cipher::EncryptedEmbedding;
use crate::types::{AttendanceRecord, User, UserId};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("email already registered: {0}")]
    DuplicateEmail(String),
    #[error("user not found: {0}")]
    UserNotFound(UserId),
    #[error("corrupt stored row: {0}")]
    Corrupt(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("store backend: {0}")]
    Backend(#[source] BoxError),
}

impl StoreError {
    pub fn backend(err: impl Into<BoxError>) -> Self {
        StoreError::Backend(err.into())
    }
}

/// An enrolled user's stored ciphertext.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEmbedding {
    pub user_id: UserId,
    pub embedding: EncryptedEmbedding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceFilter {
    All,
    ByUser(UserId),
}

pub trait IdentityStore: Send + Sync {
    fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    /// Fails with [`StoreError::DuplicateEmail`] when the email is taken.
    fn insert_user(&self, user: &User) -> Result<(), StoreError>;

    /// Replace the name and embedding of an existing user.
    fn update_user_embedding(
        &self,
        user_id: UserId,
        name: &str,
        embedding: &EncryptedEmbedding,
    ) -> Result<(), StoreError>;

    /// Set the name and embedding only if the user has no embedding yet, as
    /// one atomic step. Returns `false` when the user is already enrolled.
    fn claim_user_embedding(
        &self,
        user_id: UserId,
        name: &str,
        embedding: &EncryptedEmbedding,
    ) -> Result<bool, StoreError>;

    /// Users that have an embedding, in enrollment (insertion) order.
    fn list_users_with_embeddings(&self) -> Result<Vec<StoredEmbedding>, StoreError>;

    /// Every user, enrolled or not, in insertion order.
    fn list_users(&self) -> Result<Vec<User>, StoreError>;

    fn insert_attendance(&self, record: &AttendanceRecord) -> Result<(), StoreError>;

    /// Records in ascending timestamp order.
    fn list_attendance(&self, filter: AttendanceFilter) -> Result<Vec<AttendanceRecord>, StoreError>;
}

impl<S: IdentityStore + ?Sized> IdentityStore for Arc<S> {
    fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        (**self).find_user_by_email(email)
    }

    fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        (**self).insert_user(user)
    }

    fn update_user_embedding(
        &self,
        user_id: UserId,
        name: &str,
        embedding: &EncryptedEmbedding,
    ) -> Result<(), StoreError> {
        (**self).update_user_embedding(user_id, name, embedding)
    }

    fn claim_user_embedding(
        &self,
        user_id: UserId,
        name: &str,
        embedding: &EncryptedEmbedding,
    ) -> Result<bool, StoreError> {
        (**self).claim_user_embedding(user_id, name, embedding)
    }

    fn list_users_with_embeddings(&self) -> Result<Vec<StoredEmbedding>, StoreError> {
        (**self).list_users_with_embeddings()
    }

    fn list_users(&self) -> Result<Vec<User>, StoreError> {
        (**self).list_users()
    }

    fn insert_attendance(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        (**self).insert_attendance(record)
    }

    fn list_attendance(&self, filter: AttendanceFilter) -> Result<Vec<AttendanceRecord>, StoreError> {
        (**self).list_attendance(filter)
    }
}
