use std::sync::{Mutex, MutexGuard};

use crate::cipher::EncryptedEmbedding;
use crate::store::{AttendanceFilter, IdentityStore, StoreError, StoredEmbedding};
use crate::types::{AttendanceRecord, User, UserId};

#[derive(Default)]
struct Tables {
    users: Vec<User>,
    attendance: Vec<AttendanceRecord>,
}

/// Process-local store. Users keep insertion order.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl IdentityStore for MemoryStore {
    fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self.lock()?.users.iter().find(|u| u.email == email).cloned())
    }

    fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        if tables.users.iter().any(|u| u.email == user.email) {
            return Err(StoreError::DuplicateEmail(user.email.clone()));
        }
        tables.users.push(user.clone());
        Ok(())
    }

    fn update_user_embedding(
        &self,
        user_id: UserId,
        name: &str,
        embedding: &EncryptedEmbedding,
    ) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        let user = tables
            .users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or(StoreError::UserNotFound(user_id))?;
        user.name = name.to_string();
        user.embedding = Some(embedding.clone());
        Ok(())
    }

    fn claim_user_embedding(
        &self,
        user_id: UserId,
        name: &str,
        embedding: &EncryptedEmbedding,
    ) -> Result<bool, StoreError> {
        let mut tables = self.lock()?;
        let user = tables
            .users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or(StoreError::UserNotFound(user_id))?;
        if user.embedding.is_some() {
            return Ok(false);
        }
        user.name = name.to_string();
        user.embedding = Some(embedding.clone());
        Ok(true)
    }

    fn list_users_with_embeddings(&self) -> Result<Vec<StoredEmbedding>, StoreError> {
        Ok(self
            .lock()?
            .users
            .iter()
            .filter_map(|u| {
                u.embedding.as_ref().map(|e| StoredEmbedding {
                    user_id: u.id,
                    embedding: e.clone(),
                })
            })
            .collect())
    }

    fn list_users(&self) -> Result<Vec<User>, StoreError> {
        Ok(self.lock()?.users.clone())
    }

    fn insert_attendance(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        if !tables.users.iter().any(|u| u.id == record.user_id) {
            return Err(StoreError::UserNotFound(record.user_id));
        }
        tables.attendance.push(record.clone());
        Ok(())
    }

    fn list_attendance(&self, filter: AttendanceFilter) -> Result<Vec<AttendanceRecord>, StoreError> {
        let tables = self.lock()?;
        let mut records: Vec<AttendanceRecord> = tables
            .attendance
            .iter()
            .filter(|r| match filter {
                AttendanceFilter::All => true,
                AttendanceFilter::ByUser(id) => r.user_id == id,
            })
            .cloned()
            .collect();
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }
}
