//! rollcall-store — SQLite persistence for identities and attendance.
//!
//! One connection behind a mutex. Schema changes are applied through
//! `PRAGMA user_version`.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use rollcall_core::store::{AttendanceFilter, IdentityStore, StoreError, StoredEmbedding};
use rollcall_core::{AttendanceRecord, EncryptedEmbedding, User, UserId};

pub const SCHEMA_VERSION: u32 = 1;

const USER_COLUMNS: &str = "id, name, email, role, embedding, created_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and bring the schema up to
    /// date.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(StoreError::backend)?;
        }
        let conn = Connection::open(path).map_err(StoreError::backend)?;
        tracing::debug!(path = %path.display(), "opened sqlite store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(StoreError::backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(StoreError::backend)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Current `user_version` of the open database.
    pub fn schema_version(&self) -> Result<u32, StoreError> {
        let conn = self.lock()?;
        user_version(&conn)
    }
}

fn user_version(conn: &Connection) -> Result<u32, StoreError> {
    conn.query_row("SELECT user_version FROM pragma_user_version", [], |row| {
        row.get(0)
    })
    .map_err(StoreError::backend)
}

fn migrate(conn: &Connection) -> Result<u32, StoreError> {
    let version = user_version(conn)?;
    if version < 1 {
        conn.execute_batch(include_str!("sql/001 - initial.sql"))
            .map_err(StoreError::backend)?;
        conn.pragma_update(None, "user_version", 1)
            .map_err(StoreError::backend)?;
        tracing::info!(from = version, to = 1, "migrated sqlite schema");
    }
    if version > SCHEMA_VERSION {
        tracing::warn!(
            version,
            supported = SCHEMA_VERSION,
            "database schema is newer than this build"
        );
    }
    user_version(conn)
}

/// Fixed-width RFC 3339 so that text order is time order.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{raw}': {e}")))
}

fn parsed<T>(column: &str, raw: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("{column} '{raw}': {e}")))
}

fn constraint_violation(err: &rusqlite::Error, extended: i32) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation && e.extended_code == extended
    )
}

/// Column values as read, before validation.
struct UserRow {
    id: String,
    name: String,
    email: String,
    role: String,
    embedding: Option<Vec<u8>>,
    created_at: String,
}

impl UserRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            role: row.get(3)?,
            embedding: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_user(self) -> Result<User, StoreError> {
        Ok(User {
            id: parsed("user id", &self.id)?,
            name: self.name,
            email: self.email,
            role: parsed("role", &self.role)?,
            embedding: self.embedding.map(EncryptedEmbedding::from),
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

struct AttendanceRow {
    id: String,
    user_id: String,
    timestamp: String,
    status: String,
}

impl AttendanceRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            timestamp: row.get(2)?,
            status: row.get(3)?,
        })
    }

    fn into_record(self) -> Result<AttendanceRecord, StoreError> {
        Ok(AttendanceRecord {
            id: parsed("attendance id", &self.id)?,
            user_id: parsed("user id", &self.user_id)?,
            timestamp: parse_timestamp(&self.timestamp)?,
            status: parsed("status", &self.status)?,
        })
    }
}

impl IdentityStore for SqliteStore {
    fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                [email],
                UserRow::from_row,
            )
            .optional()
            .map_err(StoreError::backend)?;
        row.map(UserRow::into_user).transpose()
    }

    fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO users (id, name, email, role, embedding, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user.id.to_string(),
                user.name,
                user.email,
                user.role.as_str(),
                user.embedding.as_ref().map(|e| e.as_bytes()),
                format_timestamp(&user.created_at),
            ],
        )
        .map_err(|e| {
            if constraint_violation(&e, rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE) {
                StoreError::DuplicateEmail(user.email.clone())
            } else {
                StoreError::backend(e)
            }
        })?;
        Ok(())
    }

    fn update_user_embedding(
        &self,
        user_id: UserId,
        name: &str,
        embedding: &EncryptedEmbedding,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE users SET name = ?1, embedding = ?2 WHERE id = ?3",
                params![name, embedding.as_bytes(), user_id.to_string()],
            )
            .map_err(StoreError::backend)?;
        if updated == 0 {
            return Err(StoreError::UserNotFound(user_id));
        }
        Ok(())
    }

    fn claim_user_embedding(
        &self,
        user_id: UserId,
        name: &str,
        embedding: &EncryptedEmbedding,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let id = user_id.to_string();
        let claimed = conn
            .execute(
                "UPDATE users SET name = ?1, embedding = ?2 WHERE id = ?3 AND embedding IS NULL",
                params![name, embedding.as_bytes(), id],
            )
            .map_err(StoreError::backend)?;
        if claimed == 1 {
            return Ok(true);
        }
        let exists = conn
            .query_row("SELECT 1 FROM users WHERE id = ?1", [&id], |_| Ok(()))
            .optional()
            .map_err(StoreError::backend)?
            .is_some();
        if exists {
            Ok(false)
        } else {
            Err(StoreError::UserNotFound(user_id))
        }
    }

    fn list_users_with_embeddings(&self) -> Result<Vec<StoredEmbedding>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, embedding FROM users WHERE embedding IS NOT NULL ORDER BY rowid")
            .map_err(StoreError::backend)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))
            .map_err(StoreError::backend)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::backend)?;

        rows.into_iter()
            .map(|(id, blob)| -> Result<StoredEmbedding, StoreError> {
                Ok(StoredEmbedding {
                    user_id: parsed("user id", &id)?,
                    embedding: EncryptedEmbedding::from(blob),
                })
            })
            .collect()
    }

    fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY rowid"))
            .map_err(StoreError::backend)?;
        let rows = stmt
            .query_map([], UserRow::from_row)
            .map_err(StoreError::backend)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::backend)?;
        rows.into_iter().map(UserRow::into_user).collect()
    }

    fn insert_attendance(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO attendance (id, user_id, timestamp, status) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.id.to_string(),
                record.user_id.to_string(),
                format_timestamp(&record.timestamp),
                record.status.as_str(),
            ],
        )
        .map_err(|e| {
            if constraint_violation(&e, rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY) {
                StoreError::UserNotFound(record.user_id)
            } else {
                StoreError::backend(e)
            }
        })?;
        Ok(())
    }

    fn list_attendance(&self, filter: AttendanceFilter) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.lock()?;
        let rows = match filter {
            AttendanceFilter::All => {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, user_id, timestamp, status FROM attendance ORDER BY timestamp, rowid",
                    )
                    .map_err(StoreError::backend)?;
                let rows = stmt
                    .query_map([], AttendanceRow::from_row)
                    .map_err(StoreError::backend)?
                    .collect::<rusqlite::Result<Vec<_>>>();
                rows
            }
            AttendanceFilter::ByUser(user_id) => {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, user_id, timestamp, status FROM attendance WHERE user_id = ?1 ORDER BY timestamp, rowid",
                    )
                    .map_err(StoreError::backend)?;
                let rows = stmt
                    .query_map([user_id.to_string()], AttendanceRow::from_row)
                    .map_err(StoreError::backend)?
                    .collect::<rusqlite::Result<Vec<_>>>();
                rows
            }
        }
        .map_err(StoreError::backend)?;

        rows.into_iter().map(AttendanceRow::into_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rollcall_core::{AttendanceId, AttendanceStatus, Role};

    fn user(email: &str, embedding: Option<Vec<u8>>) -> User {
        User {
            id: UserId::new(),
            name: "Grace".to_string(),
            email: email.to_string(),
            role: Role::Employee,
            embedding: embedding.map(EncryptedEmbedding::from),
            created_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        }
    }

    fn record(user_id: UserId, ts: DateTime<Utc>) -> AttendanceRecord {
        AttendanceRecord {
            id: AttendanceId::new(),
            user_id,
            timestamp: ts,
            status: AttendanceStatus::Present,
        }
    }

    #[test]
    fn test_migration_sets_version() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_user_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let u = user("grace@example.com", Some(vec![1, 2, 3]));
        store.insert_user(&u).unwrap();
        let found = store.find_user_by_email("grace@example.com").unwrap();
        assert_eq!(found, Some(u));
        assert_eq!(store.find_user_by_email("nobody@example.com").unwrap(), None);
    }

    #[test]
    fn test_duplicate_email() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_user(&user("grace@example.com", None)).unwrap();
        let err = store.insert_user(&user("grace@example.com", None)).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEmail(e) if e == "grace@example.com"));
    }

    #[test]
    fn test_embeddings_in_enrollment_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = user("a@example.com", Some(vec![1]));
        let b = user("b@example.com", None);
        let c = user("c@example.com", Some(vec![3]));
        for u in [&a, &b, &c] {
            store.insert_user(u).unwrap();
        }
        let stored = store.list_users_with_embeddings().unwrap();
        assert_eq!(
            stored.iter().map(|s| s.user_id).collect::<Vec<_>>(),
            vec![a.id, c.id]
        );
        assert_eq!(stored[1].embedding.as_bytes(), &[3]);
        assert_eq!(store.list_users().unwrap().len(), 3);
    }

    #[test]
    fn test_update_embedding() {
        let store = SqliteStore::open_in_memory().unwrap();
        let u = user("grace@example.com", None);
        store.insert_user(&u).unwrap();
        store
            .update_user_embedding(u.id, "Grace H.", &EncryptedEmbedding::from(vec![7; 40]))
            .unwrap();
        let found = store.find_user_by_email("grace@example.com").unwrap().unwrap();
        assert_eq!(found.name, "Grace H.");
        assert!(found.is_enrolled());

        let missing = store.update_user_embedding(UserId::new(), "x", &EncryptedEmbedding::from(vec![1]));
        assert!(matches!(missing, Err(StoreError::UserNotFound(_))));
    }

    #[test]
    fn test_claim_embedding_is_compare_and_set() {
        let store = SqliteStore::open_in_memory().unwrap();
        let u = user("admin@example.com", None);
        store.insert_user(&u).unwrap();

        assert!(store
            .claim_user_embedding(u.id, "Admin", &EncryptedEmbedding::from(vec![1; 40]))
            .unwrap());
        assert!(!store
            .claim_user_embedding(u.id, "Second", &EncryptedEmbedding::from(vec![2; 40]))
            .unwrap());

        let found = store.find_user_by_email("admin@example.com").unwrap().unwrap();
        assert_eq!(found.name, "Admin");
        assert_eq!(found.embedding.unwrap().as_bytes(), &[1; 40]);

        let missing = store.claim_user_embedding(UserId::new(), "x", &EncryptedEmbedding::from(vec![1]));
        assert!(matches!(missing, Err(StoreError::UserNotFound(_))));
    }

    #[test]
    fn test_attendance_order_and_filter() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = user("a@example.com", None);
        let b = user("b@example.com", None);
        store.insert_user(&a).unwrap();
        store.insert_user(&b).unwrap();

        let at = |h, ns| Utc.with_ymd_and_hms(2024, 6, 1, h, 0, 0).unwrap() + chrono::TimeDelta::nanoseconds(ns);
        let late = record(a.id, at(17, 0));
        let early = record(b.id, at(8, 0));
        let precise = record(a.id, at(8, 123_456_789));
        for r in [&late, &early, &precise] {
            store.insert_attendance(r).unwrap();
        }

        let all = store.list_attendance(AttendanceFilter::All).unwrap();
        assert_eq!(all, vec![early.clone(), precise.clone(), late.clone()]);

        let only_a = store.list_attendance(AttendanceFilter::ByUser(a.id)).unwrap();
        assert_eq!(only_a, vec![precise, late]);
    }

    #[test]
    fn test_attendance_requires_existing_user() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .insert_attendance(&record(UserId::new(), Utc::now()))
            .unwrap_err();
        assert!(matches!(err, StoreError::UserNotFound(_)));
    }

    #[test]
    fn test_corrupt_role_is_reported() {
        let store = SqliteStore::open_in_memory().unwrap();
        let u = user("grace@example.com", None);
        store.insert_user(&u).unwrap();
        store
            .lock()
            .unwrap()
            .execute("UPDATE users SET role = 'superuser'", [])
            .unwrap();
        assert!(matches!(
            store.find_user_by_email("grace@example.com"),
            Err(StoreError::Corrupt(_))
        ));
    }
}
