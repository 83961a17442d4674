//! Append-only attendance recording.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::store::{AttendanceFilter, IdentityStore, StoreError};
use crate::types::{AttendanceId, AttendanceRecord, AttendanceStatus, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RecordOutcome {
    Recorded { id: AttendanceId },
    /// Within the cooldown of `previous`; nothing was appended.
    Suppressed {
        previous: AttendanceId,
        previous_at: DateTime<Utc>,
    },
}

/// Writes one `present` record per recognition. With a cooldown configured,
/// a repeat within the window of the user's latest record is suppressed.
///
/// The cooldown lookup and the insert are separate store calls, so two
/// processes recognizing the same user at once can both append inside the
/// window.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttendanceRecorder {
    cooldown: Option<TimeDelta>,
}

impl AttendanceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A zero or negative window disables the cooldown.
    pub fn with_cooldown(cooldown: TimeDelta) -> Self {
        Self {
            cooldown: (cooldown > TimeDelta::zero()).then_some(cooldown),
        }
    }

    pub fn cooldown(&self) -> Option<TimeDelta> {
        self.cooldown
    }

    pub fn record<S: IdentityStore + ?Sized>(
        &self,
        store: &S,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<RecordOutcome, StoreError> {
        if let Some(cooldown) = self.cooldown {
            let latest = store
                .list_attendance(AttendanceFilter::ByUser(user_id))?
                .into_iter()
                .max_by_key(|r| r.timestamp);
            if let Some(previous) = latest {
                let elapsed = at - previous.timestamp;
                if elapsed >= TimeDelta::zero() && elapsed < cooldown {
                    tracing::info!(
                        user_id = %user_id,
                        previous = %previous.id,
                        elapsed_secs = elapsed.num_seconds(),
                        "attendance suppressed by cooldown"
                    );
                    return Ok(RecordOutcome::Suppressed {
                        previous: previous.id,
                        previous_at: previous.timestamp,
                    });
                }
            }
        }

        let record = AttendanceRecord {
            id: AttendanceId::new(),
            user_id,
            timestamp: at,
            status: AttendanceStatus::Present,
        };
        store.insert_attendance(&record)?;
        tracing::info!(user_id = %user_id, record_id = %record.id, "attendance recorded");
        Ok(RecordOutcome::Recorded { id: record.id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{Role, User};
    use chrono::TimeZone;

    fn store_with_user() -> (MemoryStore, UserId) {
        let store = MemoryStore::new();
        let user = User {
            id: UserId::new(),
            name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
            role: Role::Employee,
            embedding: None,
            created_at: Utc::now(),
        };
        store.insert_user(&user).unwrap();
        (store, user.id)
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 9, minute, 0).unwrap()
    }

    #[test]
    fn test_every_call_appends_without_cooldown() {
        let (store, user) = store_with_user();
        let recorder = AttendanceRecorder::new();
        for m in [0, 0, 1] {
            let outcome = recorder.record(&store, user, at(m)).unwrap();
            assert!(matches!(outcome, RecordOutcome::Recorded { .. }));
        }
        let records = store.list_attendance(AttendanceFilter::All).unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.status == AttendanceStatus::Present));
    }

    #[test]
    fn test_recorded_record_matches_input() {
        let (store, user) = store_with_user();
        let outcome = AttendanceRecorder::new().record(&store, user, at(5)).unwrap();
        let RecordOutcome::Recorded { id } = outcome else {
            panic!("expected a record, got {outcome:?}");
        };
        let records = store.list_attendance(AttendanceFilter::ByUser(user)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].timestamp, at(5));
    }

    #[test]
    fn test_cooldown_suppresses_repeat() {
        let (store, user) = store_with_user();
        let recorder = AttendanceRecorder::with_cooldown(TimeDelta::minutes(10));

        let first = recorder.record(&store, user, at(0)).unwrap();
        let RecordOutcome::Recorded { id: first_id } = first else {
            panic!("expected a record, got {first:?}");
        };

        let repeat = recorder.record(&store, user, at(9)).unwrap();
        assert_eq!(
            repeat,
            RecordOutcome::Suppressed {
                previous: first_id,
                previous_at: at(0)
            }
        );

        // The window is exclusive at its end.
        let later = recorder.record(&store, user, at(10)).unwrap();
        assert!(matches!(later, RecordOutcome::Recorded { .. }));
        assert_eq!(store.list_attendance(AttendanceFilter::All).unwrap().len(), 2);
    }

    #[test]
    fn test_zero_cooldown_is_disabled() {
        assert_eq!(AttendanceRecorder::with_cooldown(TimeDelta::zero()).cooldown(), None);
        assert_eq!(AttendanceRecorder::new().cooldown(), None);
    }

    #[test]
    fn test_unknown_user_is_a_store_error() {
        let (store, _) = store_with_user();
        let result = AttendanceRecorder::new().record(&store, UserId::new(), at(0));
        assert!(matches!(result, Err(StoreError::UserNotFound(_))));
    }
}
