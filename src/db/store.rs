use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use uuid::Uuid;

use crate::models::attendance::{AttendanceRecord, ExitType, NewAttendance};
use crate::services::day_window::DayWindow;

/// Name of the partial unique index enforcing one open record per subject and facility
pub const ONE_OPEN_PER_SUBJECT: &str = "attendance_one_open_per_subject";

const RETRY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("an open attendance record already exists for this subject")]
    Duplicate,

    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let transient = match &err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code();
                match code.as_deref() {
                    // unique_violation
                    Some("23505")
                        if db_err
                            .constraint()
                            .map_or(true, |c| c == ONE_OPEN_PER_SUBJECT) =>
                    {
                        return StoreError::Duplicate;
                    }
                    // serialization_failure, deadlock_detected, lock_not_available
                    Some("40001") | Some("40P01") | Some("55P03") => {
                        Some(db_err.message().to_string())
                    }
                    _ => None,
                }
            }
            sqlx::Error::PoolTimedOut => Some("connection pool timed out".to_string()),
            _ => None,
        };

        match transient {
            Some(reason) => StoreError::Transient(reason),
            None => StoreError::Database(err),
        }
    }
}

/// Persistence for attendance records.
///
/// Every mutation is a single atomic step. Closing operations only touch
/// records that are still open and return `None` when nothing matched.
#[async_trait]
pub trait AttendanceStore: Send + Sync {
    /// Short name of the backend, reported by the health check
    fn backend(&self) -> &'static str;

    async fn ping(&self) -> StoreResult<()>;

    /// Inserts an open record; fails with `Duplicate` if the subject already has one here
    async fn insert_open(&self, data: NewAttendance) -> StoreResult<AttendanceRecord>;

    async fn close_open(
        &self,
        subject_id: Uuid,
        facility_id: Uuid,
        at: DateTime<Utc>,
        exit_type: ExitType,
    ) -> StoreResult<Option<AttendanceRecord>>;

    async fn close_by_id(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        exit_type: ExitType,
    ) -> StoreResult<Option<AttendanceRecord>>;

    /// Open records checked in before `before`, oldest first
    async fn list_open_before(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<AttendanceRecord>>;

    /// Records checked in during `window`, newest first
    async fn list_checkins(
        &self,
        facility_id: Uuid,
        window: &DayWindow,
    ) -> StoreResult<Vec<AttendanceRecord>>;

    async fn count_checkins(&self, facility_id: Uuid, window: &DayWindow) -> StoreResult<i64>;

    /// Records checked in during `window` that are still open
    async fn count_open(&self, facility_id: Uuid, window: &DayWindow) -> StoreResult<i64>;

    /// Check-in counts in `[start, end)` per date at `offset`; days without check-ins are omitted
    async fn daily_checkins(
        &self,
        facility_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        offset: FixedOffset,
    ) -> StoreResult<Vec<(NaiveDate, i64)>>;

    /// A subject's visits to a facility, newest first
    async fn list_by_subject(
        &self,
        subject_id: Uuid,
        facility_id: Uuid,
        limit: i64,
    ) -> StoreResult<Vec<AttendanceRecord>>;
}

/// Runs `op`, retrying once after a short backoff if it failed transiently
pub async fn retry_once<T, F, Fut>(op_name: &'static str, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    match op().await {
        Err(StoreError::Transient(reason)) => {
            tracing::warn!(op = op_name, %reason, "Transient storage failure, retrying once");
            tokio::time::sleep(RETRY_BACKOFF).await;
            op().await
        }
        other => other,
    }
}
