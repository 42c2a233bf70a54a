use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::store::{AttendanceStore, StoreResult};
use crate::models::attendance::{AttendanceRecord, ExitType, NewAttendance};
use crate::services::day_window::DayWindow;

/// Attendance records in the `attendance_records` table.
///
/// The partial unique index `attendance_one_open_per_subject` serializes
/// concurrent check-ins; closing updates carry `status = 'in'` in their
/// predicate so the first writer wins.
#[derive(Clone)]
pub struct PgAttendanceStore {
    pool: PgPool,
}

impl PgAttendanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AttendanceStore for PgAttendanceStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    async fn insert_open(&self, data: NewAttendance) -> StoreResult<AttendanceRecord> {
        let record = sqlx::query_as::<_, AttendanceRecord>(
            r#"
            INSERT INTO attendance_records (subject_id, subject_kind, facility_id, check_in_time, status, source)
            VALUES ($1, $2, $3, $4, 'in', $5)
            RETURNING *
            "#,
        )
        .bind(data.subject_id)
        .bind(data.subject_kind)
        .bind(data.facility_id)
        .bind(data.check_in_time)
        .bind(data.source)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn close_open(
        &self,
        subject_id: Uuid,
        facility_id: Uuid,
        at: DateTime<Utc>,
        exit_type: ExitType,
    ) -> StoreResult<Option<AttendanceRecord>> {
        let record = sqlx::query_as::<_, AttendanceRecord>(
            r#"
            UPDATE attendance_records
            SET
                check_out_time = GREATEST($3, check_in_time),
                status = 'out',
                exit_type = $4
            WHERE subject_id = $1 AND facility_id = $2 AND status = 'in'
            RETURNING *
            "#,
        )
        .bind(subject_id)
        .bind(facility_id)
        .bind(at)
        .bind(exit_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn close_by_id(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        exit_type: ExitType,
    ) -> StoreResult<Option<AttendanceRecord>> {
        let record = sqlx::query_as::<_, AttendanceRecord>(
            r#"
            UPDATE attendance_records
            SET
                check_out_time = GREATEST($2, check_in_time),
                status = 'out',
                exit_type = $3
            WHERE id = $1 AND status = 'in'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(at)
        .bind(exit_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_open_before(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<AttendanceRecord>> {
        let records = sqlx::query_as::<_, AttendanceRecord>(
            r#"
            SELECT * FROM attendance_records
            WHERE status = 'in' AND check_in_time < $1
            ORDER BY check_in_time ASC
            LIMIT $2
            "#,
        )
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_checkins(
        &self,
        facility_id: Uuid,
        window: &DayWindow,
    ) -> StoreResult<Vec<AttendanceRecord>> {
        let records = sqlx::query_as::<_, AttendanceRecord>(
            r#"
            SELECT * FROM attendance_records
            WHERE facility_id = $1 AND check_in_time >= $2 AND check_in_time < $3
            ORDER BY check_in_time DESC
            "#,
        )
        .bind(facility_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn count_checkins(&self, facility_id: Uuid, window: &DayWindow) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM attendance_records
            WHERE facility_id = $1 AND check_in_time >= $2 AND check_in_time < $3
            "#,
        )
        .bind(facility_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn count_open(&self, facility_id: Uuid, window: &DayWindow) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM attendance_records
            WHERE facility_id = $1
              AND status = 'in'
              AND check_in_time >= $2
              AND check_in_time < $3
            "#,
        )
        .bind(facility_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn daily_checkins(
        &self,
        facility_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        offset: FixedOffset,
    ) -> StoreResult<Vec<(NaiveDate, i64)>> {
        let rows = sqlx::query_as::<_, (NaiveDate, i64)>(
            r#"
            SELECT
                ((check_in_time AT TIME ZONE 'UTC') + ($4::INT * INTERVAL '1 second'))::DATE AS day,
                COUNT(*) AS checkins
            FROM attendance_records
            WHERE facility_id = $1 AND check_in_time >= $2 AND check_in_time < $3
            GROUP BY day
            ORDER BY day ASC
            "#,
        )
        .bind(facility_id)
        .bind(start)
        .bind(end)
        .bind(offset.local_minus_utc())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn list_by_subject(
        &self,
        subject_id: Uuid,
        facility_id: Uuid,
        limit: i64,
    ) -> StoreResult<Vec<AttendanceRecord>> {
        let records = sqlx::query_as::<_, AttendanceRecord>(
            r#"
            SELECT * FROM attendance_records
            WHERE subject_id = $1 AND facility_id = $2
            ORDER BY check_in_time DESC
            LIMIT $3
            "#,
        )
        .bind(subject_id)
        .bind(facility_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
