use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::store::{AttendanceStore, StoreError, StoreResult};
use crate::models::attendance::{AttendanceRecord, ExitType, NewAttendance};
use crate::services::day_window::DayWindow;

/// Process-local attendance store, used when no database is configured.
///
/// A single lock guards every record, so inserts and closes are serialized
/// the same way the Postgres unique index and conditional updates serialize them.
#[derive(Default)]
pub struct MemoryAttendanceStore {
    records: RwLock<Vec<AttendanceRecord>>,
}

impl MemoryAttendanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(records: &mut [AttendanceRecord]) {
    records.sort_by(|a, b| b.check_in_time.cmp(&a.check_in_time));
}

#[async_trait]
impl AttendanceStore for MemoryAttendanceStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn insert_open(&self, data: NewAttendance) -> StoreResult<AttendanceRecord> {
        let mut records = self.records.write().await;

        if records.iter().any(|r| {
            r.is_open() && r.subject_id == data.subject_id && r.facility_id == data.facility_id
        }) {
            return Err(StoreError::Duplicate);
        }

        let record = AttendanceRecord::open(data);
        records.push(record.clone());

        Ok(record)
    }

    async fn close_open(
        &self,
        subject_id: Uuid,
        facility_id: Uuid,
        at: DateTime<Utc>,
        exit_type: ExitType,
    ) -> StoreResult<Option<AttendanceRecord>> {
        let mut records = self.records.write().await;

        Ok(records
            .iter_mut()
            .find(|r| r.is_open() && r.subject_id == subject_id && r.facility_id == facility_id)
            .map(|record| {
                record.close(at, exit_type);
                record.clone()
            }))
    }

    async fn close_by_id(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        exit_type: ExitType,
    ) -> StoreResult<Option<AttendanceRecord>> {
        let mut records = self.records.write().await;

        Ok(records
            .iter_mut()
            .find(|r| r.id == id)
            .filter(|r| r.is_open())
            .map(|record| {
                record.close(at, exit_type);
                record.clone()
            }))
    }

    async fn list_open_before(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<AttendanceRecord>> {
        let records = self.records.read().await;

        let mut open: Vec<_> = records
            .iter()
            .filter(|r| r.is_open() && r.check_in_time < before)
            .cloned()
            .collect();
        open.sort_by_key(|r| r.check_in_time);
        open.truncate(usize::try_from(limit).unwrap_or(0));

        Ok(open)
    }

    async fn list_checkins(
        &self,
        facility_id: Uuid,
        window: &DayWindow,
    ) -> StoreResult<Vec<AttendanceRecord>> {
        let records = self.records.read().await;

        let mut matching: Vec<_> = records
            .iter()
            .filter(|r| r.facility_id == facility_id && window.contains(r.check_in_time))
            .cloned()
            .collect();
        newest_first(&mut matching);

        Ok(matching)
    }

    async fn count_checkins(&self, facility_id: Uuid, window: &DayWindow) -> StoreResult<i64> {
        let records = self.records.read().await;

        Ok(records
            .iter()
            .filter(|r| r.facility_id == facility_id && window.contains(r.check_in_time))
            .count() as i64)
    }

    async fn count_open(&self, facility_id: Uuid, window: &DayWindow) -> StoreResult<i64> {
        let records = self.records.read().await;

        Ok(records
            .iter()
            .filter(|r| {
                r.facility_id == facility_id && r.is_open() && window.contains(r.check_in_time)
            })
            .count() as i64)
    }

    async fn daily_checkins(
        &self,
        facility_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        offset: FixedOffset,
    ) -> StoreResult<Vec<(NaiveDate, i64)>> {
        let records = self.records.read().await;

        let mut per_day: BTreeMap<NaiveDate, i64> = BTreeMap::new();
        for record in records.iter().filter(|r| {
            r.facility_id == facility_id && start <= r.check_in_time && r.check_in_time < end
        }) {
            let day = record.check_in_time.with_timezone(&offset).date_naive();
            *per_day.entry(day).or_default() += 1;
        }

        Ok(per_day.into_iter().collect())
    }

    async fn list_by_subject(
        &self,
        subject_id: Uuid,
        facility_id: Uuid,
        limit: i64,
    ) -> StoreResult<Vec<AttendanceRecord>> {
        let records = self.records.read().await;

        let mut visits: Vec<_> = records
            .iter()
            .filter(|r| r.subject_id == subject_id && r.facility_id == facility_id)
            .cloned()
            .collect();
        newest_first(&mut visits);
        visits.truncate(usize::try_from(limit).unwrap_or(0));

        Ok(visits)
    }
}
