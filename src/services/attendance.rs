use std::sync::Arc;

use chrono::{FixedOffset, NaiveDate};
use serde::Serialize;
use uuid::Uuid;

use crate::db::store::{retry_once, AttendanceStore, StoreError};
use crate::jobs::auto_checkout::{self, AutoCheckoutStats};
use crate::models::attendance::{
    AttendanceRecord, CheckInSource, ExitType, NewAttendance, SubjectKind,
};
use crate::services::clock::Clock;
use crate::services::day_window::{DayRange, DayRangeError, DayWindow};
use crate::services::qr_checkin::{QrSigner, QrTokenError};

#[derive(thiserror::Error, Debug)]
pub enum AttendanceError {
    #[error("Subject is already checked in at this facility")]
    AlreadyCheckedIn,

    #[error("Subject is not checked in at this facility")]
    NotCheckedIn,

    #[error("Invalid date range: {0}")]
    InvalidRange(#[from] DayRangeError),

    #[error("QR check-in rejected: {0}")]
    QrToken(#[from] QrTokenError),

    #[error("Storage error: {0}")]
    Storage(StoreError),
}

impl From<StoreError> for AttendanceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate => AttendanceError::AlreadyCheckedIn,
            other => AttendanceError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, AttendanceError>;

#[derive(Debug, Clone)]
pub struct CheckInRequest {
    pub subject_id: Uuid,
    pub subject_kind: SubjectKind,
    pub facility_id: Uuid,
    pub source: CheckInSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyCheckins {
    pub date: NaiveDate,
    pub checkins: i64,
}

/// Snapshot a dashboard polls for one facility-local day
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TodaySummary {
    pub date: NaiveDate,
    pub records: Vec<AttendanceRecord>,
    pub checkins: i64,
    pub currently_inside: i64,
}

/// Check-in/check-out handling and the read side dashboards poll
#[derive(Clone)]
pub struct AttendanceService {
    store: Arc<dyn AttendanceStore>,
    clock: Arc<dyn Clock>,
    qr: QrSigner,
    day_offset: FixedOffset,
    sweep_batch_size: i64,
}

impl AttendanceService {
    pub fn new(
        store: Arc<dyn AttendanceStore>,
        clock: Arc<dyn Clock>,
        qr: QrSigner,
        day_offset: FixedOffset,
        sweep_batch_size: i64,
    ) -> Self {
        Self {
            store,
            clock,
            qr,
            day_offset,
            sweep_batch_size,
        }
    }

    pub fn store(&self) -> &dyn AttendanceStore {
        self.store.as_ref()
    }

    /// The local day for `date`, or the current one.
    ///
    /// `offset` overrides the configured facility offset for this query only.
    pub fn day_window(
        &self,
        date: Option<NaiveDate>,
        offset: Option<FixedOffset>,
    ) -> Result<DayWindow> {
        let offset = offset.unwrap_or(self.day_offset);
        let window = match date {
            Some(date) => DayWindow::for_local_date(date, offset)?,
            None => DayWindow::containing(self.clock.now(), offset)?,
        };

        Ok(window)
    }

    /// Opens a session; a subject already inside is rejected with `AlreadyCheckedIn`
    pub async fn check_in(&self, req: CheckInRequest) -> Result<AttendanceRecord> {
        let data = NewAttendance {
            subject_id: req.subject_id,
            subject_kind: req.subject_kind,
            facility_id: req.facility_id,
            source: req.source,
            check_in_time: self.clock.now(),
        };

        let record = retry_once("check_in", || self.store.insert_open(data.clone()))
            .await
            .map_err(|e| {
                if !matches!(e, StoreError::Duplicate) {
                    tracing::error!(
                        subject_id = %req.subject_id,
                        facility_id = %req.facility_id,
                        error = %e,
                        "Check-in failed"
                    );
                }
                AttendanceError::from(e)
            })?;

        tracing::info!(
            record_id = %record.id,
            subject_id = %record.subject_id,
            facility_id = %record.facility_id,
            source = ?record.source,
            "Checked in"
        );

        Ok(record)
    }

    /// Closes the subject's open session with a manual exit
    pub async fn check_out(&self, subject_id: Uuid, facility_id: Uuid) -> Result<AttendanceRecord> {
        let now = self.clock.now();

        let record = retry_once("check_out", || {
            self.store
                .close_open(subject_id, facility_id, now, ExitType::Manual)
        })
        .await?
        .ok_or(AttendanceError::NotCheckedIn)?;

        tracing::info!(
            record_id = %record.id,
            subject_id = %subject_id,
            facility_id = %facility_id,
            "Checked out"
        );

        Ok(record)
    }

    /// Checks a subject in from a scanned facility QR code
    pub async fn check_in_with_qr(
        &self,
        facility_id: Uuid,
        token: &str,
        subject_id: Uuid,
        subject_kind: SubjectKind,
    ) -> Result<AttendanceRecord> {
        let payload = self.qr.verify(token, self.clock.now())?;
        if payload.facility_id != facility_id {
            return Err(QrTokenError::WrongFacility.into());
        }

        self.check_in(CheckInRequest {
            subject_id,
            subject_kind,
            facility_id,
            source: CheckInSource::QrScan,
        })
        .await
    }

    /// A fresh signed token for the facility's check-in QR code
    pub fn issue_qr_token(&self, facility_id: Uuid) -> Result<String> {
        Ok(self.qr.issue(facility_id, self.clock.now())?)
    }

    pub async fn currently_inside(&self, facility_id: Uuid, window: &DayWindow) -> Result<i64> {
        Ok(self.store.count_open(facility_id, window).await?)
    }

    pub async fn todays_checkins(&self, facility_id: Uuid, window: &DayWindow) -> Result<i64> {
        Ok(self.store.count_checkins(facility_id, window).await?)
    }

    pub async fn today_summary(&self, facility_id: Uuid, window: &DayWindow) -> Result<TodaySummary> {
        let records = self.store.list_checkins(facility_id, window).await?;
        let checkins = self.todays_checkins(facility_id, window).await?;
        let currently_inside = self.currently_inside(facility_id, window).await?;

        Ok(TodaySummary {
            date: window.date,
            records,
            checkins,
            currently_inside,
        })
    }

    /// Daily check-in counts over `range`, one entry per day including empty ones
    pub async fn history(
        &self,
        facility_id: Uuid,
        range: &DayRange,
        offset: Option<FixedOffset>,
    ) -> Result<Vec<DailyCheckins>> {
        let offset = offset.unwrap_or(self.day_offset);
        let (start, end) = range.bounds(offset)?;
        let counts = self
            .store
            .daily_checkins(facility_id, start, end, offset)
            .await?;

        Ok(fill_days(range, &counts))
    }

    pub async fn subject_history(
        &self,
        subject_id: Uuid,
        facility_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AttendanceRecord>> {
        Ok(self
            .store
            .list_by_subject(subject_id, facility_id, limit)
            .await?)
    }

    /// Runs one auto-checkout sweep as of now
    pub async fn run_auto_checkout(&self) -> Result<AutoCheckoutStats> {
        auto_checkout::run_auto_checkout(
            self.store.as_ref(),
            self.clock.now(),
            self.day_offset,
            self.sweep_batch_size,
        )
        .await
    }
}

fn fill_days(range: &DayRange, counts: &[(NaiveDate, i64)]) -> Vec<DailyCheckins> {
    range
        .days()
        .map(|date| DailyCheckins {
            date,
            checkins: counts
                .iter()
                .find(|(day, _)| *day == date)
                .map_or(0, |(_, n)| *n),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryAttendanceStore;
    use crate::db::store::StoreResult;
    use crate::models::attendance::AttendanceStatus;
    use crate::services::clock::ManualClock;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 14, 6, 0, 0).unwrap()
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn service_with(store: Arc<dyn AttendanceStore>) -> (AttendanceService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let service = AttendanceService::new(
            store,
            clock.clone(),
            QrSigner::new(b"test-key", Duration::minutes(5)),
            utc(),
            100,
        );
        (service, clock)
    }

    fn service() -> (AttendanceService, Arc<ManualClock>) {
        service_with(Arc::new(MemoryAttendanceStore::new()))
    }

    fn manual(subject_id: Uuid, facility_id: Uuid) -> CheckInRequest {
        CheckInRequest {
            subject_id,
            subject_kind: SubjectKind::Member,
            facility_id,
            source: CheckInSource::Manual,
        }
    }

    #[tokio::test]
    async fn test_check_in_then_out() {
        let (service, clock) = service();
        let (subject, facility) = (Uuid::new_v4(), Uuid::new_v4());

        let record = service.check_in(manual(subject, facility)).await.unwrap();
        assert_eq!(record.status, AttendanceStatus::In);
        assert_eq!(record.exit_type, None);
        assert_eq!(record.source, CheckInSource::Manual);

        clock.advance(Duration::minutes(45));
        let closed = service.check_out(subject, facility).await.unwrap();

        assert_eq!(closed.id, record.id);
        assert_eq!(closed.status, AttendanceStatus::Out);
        assert_eq!(closed.exit_type, Some(ExitType::Manual));
        assert_eq!(closed.check_out_time, Some(start() + Duration::minutes(45)));
    }

    #[tokio::test]
    async fn test_immediate_check_out_not_before_check_in() {
        let (service, _clock) = service();
        let (subject, facility) = (Uuid::new_v4(), Uuid::new_v4());

        let record = service.check_in(manual(subject, facility)).await.unwrap();
        let closed = service.check_out(subject, facility).await.unwrap();

        assert!(closed.check_out_time.unwrap() >= record.check_in_time);
    }

    #[tokio::test]
    async fn test_duplicate_check_in_is_hard_error() {
        let (service, _clock) = service();
        let (subject, facility) = (Uuid::new_v4(), Uuid::new_v4());

        service.check_in(manual(subject, facility)).await.unwrap();
        let dup = service.check_in(manual(subject, facility)).await;

        assert!(matches!(dup, Err(AttendanceError::AlreadyCheckedIn)));
        let visits = service.subject_history(subject, facility, 10).await.unwrap();
        assert_eq!(visits.len(), 1);
    }

    #[tokio::test]
    async fn test_check_in_again_after_check_out() {
        let (service, clock) = service();
        let (subject, facility) = (Uuid::new_v4(), Uuid::new_v4());

        service.check_in(manual(subject, facility)).await.unwrap();
        clock.advance(Duration::hours(1));
        service.check_out(subject, facility).await.unwrap();
        clock.advance(Duration::hours(3));
        service.check_in(manual(subject, facility)).await.unwrap();

        let visits = service.subject_history(subject, facility, 10).await.unwrap();
        assert_eq!(visits.len(), 2);
        assert_eq!(visits.iter().filter(|r| r.is_open()).count(), 1);
    }

    #[tokio::test]
    async fn test_check_out_without_check_in() {
        let (service, _clock) = service();

        let result = service.check_out(Uuid::new_v4(), Uuid::new_v4()).await;

        assert!(matches!(result, Err(AttendanceError::NotCheckedIn)));
    }

    #[tokio::test]
    async fn test_currently_inside_after_five_in_three_out() {
        let (service, clock) = service();
        let facility = Uuid::new_v4();
        let subjects: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();

        for subject in &subjects {
            service.check_in(manual(*subject, facility)).await.unwrap();
            clock.advance(Duration::minutes(10));
        }
        for subject in &subjects[..3] {
            service.check_out(*subject, facility).await.unwrap();
        }

        let today = service.day_window(None, None).unwrap();
        assert_eq!(service.currently_inside(facility, &today).await.unwrap(), 2);
        assert_eq!(service.todays_checkins(facility, &today).await.unwrap(), 5);

        let summary = service.today_summary(facility, &today).await.unwrap();
        assert_eq!(summary.records.len(), 5);
        assert_eq!(summary.currently_inside, 2);
    }

    #[tokio::test]
    async fn test_queries_scoped_to_facility_and_day() {
        let (service, clock) = service();
        let (facility, other) = (Uuid::new_v4(), Uuid::new_v4());

        service.check_in(manual(Uuid::new_v4(), facility)).await.unwrap();
        service.check_in(manual(Uuid::new_v4(), other)).await.unwrap();
        clock.advance(Duration::days(1));
        service.check_in(manual(Uuid::new_v4(), facility)).await.unwrap();

        let yesterday = service.day_window(Some(start().date_naive()), None).unwrap();
        let today = service.day_window(None, None).unwrap();

        assert_eq!(service.todays_checkins(facility, &yesterday).await.unwrap(), 1);
        assert_eq!(service.todays_checkins(facility, &today).await.unwrap(), 1);
        assert_eq!(service.currently_inside(other, &today).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_history_zero_fills() {
        let (service, clock) = service();
        let facility = Uuid::new_v4();

        service.check_in(manual(Uuid::new_v4(), facility)).await.unwrap();
        service.check_in(manual(Uuid::new_v4(), facility)).await.unwrap();
        clock.advance(Duration::days(2));
        service.check_in(manual(Uuid::new_v4(), facility)).await.unwrap();

        let range = DayRange::ending_on(clock.now().date_naive(), 4).unwrap();
        let history = service.history(facility, &range, None).await.unwrap();

        let counts: Vec<i64> = history.iter().map(|d| d.checkins).collect();
        assert_eq!(counts, vec![0, 2, 0, 1]);
        assert_eq!(history[1].date, start().date_naive());
    }

    #[tokio::test]
    async fn test_qr_check_in() {
        let (service, clock) = service();
        let (subject, facility) = (Uuid::new_v4(), Uuid::new_v4());

        let token = service.issue_qr_token(facility).unwrap();
        clock.advance(Duration::minutes(1));
        let record = service
            .check_in_with_qr(facility, &token, subject, SubjectKind::Trainer)
            .await
            .unwrap();

        assert_eq!(record.source, CheckInSource::QrScan);
        assert_eq!(record.subject_kind, SubjectKind::Trainer);
    }

    #[tokio::test]
    async fn test_qr_token_for_other_facility_rejected() {
        let (service, _clock) = service();

        let token = service.issue_qr_token(Uuid::new_v4()).unwrap();
        let result = service
            .check_in_with_qr(Uuid::new_v4(), &token, Uuid::new_v4(), SubjectKind::Member)
            .await;

        assert!(matches!(
            result,
            Err(AttendanceError::QrToken(QrTokenError::WrongFacility))
        ));
    }

    #[tokio::test]
    async fn test_queries_at_requested_offset() {
        let (service, _clock) = service();
        let facility = Uuid::new_v4();
        service.check_in(manual(Uuid::new_v4(), facility)).await.unwrap();

        // 06:00 UTC is still the previous evening at UTC-8
        let pacific = FixedOffset::west_opt(8 * 3600).unwrap();
        let window = service.day_window(None, Some(pacific)).unwrap();
        let previous_day = NaiveDate::from_ymd_opt(2025, 7, 13).unwrap();

        assert_eq!(window.date, previous_day);
        assert_eq!(service.todays_checkins(facility, &window).await.unwrap(), 1);

        let range = DayRange::new(previous_day, start().date_naive()).unwrap();
        let history = service.history(facility, &range, Some(pacific)).await.unwrap();
        let counts: Vec<i64> = history.iter().map(|d| d.checkins).collect();
        assert_eq!(counts, vec![1, 0]);
    }

    #[tokio::test]
    async fn test_unrepresentable_day_is_invalid_range() {
        let (service, _clock) = service();

        let result = service.day_window(Some(NaiveDate::MAX), None);

        assert!(matches!(
            result,
            Err(AttendanceError::InvalidRange(DayRangeError::OutOfRange(_)))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_check_ins_open_one_session() {
        let (service, _clock) = service();
        let (subject, facility) = (Uuid::new_v4(), Uuid::new_v4());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.check_in(manual(subject, facility)).await })
            })
            .collect();

        let mut opened = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => opened += 1,
                Err(AttendanceError::AlreadyCheckedIn) => rejected += 1,
                Err(e) => panic!("unexpected check-in error: {}", e),
            }
        }

        assert_eq!(opened, 1);
        assert_eq!(rejected, 15);
        let visits = service.subject_history(subject, facility, 50).await.unwrap();
        assert_eq!(visits.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_manual_checkout_racing_sweep_closes_once() {
        for _ in 0..20 {
            let (service, clock) = service();
            let (subject, facility) = (Uuid::new_v4(), Uuid::new_v4());
            service.check_in(manual(subject, facility)).await.unwrap();
            clock.advance(Duration::days(1));

            let checkout = tokio::spawn({
                let service = service.clone();
                async move { service.check_out(subject, facility).await }
            });
            let sweep = tokio::spawn({
                let service = service.clone();
                async move { service.run_auto_checkout().await }
            });
            let checkout = checkout.await.unwrap();
            let stats = sweep.await.unwrap().unwrap();

            let visits = service.subject_history(subject, facility, 10).await.unwrap();
            assert_eq!(visits.len(), 1);
            assert!(!visits[0].is_open());

            match checkout {
                Ok(closed) => {
                    assert_eq!(stats.closed, 0);
                    assert_eq!(closed.exit_type, Some(ExitType::Manual));
                    assert_eq!(visits[0].exit_type, Some(ExitType::Manual));
                }
                Err(AttendanceError::NotCheckedIn) => {
                    assert_eq!(stats.closed, 1);
                    assert_eq!(visits[0].exit_type, Some(ExitType::Auto));
                }
                Err(e) => panic!("unexpected check-out error: {}", e),
            }
        }
    }

    /// Fails the first `failures` inserts with a transient error
    struct FlakyStore {
        inner: MemoryAttendanceStore,
        failures: usize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl AttendanceStore for FlakyStore {
        fn backend(&self) -> &'static str {
            "flaky"
        }

        async fn ping(&self) -> StoreResult<()> {
            Ok(())
        }

        async fn insert_open(&self, data: NewAttendance) -> StoreResult<AttendanceRecord> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(StoreError::Transient("could not obtain lock".to_string()));
            }
            self.inner.insert_open(data).await
        }

        async fn close_open(
            &self,
            s: Uuid,
            f: Uuid,
            at: DateTime<Utc>,
            exit_type: ExitType,
        ) -> StoreResult<Option<AttendanceRecord>> {
            self.inner.close_open(s, f, at, exit_type).await
        }

        async fn close_by_id(
            &self,
            id: Uuid,
            at: DateTime<Utc>,
            exit_type: ExitType,
        ) -> StoreResult<Option<AttendanceRecord>> {
            self.inner.close_by_id(id, at, exit_type).await
        }

        async fn list_open_before(
            &self,
            before: DateTime<Utc>,
            limit: i64,
        ) -> StoreResult<Vec<AttendanceRecord>> {
            self.inner.list_open_before(before, limit).await
        }

        async fn list_checkins(&self, f: Uuid, w: &DayWindow) -> StoreResult<Vec<AttendanceRecord>> {
            self.inner.list_checkins(f, w).await
        }

        async fn count_checkins(&self, f: Uuid, w: &DayWindow) -> StoreResult<i64> {
            self.inner.count_checkins(f, w).await
        }

        async fn count_open(&self, f: Uuid, w: &DayWindow) -> StoreResult<i64> {
            self.inner.count_open(f, w).await
        }

        async fn daily_checkins(
            &self,
            f: Uuid,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
            offset: FixedOffset,
        ) -> StoreResult<Vec<(NaiveDate, i64)>> {
            self.inner.daily_checkins(f, start, end, offset).await
        }

        async fn list_by_subject(
            &self,
            s: Uuid,
            f: Uuid,
            limit: i64,
        ) -> StoreResult<Vec<AttendanceRecord>> {
            self.inner.list_by_subject(s, f, limit).await
        }
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let store = Arc::new(FlakyStore {
            inner: MemoryAttendanceStore::new(),
            failures: 1,
            attempts: AtomicUsize::new(0),
        });
        let (service, _clock) = service_with(store.clone());

        let record = service.check_in(manual(Uuid::new_v4(), Uuid::new_v4())).await;

        assert!(record.is_ok());
        assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_persistent_transient_failure_surfaces() {
        let store = Arc::new(FlakyStore {
            inner: MemoryAttendanceStore::new(),
            failures: 5,
            attempts: AtomicUsize::new(0),
        });
        let (service, _clock) = service_with(store.clone());

        let result = service.check_in(manual(Uuid::new_v4(), Uuid::new_v4())).await;

        assert!(matches!(
            result,
            Err(AttendanceError::Storage(StoreError::Transient(_)))
        ));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
    }
}
