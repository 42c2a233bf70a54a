use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Whether the tracked subject is a gym member or a trainer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subject_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    #[default]
    Member,
    Trainer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "attendance_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    In,
    Out,
}

/// How an open session was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "exit_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExitType {
    /// Operator or subject checked out
    Manual,
    /// Closed by the auto-checkout sweep
    Auto,
}

/// Provenance of a check-in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "check_in_source", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CheckInSource {
    #[default]
    Manual,
    QrScan,
    Class,
}

/// One visit of a subject to a facility.
///
/// Created open (`status = in`) by a check-in and closed exactly once, either
/// manually or by the auto-checkout sweep. Records are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub subject_kind: SubjectKind,
    pub facility_id: Uuid,
    pub check_in_time: DateTime<Utc>,
    pub check_out_time: Option<DateTime<Utc>>,
    pub status: AttendanceStatus,
    pub exit_type: Option<ExitType>,
    pub source: CheckInSource,
}

#[derive(Debug, Clone)]
pub struct NewAttendance {
    pub subject_id: Uuid,
    pub subject_kind: SubjectKind,
    pub facility_id: Uuid,
    pub source: CheckInSource,
    pub check_in_time: DateTime<Utc>,
}

impl AttendanceRecord {
    /// Builds the open record a check-in produces
    pub fn open(data: NewAttendance) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_id: data.subject_id,
            subject_kind: data.subject_kind,
            facility_id: data.facility_id,
            check_in_time: data.check_in_time,
            check_out_time: None,
            status: AttendanceStatus::In,
            exit_type: None,
            source: data.source,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == AttendanceStatus::In
    }

    /// Closes the record at `at`, never earlier than the check-in.
    ///
    /// Returns `false` without touching the record if it is already closed.
    pub fn close(&mut self, at: DateTime<Utc>, exit_type: ExitType) -> bool {
        if !self.is_open() {
            return false;
        }

        self.check_out_time = Some(at.max(self.check_in_time));
        self.status = AttendanceStatus::Out;
        self.exit_type = Some(exit_type);
        true
    }
}
