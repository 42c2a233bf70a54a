// Models module - Database entity representations

pub mod attendance;

pub use attendance::{
    AttendanceRecord, AttendanceStatus, CheckInSource, ExitType, NewAttendance, SubjectKind,
};
