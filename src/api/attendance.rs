use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::AppState;
use crate::error::{AppError, Result};
use crate::jobs::auto_checkout::AutoCheckoutStats;
use crate::models::attendance::{AttendanceRecord, CheckInSource, SubjectKind};
use crate::services::attendance::{AttendanceError, CheckInRequest, DailyCheckins, TodaySummary};
use crate::services::day_window::DayRange;
use crate::services::qr_checkin::{self, QrTokenError};

/// How often dashboards are expected to re-fetch the today view
pub const POLL_INTERVAL_SECS: u64 = 5;

const DEFAULT_HISTORY_DAYS: u32 = 7;
const DEFAULT_SUBJECT_LIMIT: i64 = 30;
const MAX_SUBJECT_LIMIT: i64 = 200;

// Request/Response types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttendanceAction {
    CheckIn,
    CheckOut,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceActionRequest {
    pub action: AttendanceAction,
    pub subject_id: Uuid,
    #[serde(default)]
    pub subject_kind: SubjectKind,
    #[serde(default)]
    pub source: CheckInSource,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrCheckInRequest {
    pub token: String,
    pub subject_id: Uuid,
    #[serde(default)]
    pub subject_kind: SubjectKind,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodayQuery {
    pub date: Option<NaiveDate>,
    /// Minutes east of UTC for the facility's calendar; the configured offset when absent
    pub tz_offset_minutes: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub tz_offset_minutes: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct SubjectHistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TodayResponse {
    #[serde(flatten)]
    pub summary: TodaySummary,
    pub poll_interval_secs: u64,
}

fn parse_offset(minutes: Option<i32>) -> Result<Option<FixedOffset>> {
    minutes
        .map(|m| {
            m.checked_mul(60)
                .and_then(FixedOffset::east_opt)
                .ok_or_else(|| {
                    AppError::Validation(format!("tzOffsetMinutes out of range: {}", m))
                })
        })
        .transpose()
}

// Handlers

/// Check a subject in or out
async fn attendance_action(
    State(state): State<AppState>,
    Path(facility_id): Path<Uuid>,
    Json(req): Json<AttendanceActionRequest>,
) -> Result<(StatusCode, Json<AttendanceRecord>)> {
    match req.action {
        AttendanceAction::CheckIn => {
            let record = state
                .attendance
                .check_in(CheckInRequest {
                    subject_id: req.subject_id,
                    subject_kind: req.subject_kind,
                    facility_id,
                    source: req.source,
                })
                .await?;

            Ok((StatusCode::CREATED, Json(record)))
        }
        AttendanceAction::CheckOut => {
            let record = state
                .attendance
                .check_out(req.subject_id, facility_id)
                .await?;

            Ok((StatusCode::OK, Json(record)))
        }
    }
}

/// Check in from a scanned facility QR code
async fn qr_check_in(
    State(state): State<AppState>,
    Path(facility_id): Path<Uuid>,
    Json(req): Json<QrCheckInRequest>,
) -> Result<(StatusCode, Json<AttendanceRecord>)> {
    let record = state
        .attendance
        .check_in_with_qr(facility_id, &req.token, req.subject_id, req.subject_kind)
        .await?;

    Ok((StatusCode::CREATED, Json(record)))
}

/// The facility's current check-in QR code as SVG
async fn facility_qr_code(
    State(state): State<AppState>,
    Path(facility_id): Path<Uuid>,
) -> Result<Response> {
    let token = state.attendance.issue_qr_token(facility_id)?;
    let svg = qr_checkin::render_svg(&token).map_err(|e: QrTokenError| {
        AppError::Internal(anyhow::anyhow!("QR rendering failed: {}", e))
    })?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/svg+xml"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        svg,
    )
        .into_response())
}

/// Today's list and counts for a facility
async fn today(
    State(state): State<AppState>,
    Path(facility_id): Path<Uuid>,
    Query(params): Query<TodayQuery>,
) -> Result<Json<TodayResponse>> {
    let offset = parse_offset(params.tz_offset_minutes)?;
    let window = state.attendance.day_window(params.date, offset)?;
    let summary = state.attendance.today_summary(facility_id, &window).await?;

    Ok(Json(TodayResponse {
        summary,
        poll_interval_secs: POLL_INTERVAL_SECS,
    }))
}

/// Daily check-in counts for charting
async fn history(
    State(state): State<AppState>,
    Path(facility_id): Path<Uuid>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<Vec<DailyCheckins>>> {
    let offset = parse_offset(params.tz_offset_minutes)?;
    let today = state.attendance.day_window(None, offset)?.date;

    let range = match (params.from, params.to) {
        (Some(from), Some(to)) => DayRange::new(from, to),
        (Some(from), None) => DayRange::new(from, today),
        (None, Some(to)) => DayRange::ending_on(to, DEFAULT_HISTORY_DAYS),
        (None, None) => DayRange::ending_on(today, DEFAULT_HISTORY_DAYS),
    }
    .map_err(AttendanceError::from)?;

    let days = state.attendance.history(facility_id, &range, offset).await?;

    Ok(Json(days))
}

/// One subject's visits to a facility, newest first
async fn subject_attendance(
    State(state): State<AppState>,
    Path((facility_id, subject_id)): Path<(Uuid, Uuid)>,
    Query(params): Query<SubjectHistoryQuery>,
) -> Result<Json<Vec<AttendanceRecord>>> {
    let limit = params.limit.unwrap_or(DEFAULT_SUBJECT_LIMIT);
    if !(1..=MAX_SUBJECT_LIMIT).contains(&limit) {
        return Err(AppError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_SUBJECT_LIMIT
        )));
    }

    let records = state
        .attendance
        .subject_history(subject_id, facility_id, limit)
        .await?;

    Ok(Json(records))
}

/// Run the auto-checkout sweep now
async fn trigger_auto_checkout(State(state): State<AppState>) -> Result<Json<AutoCheckoutStats>> {
    let stats = state.attendance.run_auto_checkout().await?;

    tracing::info!(?stats, "Auto-checkout triggered over HTTP");

    Ok(Json(stats))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/facilities/:facility_id/attendance",
            post(attendance_action),
        )
        .route(
            "/api/facilities/:facility_id/attendance/qr",
            get(facility_qr_code).post(qr_check_in),
        )
        .route("/api/facilities/:facility_id/attendance/today", get(today))
        .route(
            "/api/facilities/:facility_id/attendance/history",
            get(history),
        )
        .route(
            "/api/facilities/:facility_id/subjects/:subject_id/attendance",
            get(subject_attendance),
        )
        .route("/api/attendance/auto-checkout", post(trigger_auto_checkout))
}
