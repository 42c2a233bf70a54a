// API module - HTTP endpoints

use axum::{routing::get, Router};

use crate::services::attendance::AttendanceService;

pub mod attendance;
pub mod health;

/// Application state shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub attendance: AttendanceService,
}

/// Every route the service exposes
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health_check))
        .merge(attendance::router())
}
