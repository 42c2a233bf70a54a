use anyhow::Context;
use chrono::Duration;
use secrecy::ExposeSecret;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gymdesk_attendance::api::{self, AppState};
use gymdesk_attendance::config::Config;
use gymdesk_attendance::db::{self, AttendanceStore, MemoryAttendanceStore, PgAttendanceStore};
use gymdesk_attendance::jobs::auto_checkout;
use gymdesk_attendance::services::attendance::AttendanceService;
use gymdesk_attendance::services::clock::SystemClock;
use gymdesk_attendance::services::qr_checkin::QrSigner;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gymdesk_attendance=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting attendance server...");

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    let store: Arc<dyn AttendanceStore> = match &config.database_url {
        Some(database_url) => {
            let pool = db::create_pool(database_url).await?;
            tracing::info!("Database pool created");

            db::run_migrations(&pool).await?;
            tracing::info!("Database migrations completed");

            Arc::new(PgAttendanceStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, attendance records are kept in memory only");
            Arc::new(MemoryAttendanceStore::new())
        }
    };

    let day_offset = config
        .facility_offset()
        .context("facility_utc_offset_minutes out of range")?;
    let qr = QrSigner::new(
        config.qr_signing_key.expose_secret().as_bytes(),
        Duration::seconds(config.qr_token_ttl_secs),
    );
    let attendance = AttendanceService::new(
        store,
        Arc::new(SystemClock),
        qr,
        day_offset,
        config.auto_checkout_batch_size,
    );

    // Keep the scheduler alive for the lifetime of the server
    let mut scheduler =
        auto_checkout::start_scheduler(attendance.clone(), &config.auto_checkout_cron).await?;

    let state = AppState { attendance };

    let mut app = api::router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    if config.cors_allow_any {
        app = app.layer(CorsLayer::permissive());
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid HOST/PORT")?;
    tracing::info!("Listening on {}", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!(error = ?e, "Scheduler did not shut down cleanly");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install CTRL+C signal handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, cleaning up...");
}
