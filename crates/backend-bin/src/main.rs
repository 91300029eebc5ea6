use backend_lib::auth::StaticTokens;
use backend_lib::config::Settings;
use backend_lib::directory::{InMemoryDirectory, InMemoryNotificationLog, RecordingPushSender};
use backend_lib::scheduler::{spawn_daily_sweeps, spawn_status_sweeps, StatusScheduler};
use backend_lib::{location, ws_router, AppState};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    // The directory seams default to the in-memory implementations; a
    // deployment swaps in the database-backed collaborators here.
    let directory = Arc::new(InMemoryDirectory::new());
    let log = Arc::new(InMemoryNotificationLog::new());
    let push = Arc::new(RecordingPushSender::new());
    let tokens = Arc::new(StaticTokens::new());

    let state = Arc::new(AppState::new(
        settings.clone(),
        directory.clone(),
        directory.clone(),
        log,
        push,
        tokens,
    ));

    // Background sweeps: trip status, daily housekeeping, track expiry.
    let scheduler = Arc::new(StatusScheduler::new(directory.clone(), directory.clone()));
    spawn_status_sweeps(scheduler.clone(), Duration::from_secs(settings.status_sweep_secs));
    spawn_daily_sweeps(scheduler, Duration::from_secs(settings.daily_sweep_secs));
    location::spawn_expiry_sweep(
        state.locations.clone(),
        Duration::from_secs(settings.expiry_sweep_secs),
    );

    let app = ws_router::create_router(state);

    let listener = TcpListener::bind(settings.bind_addr).await?;
    info!(addr = %settings.bind_addr, "listening");

    axum::serve(listener, app).await?;

    Ok(())
}
