use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use amr_fleet_backend::core::config::{ConfigManager, Settings};
use amr_fleet_backend::hardware::{Gateway, TcpMotionAdapter};
use amr_fleet_backend::managers::{system_api, task_manager, Dispatcher, Executor};
use amr_fleet_backend::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,amr_fleet_backend=debug".into()),
        )
        .init();

    info!("🚀 AMR-Leitsystem startet...");

    let settings = Settings::load()?;
    let map_data = ConfigManager::new().load_map();

    let motion = Arc::new(TcpMotionAdapter::new(
        settings.motion_port,
        Duration::from_millis(settings.motion_timeout_ms),
    ));
    let state = AppState::new(settings, map_data, motion);

    // Gateway -> Dispatcher: Register-Flanken als Events.
    let (signal_tx, signal_rx) = mpsc::channel(64);
    Gateway::new(Arc::clone(&state), signal_tx).spawn_all();
    tokio::spawn(Dispatcher::new(Arc::clone(&state), signal_rx).run());

    // Scheduler-Kern.
    tokio::spawn(Executor::new(Arc::clone(&state)).run());

    // Watchdog: Fahrzeuge ohne frische Telemetrie als getrennt markieren.
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                state.robots.mark_stale(state.settings.stale_after_secs).await;
            }
        });
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        // Task-Steuerung
        .route("/api/tasks", post(task_manager::api_create_task).get(task_manager::api_list_tasks))
        .route("/api/tasks/:task_id", get(task_manager::api_get_task))
        .route("/api/tasks/:task_id/pause", post(task_manager::api_pause_task))
        .route("/api/tasks/:task_id/resume", post(task_manager::api_resume_task))
        .route("/api/tasks/:task_id/cancel", post(task_manager::api_cancel_task))
        .route("/api/robots/:robot_id/task", get(task_manager::api_current_task))
        .route("/api/dispatch", post(task_manager::api_manual_dispatch))
        // Telemetrie & Status
        .route("/api/telemetry", post(system_api::api_telemetry))
        .route("/api/robots", get(system_api::api_robots))
        .route("/api/stations", get(system_api::api_stations))
        .route("/api/logs", get(system_api::api_logs))
        .route("/api/health", get(system_api::api_health))
        .layer(cors)
        .with_state(Arc::clone(&state));

    let addr = format!("{}:{}", state.settings.http_host, state.settings.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("✅ HTTP-API lauscht auf {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
