use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::core::types::{ConnectionStatus, RobotStatus};
use crate::managers::robot_manager::TelemetryUpdate;
use crate::AppState;

#[derive(Serialize)]
pub struct DeviceHealth {
    pub id: String,
    pub status: ConnectionStatus,
    pub last_seen_secs: Option<u64>,
}

#[derive(Serialize)]
pub struct RobotHealth {
    pub id: String,
    pub name: String,
    pub status: RobotStatus,
    pub connected: bool,
    pub battery: f64,
    pub location_station_id: Option<String>,
}

#[derive(Serialize)]
pub struct HealthReport {
    pub uptime_secs: u64,
    pub alarm: bool,
    pub devices: Vec<DeviceHealth>,
    pub robots: Vec<RobotHealth>,
}

/// Verbindungs-Frische aller Geräte und Fahrzeuge plus globales
/// Alarm-Flag. "Verbunden" heißt: letzter Kontakt jünger als die
/// Schwelle.
pub async fn api_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let device_statuses = state.registers.statuses().await;
    let mut devices: Vec<DeviceHealth> = device_statuses
        .into_iter()
        .map(|(id, (status, age))| DeviceHealth { id, status, last_seen_secs: age })
        .collect();
    devices.sort_by(|a, b| a.id.cmp(&b.id));

    let robots = state
        .robots
        .all()
        .await
        .into_iter()
        .map(|r| RobotHealth {
            connected: r.status != RobotStatus::Disconnected,
            id: r.id,
            name: r.name,
            status: r.status,
            battery: r.battery,
            location_station_id: r.location_station_id,
        })
        .collect();

    Json(HealthReport {
        uptime_secs: state.started_at.elapsed().as_secs(),
        alarm: state.pause_alarm.load(Ordering::SeqCst),
        devices,
        robots,
    })
}

pub async fn api_robots(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.robots.all().await)
}

pub async fn api_stations(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.map.all().to_vec())
}

pub async fn api_logs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.events.snapshot().await)
}

/// Telemetrie-Einspeisung (Fahrzeug-Link oder Simulator).
pub async fn api_telemetry(
    State(state): State<Arc<AppState>>,
    Json(update): Json<TelemetryUpdate>,
) -> impl IntoResponse {
    if state.robots.get(&update.robot_id).await.is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("Unbekanntes Fahrzeug '{}'", update.robot_id) })),
        )
            .into_response();
    }
    state.robots.ingest(update).await;
    StatusCode::NO_CONTENT.into_response()
}
