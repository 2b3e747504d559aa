use std::time::Instant;
use serde::{Deserialize, Serialize};

use super::telemetry::Telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RobotStatus {
    Idle,
    Moving,
    Charging,
    Manual,
    Error,
    Disconnected,
}

/// Sekundäre Zustandsmaschine für Puffer-Einfahrt/-Ausfahrt, unabhängig
/// von den Task-Steps (Hub an der Vorstaging-Station, Transit, Absetzen).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotPhase {
    EntryLiftUp,
    EntryTravel,
    EntryLiftDown,
    ExitLiftUp,
    ExitTravel,
    ExitLiftDown,
}

/// Live-Eintrag der Roboter-Tabelle. Wird durch die Telemetrie-Aufnahme
/// und durch Executor/Dispatcher beim Absetzen von Fahrbefehlen mutiert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Robot {
    pub id: String,
    pub name: String,
    /// IP des Fahrzeugs für den Kommando-Kanal.
    pub address: String,
    pub status: RobotStatus,
    pub battery: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_station_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_station_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<RobotPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_target_id: Option<String>,
    pub telemetry: Telemetry,

    #[serde(skip, default = "Instant::now")]
    pub last_seen: Instant,
}

impl Robot {
    pub fn new(id: &str, name: &str, address: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            address: address.to_string(),
            status: RobotStatus::Disconnected,
            battery: 0.0,
            location_station_id: None,
            destination_station_id: None,
            phase: None,
            buffer_target_id: None,
            telemetry: Telemetry::default(),
            last_seen: Instant::now(),
        }
    }

    pub fn is_at(&self, station_id: &str) -> bool {
        self.location_station_id.as_deref() == Some(station_id)
    }
}
