use std::collections::HashMap;
use std::time::Instant;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::core::config::{RobotSeed, Settings};
use crate::core::types::{Region, Robot, RobotPhase, RobotStatus, Telemetry};
use crate::managers::map_manager::MapManager;

/// Eingehender Telemetrie-Datensatz vom Fahrzeug-Link.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryUpdate {
    pub robot_id: String,
    #[serde(default)]
    pub status: Option<RobotStatus>,
    #[serde(default)]
    pub location_station_id: Option<String>,
    #[serde(default)]
    pub telemetry: Option<Telemetry>,
}

/// Live-Tabelle der Flotte. Einziger Schreiber für Positions-/Status-
/// Daten ist die Telemetrie-Aufnahme; Executor und Dispatcher setzen
/// nur Ziel und Phase, wenn sie Befehle absetzen.
pub struct RobotManager {
    pub robots: RwLock<HashMap<String, Robot>>,
}

impl RobotManager {
    pub fn new(seeds: &[RobotSeed]) -> Self {
        let mut robots = HashMap::new();
        for seed in seeds {
            robots.insert(seed.id.clone(), Robot::new(&seed.id, &seed.name, &seed.address));
        }
        info!("🤖 Roboter-Registry bereit: {} Fahrzeuge.", robots.len());
        Self { robots: RwLock::new(robots) }
    }

    // --- TELEMETRIE-AUFNAHME ---

    pub async fn ingest(&self, update: TelemetryUpdate) {
        let mut robots = self.robots.write().await;
        let Some(robot) = robots.get_mut(&update.robot_id) else {
            warn!("⚠️ Telemetrie für unbekanntes Fahrzeug '{}' ignoriert.", update.robot_id);
            return;
        };

        if let Some(status) = update.status {
            robot.status = status;
        }
        if update.location_station_id.is_some() {
            robot.location_station_id = update.location_station_id;
        }
        if let Some(telemetry) = update.telemetry {
            if let Some(battery) = telemetry.battery {
                robot.battery = battery;
            }
            robot.telemetry = telemetry;
        }
        robot.last_seen = Instant::now();
    }

    // --- LESEZUGRIFFE ---

    pub async fn get(&self, id: &str) -> Option<Robot> {
        self.robots.read().await.get(id).cloned()
    }

    pub async fn by_name(&self, name: &str) -> Option<Robot> {
        self.robots.read().await.values().find(|r| r.name == name).cloned()
    }

    pub async fn all(&self) -> Vec<Robot> {
        let mut list: Vec<Robot> = self.robots.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn robot_at(&self, station_id: &str) -> Option<Robot> {
        self.robots.read().await.values().find(|r| r.is_at(station_id)).cloned()
    }

    pub async fn station_occupied(&self, station_id: &str, exclude: Option<&str>) -> bool {
        self.robots.read().await.values().any(|r| {
            r.is_at(station_id) && exclude.map_or(true, |ex| r.id != ex)
        })
    }

    /// Fährt in der Region gerade ein anderes Fahrzeug? Grundlage der
    /// "ein aktiver Mover pro Region"-Bremse vor NAV-Steps.
    pub async fn other_moving_in_region(&self, region: Region, exclude: &str, map: &MapManager) -> bool {
        self.robots.read().await.values().any(|r| {
            r.id != exclude
                && r.status == RobotStatus::Moving
                && r.location_station_id
                    .as_deref()
                    .and_then(|s| map.region_of(s))
                    == Some(region)
        })
    }

    pub async fn ids_in_region(&self, region: Region, map: &MapManager) -> Vec<String> {
        self.robots.read().await.values()
            .filter(|r| {
                r.location_station_id.as_deref().and_then(|s| map.region_of(s)) == Some(region)
            })
            .map(|r| r.id.clone())
            .collect()
    }

    // --- ABGELEITETE SIGNALE ---

    /// Handbetrieb-Bit aus der DI-Leiste (true = Steps anhalten).
    pub async fn manual_mode(&self, id: &str, settings: &Settings) -> bool {
        let robots = self.robots.read().await;
        robots
            .get(id)
            .and_then(|r| r.telemetry.digital_input(settings.manual_mode_di))
            .unwrap_or(false)
    }

    /// Beide Ladungs-Sensoren melden Kontakt?
    pub async fn payload_present(&self, id: &str, settings: &Settings) -> bool {
        let robots = self.robots.read().await;
        let Some(robot) = robots.get(id) else { return false };
        settings
            .payload_sensor_di
            .iter()
            .all(|&di| robot.telemetry.digital_input(di).unwrap_or(false))
    }

    // --- MUTATIONEN DURCH EXECUTOR/DISPATCHER ---

    pub async fn set_destination(&self, id: &str, destination: Option<String>) {
        if let Some(robot) = self.robots.write().await.get_mut(id) {
            robot.destination_station_id = destination;
        }
    }

    pub async fn set_phase(&self, id: &str, phase: Option<RobotPhase>, buffer_target: Option<String>) {
        if let Some(robot) = self.robots.write().await.get_mut(id) {
            robot.phase = phase;
            robot.buffer_target_id = buffer_target;
        }
    }

    pub async fn set_status(&self, id: &str, status: RobotStatus) {
        if let Some(robot) = self.robots.write().await.get_mut(id) {
            robot.status = status;
        }
    }

    // --- WATCHDOG ---

    /// Markiert Fahrzeuge ohne frische Telemetrie als getrennt.
    pub async fn mark_stale(&self, stale_after_secs: u64) -> usize {
        let mut robots = self.robots.write().await;
        let now = Instant::now();
        let mut changed = 0;

        for robot in robots.values_mut() {
            let elapsed = now.duration_since(robot.last_seen).as_secs();
            if elapsed > stale_after_secs && robot.status != RobotStatus::Disconnected {
                warn!("⚠️ WATCHDOG: Fahrzeug '{}' ist jetzt getrennt (letzter Kontakt vor {}s)", robot.id, elapsed);
                robot.status = RobotStatus::Disconnected;
                changed += 1;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::MapData;

    fn seeds() -> Vec<RobotSeed> {
        vec![
            RobotSeed { id: "amr-1".into(), name: "AMR-1".into(), address: "127.0.0.1".into() },
            RobotSeed { id: "amr-2".into(), name: "AMR-2".into(), address: "127.0.0.2".into() },
        ]
    }

    fn update(robot_id: &str, status: RobotStatus, station: &str) -> TelemetryUpdate {
        TelemetryUpdate {
            robot_id: robot_id.into(),
            status: Some(status),
            location_station_id: Some(station.into()),
            telemetry: None,
        }
    }

    #[tokio::test]
    async fn ingest_updates_position_and_freshness() {
        let rm = RobotManager::new(&seeds());
        rm.ingest(update("amr-1", RobotStatus::Idle, "9")).await;

        let r = rm.get("amr-1").await.unwrap();
        assert_eq!(r.status, RobotStatus::Idle);
        assert!(r.is_at("9"));
        assert!(rm.station_occupied("9", None).await);
        assert!(!rm.station_occupied("9", Some("amr-1")).await);
    }

    #[tokio::test]
    async fn region_mover_scan_ignores_self_and_other_region() {
        let map = MapManager::new(&MapData::default());
        let rm = RobotManager::new(&seeds());
        // amr-1 fährt in B, amr-2 steht in A
        rm.ingest(update("amr-1", RobotStatus::Moving, "9")).await;
        rm.ingest(update("amr-2", RobotStatus::Idle, "1")).await;

        assert!(rm.other_moving_in_region(Region::B, "amr-2", &map).await);
        assert!(!rm.other_moving_in_region(Region::B, "amr-1", &map).await);
        assert!(!rm.other_moving_in_region(Region::A, "amr-1", &map).await);
    }

    #[tokio::test]
    async fn manual_and_payload_bits_from_di_array() {
        let settings = Settings::default();
        let rm = RobotManager::new(&seeds());

        let mut di = vec![false; 16];
        di[settings.manual_mode_di] = true;
        di[settings.payload_sensor_di[0]] = true;
        di[settings.payload_sensor_di[1]] = true;

        rm.ingest(TelemetryUpdate {
            robot_id: "amr-1".into(),
            status: None,
            location_station_id: None,
            telemetry: Some(Telemetry { digital_inputs: Some(di), ..Default::default() }),
        })
        .await;

        assert!(rm.manual_mode("amr-1", &settings).await);
        assert!(rm.payload_present("amr-1", &settings).await);
        assert!(!rm.payload_present("amr-2", &settings).await);
    }

    #[tokio::test]
    async fn watchdog_marks_stale_robots() {
        let rm = RobotManager::new(&seeds());
        rm.ingest(update("amr-1", RobotStatus::Idle, "9")).await;
        // stale_after = 0 -> nichts ist frisch genug
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let changed = rm.mark_stale(0).await;
        assert!(changed >= 1);
        assert_eq!(rm.get("amr-1").await.unwrap().status, RobotStatus::Disconnected);
    }
}
