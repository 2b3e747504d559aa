use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::types::{
    Region, Robot, RobotStatus, Station, StepDraft, StepKind, StepPayload,
};
use crate::AppState;

/// Merker für Kreuzungs-Wünsche, die gerade nicht erfüllbar sind
/// (Zielregion voll). Wird jeden Scheduler-Tick erneut versucht, bis
/// erfüllt oder vom nächsten Task des Fahrzeugs überholt.
pub struct PendingRetryQueue {
    inner: Mutex<HashMap<String, String>>,
}

impl PendingRetryQueue {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    pub async fn push(&self, robot_id: &str, destination_id: &str) {
        self.inner.lock().await.insert(robot_id.to_string(), destination_id.to_string());
    }

    pub async fn remove(&self, robot_id: &str) {
        self.inner.lock().await.remove(robot_id);
    }

    pub async fn snapshot(&self) -> Vec<(String, String)> {
        self.inner.lock().await.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

impl Default for PendingRetryQueue {
    fn default() -> Self {
        Self::new()
    }
}

// --- BELEGUNGS-URTEILE ---

/// Belegt-Urteil mit Register-Vorrang: liegt für die Station ein
/// lesbares Belegt-Flag vor, schlägt es veraltete Positionsdaten.
pub async fn station_occupied(state: &AppState, station: &Station, exclude_robot: Option<&str>) -> bool {
    match state.registers.buffer_occupied(&station.id).await {
        Some(occupied) => occupied,
        None => state.robots.station_occupied(&station.id, exclude_robot).await,
    }
}

/// Frei und von keinem anderen Task angefahren?
pub async fn station_free_for(state: &AppState, station: &Station, robot_id: &str) -> bool {
    !station_occupied(state, station, Some(robot_id)).await
        && !state.tasks.destination_targeted(&station.id, robot_id).await
}

/// Belegt-Urteil für die Platz-Suche: ein Kandidat gilt nur als frei,
/// wenn weder die Live-Position noch ein lesbares Belegt-Flag dagegen
/// sprechen. Der Register-Vorrang aus `station_occupied` greift erst
/// bei der erneuten Prüfung direkt am Platz.
pub async fn station_occupied_strict(
    state: &AppState,
    station: &Station,
    exclude_robot: Option<&str>,
) -> bool {
    if state.robots.station_occupied(&station.id, exclude_robot).await {
        return true;
    }
    matches!(state.registers.buffer_occupied(&station.id).await, Some(true))
}

async fn free_for_search(state: &AppState, station: &Station, robot_id: &str) -> bool {
    !station_occupied_strict(state, station, Some(robot_id)).await
        && !state.tasks.destination_targeted(&station.id, robot_id).await
}

// --- SUCHE ÜBER GETEILTE RESSOURCEN ---

pub async fn find_empty_buffer(
    state: &AppState,
    region: Region,
    robot_id: &str,
    exclude: &[&str],
) -> Option<Station> {
    for buffer in state.map.buffers(region) {
        if exclude.contains(&buffer.id.as_str()) {
            continue;
        }
        if free_for_search(state, buffer, robot_id).await {
            return Some(buffer.clone());
        }
    }
    None
}

pub async fn find_empty_charge(state: &AppState, region: Region, robot_id: &str) -> Option<Station> {
    for charge in state.map.charge_stations(region) {
        if free_for_search(state, charge, robot_id).await {
            return Some(charge.clone());
        }
    }
    None
}

/// Hat die Region überhaupt noch einen freien Puffer? Grundlage der
/// Freigabe-Prüfung für die designierten Kreuzungs-Routen.
pub async fn region_has_empty_buffer(state: &AppState, region: Region) -> bool {
    for buffer in state.map.buffers(region) {
        if !station_occupied_strict(state, buffer, None).await {
            return true;
        }
    }
    false
}

// --- ABRUF-KANDIDATEN ---

/// Kandidaten-Auswahl an Ladestationen: ab zwei Kandidaten gewinnt der
/// volleste Akku; bei genau einem nur, wenn der Akku hoch genug ist.
pub async fn select_charge_donor(state: &AppState, region: Region) -> Option<Robot> {
    let mut candidates = Vec::new();
    for charge in state.map.charge_stations(region) {
        if let Some(robot) = state.robots.robot_at(&charge.id).await {
            if !matches!(robot.status, RobotStatus::Idle | RobotStatus::Charging) {
                continue;
            }
            if state.tasks.active_task_for(&robot.id).await.is_some() {
                continue;
            }
            if robot.battery >= state.settings.battery_call_min {
                candidates.push(robot);
            }
        }
    }

    match candidates.len() {
        0 => None,
        1 => {
            let only = candidates.pop().unwrap();
            (only.battery >= state.settings.battery_call_high).then_some(only)
        }
        _ => candidates.into_iter().max_by(|a, b| {
            a.battery.partial_cmp(&b.battery).unwrap_or(std::cmp::Ordering::Equal)
        }),
    }
}

// --- KREUZUNGS-PROTOKOLL ---

/// Abschluss einer Querung: Suche in der Zielregion oder festes Ziel.
pub enum CrossingGoal {
    BufferSearch,
    ChargeSearch,
    Station(String),
}

/// Baut die Querungs-Sequenz Region -> Region: eigene Übergabestation,
/// Korridor-Freigabe, Mittelpunkt, Übergabestation der Gegenseite,
/// danach das Ziel. Der Korridor wird nie stehend belegt; blockiert er,
/// weicht WAIT_FREE_PATH auf die Wartestation aus.
pub fn crossing_template(state: &AppState, from: Region, goal: CrossingGoal) -> Option<Vec<StepDraft>> {
    let own_ix = state.map.interchange(from)?;
    let far_ix = state.map.interchange(from.other())?;
    let mid = state.map.midpoint()?;

    let mut steps = vec![
        StepDraft::nav(&own_ix.id),
        StepDraft::new(StepKind::WaitFreePath, StepPayload::target(&far_ix.id)),
        StepDraft::nav(&mid.id),
        StepDraft::nav(&far_ix.id),
    ];

    match goal {
        CrossingGoal::BufferSearch => {
            steps.push(StepDraft::new(StepKind::FindEmptyBBuffer, StepPayload::default()))
        }
        CrossingGoal::ChargeSearch => {
            steps.push(StepDraft::new(StepKind::FindEmptyBCharge, StepPayload::default()))
        }
        CrossingGoal::Station(id) => steps.push(StepDraft::nav(&id)),
    }

    debug!("🧭 Querungs-Sequenz {} -> {} mit {} Steps.", from, from.other(), steps.len());
    Some(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;
    use crate::core::types::StepKind;
    use crate::managers::robot_manager::TelemetryUpdate;

    #[tokio::test]
    async fn pending_queue_supersedes_older_wish() {
        let q = PendingRetryQueue::new();
        q.push("amr-1", "15").await;
        q.push("amr-1", "4").await;
        let snap = q.snapshot().await;
        assert_eq!(snap, vec![("amr-1".to_string(), "4".to_string())]);
        q.remove("amr-1").await;
        assert!(q.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn register_beats_stale_robot_position() {
        let state = test_state().await;
        let b1 = state.map.by_name("B1").unwrap().clone();

        // Kein Roboter dort, aber Register meldet belegt.
        let mut values = vec![0u16; 32];
        values[20] = 1;
        state.registers.update_snapshot("io-b", values).await;
        assert!(station_occupied(&state, &b1, None).await);

        // Register meldet frei, obwohl laut (veralteter) Position ein
        // Roboter dort steht -> Register gewinnt.
        state.robots.ingest(TelemetryUpdate {
            robot_id: "amr-1".into(),
            status: None,
            location_station_id: Some(b1.id.clone()),
            telemetry: None,
        }).await;
        state.registers.update_snapshot("io-b", vec![0u16; 32]).await;
        assert!(!station_occupied(&state, &b1, None).await);
    }

    #[tokio::test]
    async fn search_skips_buffer_with_live_occupant_despite_clear_flag() {
        let state = test_state().await;
        let b1 = state.map.by_name("B1").unwrap().clone();

        // Register meldet alle Plätze frei, aber auf B1 steht ein
        // Fahrzeug: für die Suche zählen Position UND Register.
        state.registers.update_snapshot("io-b", vec![0u16; 32]).await;
        state.robots.ingest(TelemetryUpdate {
            robot_id: "amr-2".into(),
            status: Some(RobotStatus::Idle),
            location_station_id: Some(b1.id.clone()),
            telemetry: None,
        }).await;

        let found = find_empty_buffer(&state, Region::B, "amr-1", &[]).await.unwrap();
        assert_ne!(found.id, b1.id);
        assert!(station_occupied_strict(&state, &b1, None).await);

        // Die Nachprüfung direkt am Platz vertraut weiter dem Register.
        assert!(!station_occupied(&state, &b1, None).await);
    }

    #[tokio::test]
    async fn charge_donor_rule_two_vs_one() {
        let state = test_state().await;
        let bc1 = state.map.by_name("BC1").unwrap().id.clone();
        let bc2 = state.map.by_name("BC2").unwrap().id.clone();

        // Genau ein Kandidat mit mittlerem Akku: abgelehnt.
        state.robots.ingest(TelemetryUpdate {
            robot_id: "amr-1".into(),
            status: Some(RobotStatus::Charging),
            location_station_id: Some(bc1.clone()),
            telemetry: Some(serde_json::from_value(serde_json::json!({"battery": 55.0})).unwrap()),
        }).await;
        assert!(select_charge_donor(&state, Region::B).await.is_none());

        // Zweiter Kandidat: jetzt gewinnt der vollere Akku.
        state.robots.ingest(TelemetryUpdate {
            robot_id: "amr-2".into(),
            status: Some(RobotStatus::Charging),
            location_station_id: Some(bc2),
            telemetry: Some(serde_json::from_value(serde_json::json!({"battery": 81.0})).unwrap()),
        }).await;
        let donor = select_charge_donor(&state, Region::B).await.unwrap();
        assert_eq!(donor.id, "amr-2");
    }

    #[tokio::test]
    async fn crossing_template_shape() {
        let state = test_state().await;
        let steps = crossing_template(&state, Region::A, CrossingGoal::BufferSearch).unwrap();
        let kinds: Vec<StepKind> = steps.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![StepKind::Nav, StepKind::WaitFreePath, StepKind::Nav, StepKind::Nav, StepKind::FindEmptyBBuffer]
        );
        // Erste Station: eigene Übergabestation, nie der Korridor selbst.
        let ax = state.map.by_name("AX").unwrap();
        assert_eq!(steps[0].payload.target.as_deref(), Some(ax.id.as_str()));
        // WAIT_FREE_PATH kennt die Übergabestation der Gegenseite.
        let bx = state.map.by_name("BX").unwrap();
        assert_eq!(steps[1].payload.target.as_deref(), Some(bx.id.as_str()));
    }
}
