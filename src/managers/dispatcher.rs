use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::core::types::{
    Region, Robot, RobotStatus, Station, StationClass, StepDraft, StepKind, StepPayload,
};
use crate::managers::allocator::{self, CrossingGoal};
use crate::AppState;

/// Vom Gateway erkannte Register-Flanke, auf Stationsnamen aufgelöst.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    /// Abruf-Taster: ein Fahrzeug zur Zielstation holen.
    Call { device: String, target: String, source_hint: Option<String> },
    /// Transfer-Taster: Ladung von `from` nach `to` bringen.
    Transfer { device: String, from: String, to: String },
}

/// Übersetzt Flanken in Tasks. Jede Flanke wird genau einmal bewertet;
/// nicht erfüllbare Kreuzungs-Wünsche landen in der Wiedervorlage.
pub struct Dispatcher {
    state: Arc<AppState>,
    rx: mpsc::Receiver<SignalEvent>,
}

impl Dispatcher {
    pub fn new(state: Arc<AppState>, rx: mpsc::Receiver<SignalEvent>) -> Self {
        Self { state, rx }
    }

    pub async fn run(mut self) {
        info!("📡 Signal-Dispatcher aktiv.");
        while let Some(event) = self.rx.recv().await {
            match event {
                SignalEvent::Call { device, target, source_hint } => {
                    handle_call(&self.state, &device, &target, source_hint.as_deref()).await;
                }
                SignalEvent::Transfer { device, from, to } => {
                    handle_transfer(&self.state, &device, &from, &to).await;
                }
            }
        }
        warn!("📡 Signal-Dispatcher beendet (Kanal geschlossen).");
    }
}

/// Quittung ans Taster-Panel des Geräts einreihen.
async fn feedback(state: &AppState, device: &str, accepted: bool) {
    let Some(fb) = state
        .devices
        .iter()
        .find(|d| d.id == device)
        .and_then(|d| d.feedback.as_ref())
    else {
        return;
    };
    let index = if accepted { fb.success_index } else { fb.failure_index };
    state.registers.push_write(device, index, 1).await;
}

// --- TRANSFER-FLANKEN ---

pub async fn handle_transfer(state: &Arc<AppState>, device: &str, from_name: &str, to_name: &str) {
    match plan_transfer(state, from_name, to_name).await {
        Ok(task_id) => {
            state
                .events
                .push(format!("Transfer {} -> {}: Task {} angelegt.", from_name, to_name, task_id), "info")
                .await;
            feedback(state, device, true).await;
        }
        Err(reason) => {
            info!("📡 Transfer {} -> {} ignoriert: {}", from_name, to_name, reason);
            feedback(state, device, false).await;
        }
    }
}

async fn plan_transfer(state: &Arc<AppState>, from_name: &str, to_name: &str) -> Result<String, String> {
    let from = state
        .map
        .by_name(from_name)
        .cloned()
        .ok_or_else(|| format!("unbekannte Station '{}'", from_name))?;
    let to = state
        .map
        .by_name(to_name)
        .cloned()
        .ok_or_else(|| format!("unbekannte Station '{}'", to_name))?;

    let robot = state
        .robots
        .robot_at(&from.id)
        .await
        .ok_or_else(|| format!("kein Fahrzeug an {}", from.name))?;

    if state.tasks.active_task_for(&robot.id).await.is_some() {
        return Err(format!("{} hat bereits einen aktiven Task", robot.name));
    }
    if state.tasks.destination_targeted(&to.id, &robot.id).await {
        return Err(format!("{} wird bereits angefahren", to.name));
    }

    let from_region = robot
        .location_station_id
        .as_deref()
        .and_then(|s| state.map.region_of(s))
        .or_else(|| from.region());
    let to_region = to.region();

    let steps = match (from_region, to_region) {
        (Some(a), Some(b)) if a != b => {
            // Designierte Kreuzungs-Route: nur starten, wenn die
            // Zielregion noch einen freien Puffer hat.
            if !allocator::region_has_empty_buffer(state, b).await {
                state.pending.push(&robot.id, &to.id).await;
                return Err(format!("Region {} voll, Wunsch in Wiedervorlage", b));
            }
            allocator::crossing_template(state, a, CrossingGoal::BufferSearch)
                .ok_or_else(|| "Karte ohne Querungs-Stationen".to_string())?
        }
        _ => {
            if to.has_class(&StationClass::Junction)
                && allocator::station_occupied(state, &to, Some(&robot.id)).await
            {
                return Err(format!("{} ist belegt", to.name));
            }
            // Ladung am Puffer aufnehmen und zum Ziel bringen.
            vec![
                StepDraft::new(StepKind::JackUp, StepPayload::default()),
                StepDraft::nav(&to.id),
                StepDraft::new(StepKind::JackDown, StepPayload::default()),
            ]
        }
    };

    state
        .tasks
        .create(&robot.id, steps)
        .await
        .map(|t| t.id)
        .map_err(|e| e.to_string())
}

// --- ABRUF-FLANKEN ---

enum DonorPlace {
    Buffer(Station),
    Charge(Station),
    CrossBuffer(Station, Region),
}

pub async fn handle_call(state: &Arc<AppState>, device: &str, target_name: &str, source_hint: Option<&str>) {
    match plan_call(state, target_name, source_hint).await {
        Ok((task_id, robot_name)) => {
            state
                .events
                .push(format!("Abruf nach {}: {} kommt (Task {}).", target_name, robot_name, task_id), "info")
                .await;
            feedback(state, device, true).await;
        }
        Err(reason) => {
            info!("📡 Abruf nach {} ignoriert: {}", target_name, reason);
            feedback(state, device, false).await;
        }
    }
}

async fn plan_call(
    state: &Arc<AppState>,
    target_name: &str,
    source_hint: Option<&str>,
) -> Result<(String, String), String> {
    let target = state
        .map
        .by_name(target_name)
        .cloned()
        .ok_or_else(|| format!("unbekannte Station '{}'", target_name))?;
    let region = target
        .region()
        .ok_or_else(|| format!("Station '{}' ohne Region", target.name))?;

    if state.robots.robot_at(&target.id).await.is_some() {
        return Err(format!("an {} steht bereits ein Fahrzeug", target.name));
    }

    let (robot, place) = find_donor(state, region, &target, source_hint)
        .await
        .ok_or_else(|| "kein abrufbares Fahrzeug gefunden".to_string())?;

    if state.tasks.destination_targeted(&target.id, &robot.id).await {
        return Err(format!("{} wird bereits angefahren", target.name));
    }

    let steps = match place {
        DonorPlace::Buffer(buffer) => {
            let pre = state.map.pre_of(&buffer).map(|p| p.id.clone());
            vec![
                StepDraft::new(StepKind::JackDown, StepPayload::default()),
                StepDraft::nav_pre(pre.as_deref().unwrap_or(&buffer.id)),
                StepDraft::nav(&target.id),
            ]
        }
        DonorPlace::Charge(charge) => {
            let pre = state.map.pre_of(&charge).map(|p| p.id.clone());
            vec![
                StepDraft::nav_pre(pre.as_deref().unwrap_or(&charge.id)),
                StepDraft::nav(&target.id),
            ]
        }
        DonorPlace::CrossBuffer(buffer, donor_region) => {
            let pre = state.map.pre_of(&buffer).map(|p| p.id.clone());
            let mut steps = vec![
                StepDraft::new(StepKind::JackDown, StepPayload::default()),
                StepDraft::nav_pre(pre.as_deref().unwrap_or(&buffer.id)),
            ];
            steps.extend(
                allocator::crossing_template(
                    state,
                    donor_region,
                    CrossingGoal::Station(target.id.clone()),
                )
                .ok_or_else(|| "Karte ohne Querungs-Stationen".to_string())?,
            );
            steps
        }
    };

    let task = state.tasks.create(&robot.id, steps).await.map_err(|e| e.to_string())?;
    Ok((task.id, robot.name))
}

/// Spender-Suche in Prioritätsreihenfolge: implizite Quelle, Puffer der
/// Region, Ladestationen (Akku-Regel), Puffer der Gegenregion.
async fn find_donor(
    state: &Arc<AppState>,
    region: Region,
    target: &Station,
    source_hint: Option<&str>,
) -> Option<(Robot, DonorPlace)> {
    if let Some(hint) = source_hint {
        if let Some(station) = state.map.by_name(hint).cloned() {
            if let Some(robot) = idle_taskless_at(state, &station).await {
                return Some((robot, DonorPlace::Buffer(station)));
            }
        }
    }

    for buffer in state.map.buffers(region) {
        if buffer.id == target.id {
            continue;
        }
        if let Some(robot) = idle_taskless_at(state, buffer).await {
            return Some((robot, DonorPlace::Buffer(buffer.clone())));
        }
    }

    if let Some(robot) = allocator::select_charge_donor(state, region).await {
        if let Some(charge) = robot
            .location_station_id
            .as_deref()
            .and_then(|s| state.map.by_id(s))
            .cloned()
        {
            return Some((robot, DonorPlace::Charge(charge)));
        }
    }

    let far = region.other();
    for buffer in state.map.buffers(far) {
        if let Some(robot) = idle_taskless_at(state, buffer).await {
            return Some((robot, DonorPlace::CrossBuffer(buffer.clone(), far)));
        }
    }

    None
}

async fn idle_taskless_at(state: &Arc<AppState>, station: &Station) -> Option<Robot> {
    let robot = state.robots.robot_at(&station.id).await?;
    if robot.status != RobotStatus::Idle {
        return None;
    }
    if state.tasks.active_task_for(&robot.id).await.is_some() {
        return None;
    }
    Some(robot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StepKind;
    use crate::managers::robot_manager::TelemetryUpdate;
    use crate::test_support::test_state;

    async fn place(state: &AppState, robot: &str, station: &str, status: RobotStatus) {
        state
            .robots
            .ingest(TelemetryUpdate {
                robot_id: robot.into(),
                status: Some(status),
                location_station_id: Some(station.into()),
                telemetry: None,
            })
            .await;
    }

    #[tokio::test]
    async fn buffer_edge_creates_pickup_task_to_junction() {
        let state = test_state().await;
        place(&state, "amr-1", "9", RobotStatus::Idle).await; // B1

        handle_transfer(&state, "io-b", "B1", "B4").await;

        let task = state.tasks.active_task_for("amr-1").await.expect("Task angelegt");
        let steps = state.tasks.steps_of(&task.id).await;
        let first_nav = steps.iter().find(|s| s.kind == StepKind::Nav).unwrap();
        assert_eq!(first_nav.payload.target.as_deref(), Some("15"), "erster NAV-Step zielt auf B4");

        // Annahme quittiert.
        let writes = state.registers.drain_writes("io-b").await;
        assert!(writes.iter().any(|w| w.index == 14 && w.value == 1));
    }

    #[tokio::test]
    async fn edge_without_robot_at_source_is_ignored() {
        let state = test_state().await;
        handle_transfer(&state, "io-b", "B1", "B4").await;

        assert!(state.tasks.list().await.is_empty());
        let writes = state.registers.drain_writes("io-b").await;
        assert!(writes.iter().any(|w| w.index == 15 && w.value == 1), "Ablehnung quittiert");
    }

    #[tokio::test]
    async fn busy_robot_is_not_dispatched_twice() {
        let state = test_state().await;
        place(&state, "amr-1", "9", RobotStatus::Idle).await;
        state.tasks.create("amr-1", vec![StepDraft::nav("16")]).await.unwrap();

        handle_transfer(&state, "io-b", "B1", "B4").await;
        let tasks = state.tasks.list().await;
        assert_eq!(tasks.len(), 1, "keine zweite Task-Erzeugung");
    }

    #[tokio::test]
    async fn cross_edge_with_full_target_region_goes_to_retry_queue() {
        let state = test_state().await;
        place(&state, "amr-1", "4", RobotStatus::Idle).await; // A4

        // Alle drei B-Puffer melden belegt (Register 20/21/22 = 1).
        let mut values = vec![0u16; 32];
        values[20] = 1;
        values[21] = 1;
        values[22] = 1;
        state.registers.update_snapshot("io-b", values).await;

        handle_transfer(&state, "io-a", "A4", "B4").await;

        assert!(state.tasks.active_task_for("amr-1").await.is_none(), "Flanke ignoriert");
        assert_eq!(
            state.pending.snapshot().await,
            vec![("amr-1".to_string(), "15".to_string())]
        );
    }

    #[tokio::test]
    async fn cross_edge_creates_crossing_plan() {
        let state = test_state().await;
        place(&state, "amr-1", "4", RobotStatus::Idle).await; // A4, Region A

        handle_transfer(&state, "io-a", "A4", "B4").await;

        let task = state.tasks.active_task_for("amr-1").await.expect("Task angelegt");
        let kinds: Vec<StepKind> =
            state.tasks.steps_of(&task.id).await.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StepKind::Nav,
                StepKind::WaitFreePath,
                StepKind::Nav,
                StepKind::Nav,
                StepKind::FindEmptyBBuffer,
            ]
        );
    }

    #[tokio::test]
    async fn call_prefers_buffer_donor_over_charge() {
        let state = test_state().await;
        place(&state, "amr-1", "11", RobotStatus::Idle).await; // B2 (Puffer)
        place(&state, "amr-2", "17", RobotStatus::Charging).await; // BC1

        handle_call(&state, "io-b", "B4", None).await;

        let task = state.tasks.active_task_for("amr-1").await.expect("Puffer-Spender gewinnt");
        let kinds: Vec<StepKind> =
            state.tasks.steps_of(&task.id).await.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![StepKind::JackDown, StepKind::NavPre, StepKind::Nav]);
        assert!(state.tasks.active_task_for("amr-2").await.is_none());
    }

    #[tokio::test]
    async fn call_falls_back_to_high_battery_charge_donor() {
        let state = test_state().await;
        // Einziger Kandidat an der Ladestation, Akku über der Schwelle.
        state
            .robots
            .ingest(TelemetryUpdate {
                robot_id: "amr-1".into(),
                status: Some(RobotStatus::Charging),
                location_station_id: Some("17".into()), // BC1
                telemetry: Some(
                    serde_json::from_value(serde_json::json!({"battery": 90.0})).unwrap(),
                ),
            })
            .await;

        handle_call(&state, "io-b", "B4", None).await;

        let task = state.tasks.active_task_for("amr-1").await.expect("Lade-Spender akzeptiert");
        let kinds: Vec<StepKind> =
            state.tasks.steps_of(&task.id).await.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![StepKind::NavPre, StepKind::Nav]);
    }

    #[tokio::test]
    async fn call_without_any_donor_reports_failure() {
        let state = test_state().await;
        handle_call(&state, "io-b", "B4", None).await;

        assert!(state.tasks.list().await.is_empty());
        let writes = state.registers.drain_writes("io-b").await;
        assert!(writes.iter().any(|w| w.index == 15 && w.value == 1));
    }
}
