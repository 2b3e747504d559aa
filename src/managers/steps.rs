use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::core::types::{
    Region, Robot, RobotPhase, RobotStatus, StationClass, StepDraft, StepKind,
    StepPayload, Task, TaskStatus, TaskStep,
};
use crate::hardware::modbus::LinkError;
use crate::managers::allocator;
use crate::managers::executor::Executor;

/// Ergebnis eines Step-Durchlaufs. `NotYet` heißt: Bedingung nicht
/// erfüllt, nächster Tick versucht es erneut. `Interrupted` heißt: der
/// Task hat RUNNING verlassen, der Step bleibt offen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Finished,
    NotYet,
    Interrupted,
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error("Step ohne Zielstation")]
    MissingTarget,
    #[error("Step ohne Hubhöhe")]
    MissingHeight,
    #[error("Unbekannte Station '{0}'")]
    UnknownStation(String),
    #[error("Unbekanntes Fahrzeug '{0}'")]
    UnknownRobot(String),
    #[error("Zeitüberschreitung: {0}")]
    Timeout(String),
    #[error("Ladung nach Anheben nicht erkannt")]
    PayloadMissing,
    #[error("Planung nicht möglich: {0}")]
    Unplannable(String),
    #[error(transparent)]
    Link(#[from] LinkError),
}

impl StepError {
    /// Fatale Fehler überspringen das Retry-Budget und lassen den Task
    /// sofort fallen.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StepError::MissingTarget
                | StepError::MissingHeight
                | StepError::UnknownStation(_)
                | StepError::UnknownRobot(_)
                | StepError::PayloadMissing
                | StepError::Unplannable(_)
        )
    }
}

enum WaitVerdict {
    Ready,
    Interrupted,
    TimedOut,
}

impl Executor {
    pub(crate) async fn run_step(&self, task: &Task, step: &TaskStep) -> Result<StepOutcome, StepError> {
        match step.kind {
            StepKind::Nav => self.step_nav(task, step, false).await,
            StepKind::NavPre => self.step_nav(task, step, true).await,
            StepKind::JackUp | StepKind::JackDown | StepKind::Jack => {
                self.step_jack(task, step).await
            }
            StepKind::WaitFreePath => self.step_wait_free_path(task, step).await,
            StepKind::NavOrBuffer => self.step_nav_or_buffer(task, step).await,
            StepKind::CheckBufferBeforeNav | StepKind::CheckBufferWithoutCharging => {
                self.step_check_buffer(task, step).await
            }
            StepKind::CheckBatteryAfterBuffer => self.step_check_battery(task).await,
            StepKind::FindEmptyBBuffer => self.step_find_in_region(task, false).await,
            StepKind::FindEmptyBCharge => self.step_find_in_region(task, true).await,
        }
    }

    // --- GEMEINSAME BAUSTEINE ---

    async fn robot(&self, id: &str) -> Result<Robot, StepError> {
        self.state
            .robots
            .get(id)
            .await
            .ok_or_else(|| StepError::UnknownRobot(id.to_string()))
    }

    async fn task_running(&self, task_id: &str) -> bool {
        self.state.tasks.task_status(task_id).await == Some(TaskStatus::Running)
    }

    /// Pollt, bis das Fahrzeug an der Zielstation gemeldet ist. Bricht
    /// ab, sobald der Task RUNNING verlässt (Pause/Abbruch greifen
    /// innerhalb eines Poll-Intervalls).
    async fn wait_for_arrival(
        &self,
        task_id: &str,
        robot_id: &str,
        target: &str,
        limit: Duration,
    ) -> WaitVerdict {
        let poll = Duration::from_millis(self.state.settings.wait_poll_ms);
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if !self.task_running(task_id).await {
                return WaitVerdict::Interrupted;
            }
            if let Some(robot) = self.state.robots.get(robot_id).await {
                if robot.is_at(target) {
                    return WaitVerdict::Ready;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return WaitVerdict::TimedOut;
            }
            sleep(poll).await;
        }
    }

    /// Pollt, bis das Fahrzeug wieder IDLE meldet (Hub-Vorgang beendet).
    async fn wait_for_idle(&self, task_id: &str, robot_id: &str, limit: Duration) -> WaitVerdict {
        let poll = Duration::from_millis(self.state.settings.wait_poll_ms);
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if !self.task_running(task_id).await {
                return WaitVerdict::Interrupted;
            }
            if let Some(robot) = self.state.robots.get(robot_id).await {
                if robot.status == RobotStatus::Idle {
                    return WaitVerdict::Ready;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return WaitVerdict::TimedOut;
            }
            sleep(poll).await;
        }
    }

    // --- NAV / NAV_PRE ---

    async fn step_nav(&self, task: &Task, step: &TaskStep, pre: bool) -> Result<StepOutcome, StepError> {
        let target_id = step.payload.target.clone().ok_or(StepError::MissingTarget)?;
        let robot = self.robot(&task.robot_id).await?;

        if robot.is_at(&target_id) {
            self.state.robots.set_destination(&task.robot_id, None).await;
            if !pre {
                self.after_nav_arrival(&task.robot_id, &target_id).await;
            }
            return Ok(StepOutcome::Finished);
        }

        // Regionsbremse: ein fahrendes Fahrzeug pro Region. Querungen in
        // die andere Region sind ausgenommen.
        let from_region = robot
            .location_station_id
            .as_deref()
            .and_then(|s| self.state.map.region_of(s));
        let target_region = self.state.map.region_of(&target_id);
        let crossing = matches!((from_region, target_region), (Some(a), Some(b)) if a != b);
        if !crossing {
            if let Some(region) = from_region {
                if self
                    .state
                    .robots
                    .other_moving_in_region(region, &task.robot_id, &self.state.map)
                    .await
                {
                    return Ok(StepOutcome::NotYet);
                }
            }
        }

        if let Err(e) = self.state.motion.navigate(&robot, &target_id, &task.id).await {
            warn!("⚠️ NAV-Befehl an {} nicht zustellbar ({}), nächster Tick.", task.robot_id, e);
            return Ok(StepOutcome::NotYet);
        }
        self.state.robots.set_destination(&task.robot_id, Some(target_id.clone())).await;

        let limit = Duration::from_millis(self.state.settings.nav_timeout_ms);
        let verdict = self.wait_for_arrival(&task.id, &task.robot_id, &target_id, limit).await;
        self.state.robots.set_destination(&task.robot_id, None).await;
        match verdict {
            WaitVerdict::Ready => {}
            WaitVerdict::Interrupted => return Ok(StepOutcome::Interrupted),
            WaitVerdict::TimedOut => {
                return Err(StepError::Timeout(format!("NAV nach '{}'", target_id)))
            }
        }

        // Ausrollen lassen; Vorstaging bekommt eine längere Beruhigung.
        let settle = if pre {
            self.state.settings.settle_ms + self.state.settings.pre_settle_ms
        } else {
            self.state.settings.settle_ms
        };
        if settle > 0 {
            sleep(Duration::from_millis(settle)).await;
        }

        if !pre {
            self.after_nav_arrival(&task.robot_id, &target_id).await;
        }
        Ok(StepOutcome::Finished)
    }

    /// Phasen-Fortschritt nach Ankunft: steht das Fahrzeug jetzt auf
    /// seinem Einlagerungs-Puffer, folgt das Absenken.
    async fn after_nav_arrival(&self, robot_id: &str, target_id: &str) {
        if let Some(robot) = self.state.robots.get(robot_id).await {
            if robot.buffer_target_id.as_deref() == Some(target_id) {
                self.state
                    .robots
                    .set_phase(robot_id, Some(RobotPhase::EntryLiftDown), robot.buffer_target_id.clone())
                    .await;
            }
        }
    }

    // --- JACK ---

    async fn step_jack(&self, task: &Task, step: &TaskStep) -> Result<StepOutcome, StepError> {
        let height = match step.kind {
            StepKind::JackUp => self.state.settings.jack_up_height,
            StepKind::JackDown => 0.0,
            _ => step.payload.height.ok_or(StepError::MissingHeight)?,
        };
        let robot = self.robot(&task.robot_id).await?;

        // Hub-Befehl nur einmal pro Step absetzen. Nach einer
        // Unterbrechung wird nur noch auf Ruhe gewartet.
        let fresh = self.jack_inflight.lock().await.insert(step.id.clone());
        if fresh {
            if let Err(e) = self.state.motion.set_lift(&robot, height).await {
                self.jack_inflight.lock().await.remove(&step.id);
                warn!("⚠️ Hub-Befehl an {} nicht zustellbar ({}), nächster Tick.", task.robot_id, e);
                return Ok(StepOutcome::NotYet);
            }
        }

        let limit = Duration::from_millis(self.state.settings.jack_timeout_ms);
        let verdict = self.wait_for_idle(&task.id, &task.robot_id, limit).await;
        self.jack_inflight.lock().await.remove(&step.id);
        match verdict {
            WaitVerdict::Ready => {}
            WaitVerdict::Interrupted => return Ok(StepOutcome::Interrupted),
            WaitVerdict::TimedOut => return Err(StepError::Timeout("Hub-Vorgang".into())),
        }

        match step.kind {
            StepKind::JackUp => self.verify_payload_after_lift(task).await,
            StepKind::JackDown => {
                let robot = self.robot(&task.robot_id).await?;
                if robot.phase.is_some() {
                    self.state.robots.set_phase(&task.robot_id, None, None).await;
                }
                Ok(StepOutcome::Finished)
            }
            _ => Ok(StepOutcome::Finished),
        }
    }

    /// Ladungs-Sensorik nach dem Anheben: erst zweifach entprellt lesen,
    /// dann begrenzte Anzahl Neuversuche (absenken, neu ansetzen, wieder
    /// heben). Bleibt die Ladung aus, fällt der Task sofort.
    async fn verify_payload_after_lift(&self, task: &Task) -> Result<StepOutcome, StepError> {
        if self.payload_confirmed(&task.robot_id).await {
            return self.finish_lift_up(&task.robot_id).await;
        }

        let limit = Duration::from_millis(self.state.settings.jack_timeout_ms);
        for attempt in 1..=self.state.settings.jack_recovery_max {
            warn!(
                "⚠️ {} meldet keine Ladung, Neuversuch {}/{}.",
                task.robot_id, attempt, self.state.settings.jack_recovery_max
            );
            let robot = self.robot(&task.robot_id).await?;

            self.state.motion.set_lift(&robot, 0.0).await?;
            match self.wait_for_idle(&task.id, &task.robot_id, limit).await {
                WaitVerdict::Ready => {}
                WaitVerdict::Interrupted => return Ok(StepOutcome::Interrupted),
                WaitVerdict::TimedOut => return Err(StepError::Timeout("Hub-Neuversuch".into())),
            }

            // Neu unter die Ladung fahren.
            if let Some(here) = robot.location_station_id.clone() {
                self.state.motion.navigate(&robot, &here, &task.id).await?;
                match self
                    .wait_for_arrival(&task.id, &task.robot_id, &here, Duration::from_millis(self.state.settings.nav_timeout_ms))
                    .await
                {
                    WaitVerdict::Ready => {}
                    WaitVerdict::Interrupted => return Ok(StepOutcome::Interrupted),
                    WaitVerdict::TimedOut => return Err(StepError::Timeout("Hub-Neuversuch".into())),
                }
            }

            self.state.motion.set_lift(&robot, self.state.settings.jack_up_height).await?;
            match self.wait_for_idle(&task.id, &task.robot_id, limit).await {
                WaitVerdict::Ready => {}
                WaitVerdict::Interrupted => return Ok(StepOutcome::Interrupted),
                WaitVerdict::TimedOut => return Err(StepError::Timeout("Hub-Neuversuch".into())),
            }

            if self.payload_confirmed(&task.robot_id).await {
                return self.finish_lift_up(&task.robot_id).await;
            }
        }

        Err(StepError::PayloadMissing)
    }

    /// "Keine Ladung" gilt erst, wenn beide Lesungen im Abstand eines
    /// Poll-Intervalls negativ sind.
    async fn payload_confirmed(&self, robot_id: &str) -> bool {
        if self.state.robots.payload_present(robot_id, &self.state.settings).await {
            return true;
        }
        sleep(Duration::from_millis(self.state.settings.wait_poll_ms)).await;
        self.state.robots.payload_present(robot_id, &self.state.settings).await
    }

    async fn finish_lift_up(&self, robot_id: &str) -> Result<StepOutcome, StepError> {
        let robot = self.robot(robot_id).await?;
        if let Some(buffer_target) = robot.buffer_target_id.clone() {
            self.state
                .robots
                .set_phase(robot_id, Some(RobotPhase::EntryTravel), Some(buffer_target))
                .await;
        }
        Ok(StepOutcome::Finished)
    }

    // --- WAIT_FREE_PATH ---

    /// Blockiert, bis der Korridor frei ist. Steht das Fahrzeug dabei
    /// auf einer Einfahrt (Übergabe-/Kreuzungsstation), weicht es auf
    /// die Wartestation der Region aus, statt die Einfahrt zu belegen.
    async fn step_wait_free_path(&self, task: &Task, step: &TaskStep) -> Result<StepOutcome, StepError> {
        let poll = Duration::from_millis(self.state.settings.wait_poll_ms);
        let nav_limit = Duration::from_millis(self.state.settings.nav_timeout_ms);

        loop {
            if !self.task_running(&task.id).await {
                return Ok(StepOutcome::Interrupted);
            }
            let robot = self.robot(&task.robot_id).await?;
            if !self.path_conflict(&robot).await {
                return Ok(StepOutcome::Finished);
            }

            let my_station = robot
                .location_station_id
                .as_deref()
                .and_then(|s| self.state.map.by_id(s))
                .cloned();
            if let Some(my_station) = my_station {
                // Auf der Gegenseite angekommen wird nicht mehr gewichen.
                let at_far_side = step.payload.target.as_deref() == Some(my_station.id.as_str());
                let on_entry = my_station.has_class(&StationClass::Interchange)
                    || my_station.has_class(&StationClass::Crossing);

                if on_entry && !at_far_side {
                    if let Some(region) = my_station.region() {
                        if let Some(waiting) = self.state.map.waiting(region).cloned() {
                            if !robot.is_at(&waiting.id) {
                                info!("⏸️ Korridor belegt: {} weicht nach {} aus.", robot.id, waiting.name);
                                if self.state.motion.navigate(&robot, &waiting.id, &task.id).await.is_ok() {
                                    self.state
                                        .robots
                                        .set_destination(&task.robot_id, Some(waiting.id.clone()))
                                        .await;
                                    let verdict = self
                                        .wait_for_arrival(&task.id, &task.robot_id, &waiting.id, nav_limit)
                                        .await;
                                    self.state.robots.set_destination(&task.robot_id, None).await;
                                    match verdict {
                                        WaitVerdict::Ready => {}
                                        WaitVerdict::Interrupted => return Ok(StepOutcome::Interrupted),
                                        WaitVerdict::TimedOut => {
                                            return Err(StepError::Timeout(
                                                "Ausweichen zur Wartestation".into(),
                                            ))
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }

            sleep(poll).await;
        }
    }

    /// Konflikt: ein anderes Fahrzeug steht auf einer Korridor-Station
    /// und dessen Ziel teilt eine Rollen-Klasse mit unserer aktuellen
    /// Station.
    async fn path_conflict(&self, robot: &Robot) -> bool {
        let Some(my_station) = robot
            .location_station_id
            .as_deref()
            .and_then(|s| self.state.map.by_id(s))
        else {
            return false;
        };

        for other in self.state.robots.all().await {
            if other.id == robot.id {
                continue;
            }
            let Some(loc) = other.location_station_id.as_deref() else { continue };
            let Some(loc_station) = self.state.map.by_id(loc) else { continue };
            if !loc_station.has_class(&StationClass::Crossing) {
                continue;
            }
            let Some(dest) = other.destination_station_id.as_deref() else { continue };
            let Some(dest_station) = self.state.map.by_id(dest) else { continue };
            if dest_station.shares_role_class(my_station) {
                return true;
            }
        }
        false
    }

    // --- NAV_OR_BUFFER ---

    /// Primärziel frei: direkt anfahren. Sonst auf einen freien Puffer
    /// der Region ausweichen (Vorstaging + erneute Prüfung am Puffer).
    async fn step_nav_or_buffer(&self, task: &Task, step: &TaskStep) -> Result<StepOutcome, StepError> {
        let target_id = step.payload.target.clone().ok_or(StepError::MissingTarget)?;
        let primary = self
            .state
            .map
            .by_id(&target_id)
            .cloned()
            .ok_or_else(|| StepError::UnknownStation(target_id.clone()))?;

        if allocator::station_free_for(&self.state, &primary, &task.robot_id).await {
            self.state
                .tasks
                .insert_after_current(&task.id, vec![StepDraft::nav(&primary.id)])
                .await
                .map_err(|e| StepError::Unplannable(e.to_string()))?;
            return Ok(StepOutcome::Finished);
        }

        let robot = self.robot(&task.robot_id).await?;
        let region = primary
            .region()
            .or_else(|| {
                robot
                    .location_station_id
                    .as_deref()
                    .and_then(|s| self.state.map.region_of(s))
            })
            .ok_or_else(|| StepError::Unplannable(format!("Station '{}' ohne Region", primary.name)))?;

        let drafts = if let Some(buffer) =
            allocator::find_empty_buffer(&self.state, region, &task.robot_id, &[primary.id.as_str()]).await
        {
            let pre = self.state.map.pre_of(&buffer).map(|p| p.id.clone());
            info!("↪️ {} belegt, {} weicht auf Puffer {} aus.", primary.name, robot.id, buffer.name);
            vec![
                StepDraft::nav_pre(pre.as_deref().unwrap_or(&buffer.id)),
                StepDraft::new(StepKind::CheckBufferBeforeNav, StepPayload::target(&buffer.id)),
            ]
        } else if let Some(first) = self.state.map.buffers(region).first() {
            // Alles voll: am ersten Puffer warten und dort erneut prüfen.
            vec![StepDraft::new(StepKind::CheckBufferBeforeNav, StepPayload::target(&first.id))]
        } else {
            return Err(StepError::Unplannable(format!("Region {} hat keine Puffer", region)));
        };

        self.state
            .tasks
            .insert_after_current(&task.id, drafts)
            .await
            .map_err(|e| StepError::Unplannable(e.to_string()))?;
        Ok(StepOutcome::Finished)
    }

    // --- CHECK_BUFFER ---

    /// Prüft den konkreten Puffer erneut (Register vor Position). Frei:
    /// Einlagerung einschieben. Belegt: Kaskade Hauptknoten -> anderer
    /// Puffer -> kurzer Rücklauf.
    async fn step_check_buffer(&self, task: &Task, step: &TaskStep) -> Result<StepOutcome, StepError> {
        let buffer_id = step.payload.target.clone().ok_or(StepError::MissingTarget)?;
        let buffer = self
            .state
            .map
            .by_id(&buffer_id)
            .cloned()
            .ok_or_else(|| StepError::UnknownStation(buffer_id.clone()))?;
        let robot = self.robot(&task.robot_id).await?;

        if allocator::station_free_for(&self.state, &buffer, &task.robot_id).await {
            self.state
                .robots
                .set_phase(&task.robot_id, Some(RobotPhase::EntryLiftUp), Some(buffer.id.clone()))
                .await;

            let mut drafts = vec![
                StepDraft::new(StepKind::JackUp, StepPayload::default()),
                StepDraft::nav(&buffer.id),
                StepDraft::new(StepKind::JackDown, StepPayload::default()),
            ];
            if step.kind == StepKind::CheckBufferBeforeNav {
                drafts.push(StepDraft::new(StepKind::CheckBatteryAfterBuffer, StepPayload::default()));
            }
            self.state
                .tasks
                .insert_after_current(&task.id, drafts)
                .await
                .map_err(|e| StepError::Unplannable(e.to_string()))?;
            self.state
                .events
                .push(format!("{} lagert auf {} ein.", robot.name, buffer.name), "info")
                .await;
            return Ok(StepOutcome::Finished);
        }

        let region = buffer.region().or_else(|| {
            robot
                .location_station_id
                .as_deref()
                .and_then(|s| self.state.map.region_of(s))
        });

        if let Some(region) = region {
            if let Some(junction) = self.state.map.junction(region).cloned() {
                if !robot.is_at(&junction.id)
                    && allocator::station_free_for(&self.state, &junction, &task.robot_id).await
                {
                    self.insert_drafts(task, vec![StepDraft::nav(&junction.id)]).await?;
                    return Ok(StepOutcome::Finished);
                }
            }
            if let Some(other) =
                allocator::find_empty_buffer(&self.state, region, &task.robot_id, &[buffer.id.as_str()]).await
            {
                let pre = self.state.map.pre_of(&other).map(|p| p.id.clone());
                self.insert_drafts(
                    task,
                    vec![
                        StepDraft::nav_pre(pre.as_deref().unwrap_or(&other.id)),
                        StepDraft::new(step.kind, StepPayload::target(&other.id)),
                    ],
                )
                .await?;
                return Ok(StepOutcome::Finished);
            }
        }

        sleep(Duration::from_millis(self.state.settings.buffer_retry_delay_ms)).await;
        Ok(StepOutcome::NotYet)
    }

    async fn insert_drafts(&self, task: &Task, drafts: Vec<StepDraft>) -> Result<(), StepError> {
        self.state
            .tasks
            .insert_after_current(&task.id, drafts)
            .await
            .map_err(|e| StepError::Unplannable(e.to_string()))
    }

    // --- CHECK_BATTERY_AFTER_BUFFER ---

    /// Nach der Einlagerung: reicht der Akku nicht, Umweg über eine
    /// Ladestation einschieben. Unter der Notgrenze wird auch eine
    /// belegte Ladestation angefahren.
    async fn step_check_battery(&self, task: &Task) -> Result<StepOutcome, StepError> {
        let robot = self.robot(&task.robot_id).await?;
        if robot.battery >= self.state.settings.battery_low {
            return Ok(StepOutcome::Finished);
        }
        let Some(region) = robot
            .location_station_id
            .as_deref()
            .and_then(|s| self.state.map.region_of(s))
        else {
            return Ok(StepOutcome::Finished);
        };

        let charge = match allocator::find_empty_charge(&self.state, region, &task.robot_id).await {
            Some(c) => Some(c),
            None if robot.battery < self.state.settings.battery_emergency => {
                self.state.map.charge_stations(region).first().map(|c| (*c).clone())
            }
            None => None,
        };

        if let Some(charge) = charge {
            let pre = self.state.map.pre_of(&charge).map(|p| p.id.clone());
            info!("🔋 {} hat {:.0}% Akku, Umweg über {}.", robot.name, robot.battery, charge.name);
            self.insert_drafts(
                task,
                vec![
                    StepDraft::nav_pre(pre.as_deref().unwrap_or(&charge.id)),
                    StepDraft::nav(&charge.id),
                ],
            )
            .await?;
            self.state
                .events
                .push(format!("{} fährt zum Laden nach {}.", robot.name, charge.name), "warning")
                .await;
        }
        Ok(StepOutcome::Finished)
    }

    // --- FIND_EMPTY_* (Abschluss einer Querung) ---

    /// Sucht in der aktuellen Region einen freien Platz. Nichts frei:
    /// erst am Hauptknoten sammeln, dann an der Wartestation parken und
    /// jeden Tick neu suchen.
    async fn step_find_in_region(&self, task: &Task, charge: bool) -> Result<StepOutcome, StepError> {
        let robot = self.robot(&task.robot_id).await?;
        let region = robot
            .location_station_id
            .as_deref()
            .and_then(|s| self.state.map.region_of(s))
            .unwrap_or(Region::B);

        if charge {
            if let Some(st) = allocator::find_empty_charge(&self.state, region, &task.robot_id).await {
                let pre = self.state.map.pre_of(&st).map(|p| p.id.clone());
                self.insert_drafts(
                    task,
                    vec![StepDraft::nav_pre(pre.as_deref().unwrap_or(&st.id)), StepDraft::nav(&st.id)],
                )
                .await?;
                return Ok(StepOutcome::Finished);
            }
        } else if let Some(st) =
            allocator::find_empty_buffer(&self.state, region, &task.robot_id, &[]).await
        {
            let pre = self.state.map.pre_of(&st).map(|p| p.id.clone());
            self.insert_drafts(
                task,
                vec![
                    StepDraft::nav_pre(pre.as_deref().unwrap_or(&st.id)),
                    StepDraft::new(StepKind::CheckBufferBeforeNav, StepPayload::target(&st.id)),
                ],
            )
            .await?;
            return Ok(StepOutcome::Finished);
        }

        let again = if charge { StepKind::FindEmptyBCharge } else { StepKind::FindEmptyBBuffer };

        if let Some(junction) = self.state.map.junction(region).cloned() {
            if !robot.is_at(&junction.id)
                && allocator::station_free_for(&self.state, &junction, &task.robot_id).await
            {
                self.insert_drafts(
                    task,
                    vec![StepDraft::nav(&junction.id), StepDraft::new(again, StepPayload::default())],
                )
                .await?;
                return Ok(StepOutcome::Finished);
            }
        }

        if let Some(waiting) = self.state.map.waiting(region).cloned() {
            if !robot.is_at(&waiting.id) {
                self.insert_drafts(
                    task,
                    vec![StepDraft::nav(&waiting.id), StepDraft::new(again, StepPayload::default())],
                )
                .await?;
                return Ok(StepOutcome::Finished);
            }
        }

        Ok(StepOutcome::NotYet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::managers::robot_manager::TelemetryUpdate;
    use crate::test_support::{test_state_with_motion, MotionCommand};

    async fn place(state: &crate::AppState, robot: &str, station: &str, status: RobotStatus) {
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

    /// Pollt, bis der Rekorder einen NAV-Befehl auf das Ziel zeigt.
    async fn await_navigate(
        motion: &crate::test_support::RecordingMotion,
        target: &str,
        limit: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let seen = motion.commands.lock().await.iter().any(|c| {
                matches!(c, MotionCommand::Navigate { target: t, .. } if t == target)
            });
            if seen {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn nav_task_completes_on_arrival() {
        let (state, motion) = test_state_with_motion().await;
        place(&state, "amr-1", "9", RobotStatus::Idle).await;

        let task = state.tasks.create("amr-1", vec![StepDraft::nav("15")]).await.unwrap();
        let executor = crate::managers::executor::Executor::new(state.clone());

        executor.tick().await;
        assert!(await_navigate(&motion, "15", Duration::from_secs(2)).await);

        // Fahrzeug meldet Ankunft -> Task läuft durch.
        place(&state, "amr-1", "15", RobotStatus::Idle).await;
        let status = executor.drive_until_terminal(&task.id, Duration::from_secs(3)).await;
        assert_eq!(status, TaskStatus::Done);
        assert!(state.robots.get("amr-1").await.unwrap().destination_station_id.is_none());
    }

    #[tokio::test]
    async fn cancel_mid_nav_releases_within_poll_interval() {
        let (state, motion) = test_state_with_motion().await;
        place(&state, "amr-1", "9", RobotStatus::Idle).await;

        let task = state.tasks.create("amr-1", vec![StepDraft::nav("15")]).await.unwrap();
        let executor = crate::managers::executor::Executor::new(state.clone());
        executor.tick().await;
        assert!(await_navigate(&motion, "15", Duration::from_secs(2)).await);
        assert_eq!(
            state.robots.get("amr-1").await.unwrap().destination_station_id.as_deref(),
            Some("15")
        );

        state.tasks.cancel(&task.id).await.unwrap();

        // Die Unterbrechung greift innerhalb weniger Poll-Intervalle.
        let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
        loop {
            if state.robots.get("amr-1").await.unwrap().destination_station_id.is_none() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "Ziel wird nicht freigegeben");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(state.tasks.get(&task.id).await.unwrap().status, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn jack_up_without_payload_fails_the_task() {
        let (state, _motion) = test_state_with_motion().await;
        // Beide Ladungs-Sensoren bleiben aus.
        state
            .robots
            .ingest(TelemetryUpdate {
                robot_id: "amr-1".into(),
                status: Some(RobotStatus::Idle),
                location_station_id: Some("9".into()),
                telemetry: Some(crate::core::types::Telemetry {
                    digital_inputs: Some(vec![false; 16]),
                    ..Default::default()
                }),
            })
            .await;

        let task = state
            .tasks
            .create("amr-1", vec![StepDraft::new(StepKind::JackUp, StepPayload::default())])
            .await
            .unwrap();
        let executor = crate::managers::executor::Executor::new(state.clone());

        let status = executor.drive_until_terminal(&task.id, Duration::from_secs(5)).await;
        assert_eq!(status, TaskStatus::Failed);
        let task = state.tasks.get(&task.id).await.unwrap();
        assert!(task.error.as_deref().unwrap_or("").contains("Ladung"));
    }

    #[tokio::test]
    async fn paused_task_resumes_at_current_step() {
        let (state, motion) = test_state_with_motion().await;
        place(&state, "amr-1", "9", RobotStatus::Idle).await;

        let task = state
            .tasks
            .create("amr-1", vec![StepDraft::nav("15"), StepDraft::nav("16")])
            .await
            .unwrap();
        let executor = crate::managers::executor::Executor::new(state.clone());
        executor.tick().await;
        assert!(await_navigate(&motion, "15", Duration::from_secs(2)).await);

        state.tasks.pause(&task.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Pausiert: kein Fortschritt, Step bleibt offen.
        assert_eq!(state.tasks.get(&task.id).await.unwrap().status, TaskStatus::Paused);

        state.tasks.resume(&task.id).await.unwrap();
        place(&state, "amr-1", "15", RobotStatus::Idle).await;
        // Nach der Ankunft auf "15" folgt der zweite NAV-Step.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            executor.tick().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            if await_navigate(&motion, "16", Duration::from_millis(1)).await {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "zweiter NAV-Step startet nicht");
        }
        place(&state, "amr-1", "16", RobotStatus::Idle).await;
        let status = executor.drive_until_terminal(&task.id, Duration::from_secs(3)).await;
        assert_eq!(status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn nav_or_buffer_diverts_to_empty_buffer() {
        let (state, _motion) = test_state_with_motion().await;
        place(&state, "amr-1", "16", RobotStatus::Idle).await;
        // Primärziel B1 ("9") ist belegt.
        place(&state, "amr-2", "9", RobotStatus::Idle).await;

        let task = state
            .tasks
            .create("amr-1", vec![StepDraft::new(StepKind::NavOrBuffer, StepPayload::target("9"))])
            .await
            .unwrap();
        let executor = crate::managers::executor::Executor::new(state.clone());
        executor.process_robot("amr-1").await;

        let steps = state.tasks.steps_of(&task.id).await;
        let kinds: Vec<StepKind> = steps.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![StepKind::NavOrBuffer, StepKind::NavPre, StepKind::CheckBufferBeforeNav]
        );
        // Ausweichziel ist ein anderer Puffer der Region B.
        let check = steps.last().unwrap();
        let target = check.payload.target.as_deref().unwrap();
        assert_ne!(target, "9");
        assert!(state.map.by_id(target).unwrap().region() == Some(Region::B));
    }

    #[tokio::test]
    async fn check_buffer_plans_the_storage_sequence() {
        let (state, _motion) = test_state_with_motion().await;
        place(&state, "amr-1", "90", RobotStatus::Idle).await; // B1_PRE

        let task = state
            .tasks
            .create(
                "amr-1",
                vec![StepDraft::new(StepKind::CheckBufferBeforeNav, StepPayload::target("9"))],
            )
            .await
            .unwrap();
        let executor = crate::managers::executor::Executor::new(state.clone());
        executor.process_robot("amr-1").await;

        let steps = state.tasks.steps_of(&task.id).await;
        let kinds: Vec<StepKind> = steps.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StepKind::CheckBufferBeforeNav,
                StepKind::JackUp,
                StepKind::Nav,
                StepKind::JackDown,
                StepKind::CheckBatteryAfterBuffer,
            ]
        );

        let robot = state.robots.get("amr-1").await.unwrap();
        assert_eq!(robot.phase, Some(RobotPhase::EntryLiftUp));
        assert_eq!(robot.buffer_target_id.as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn manual_dispatch_to_occupied_station_is_rejected() {
        use axum::extract::State;
        use axum::response::IntoResponse;

        let (state, _motion) = test_state_with_motion().await;
        place(&state, "amr-2", "4", RobotStatus::Idle).await; // steht auf A4

        let response = crate::managers::task_manager::api_manual_dispatch(
            State(state.clone()),
            axum::Json(crate::managers::task_manager::ManualDispatchRequest {
                robot: "AMR-1".into(),
                station: "A4".into(),
            }),
        )
        .await
        .into_response();

        assert_eq!(response.status(), axum::http::StatusCode::CONFLICT);
        assert!(state.tasks.active_task_for("amr-1").await.is_none());
    }

    #[tokio::test]
    async fn wait_free_path_yields_to_waiting_station_on_conflict() {
        let (state, motion) = test_state_with_motion().await;
        place(&state, "amr-1", "6", RobotStatus::Idle).await; // AX
        // Gegenverkehr: amr-2 steht im Korridor und will zur Übergabe BX.
        place(&state, "amr-2", "7", RobotStatus::Moving).await; // MID
        state.robots.set_destination("amr-2", Some("8".into())).await;

        let task = state
            .tasks
            .create(
                "amr-1",
                vec![StepDraft::new(StepKind::WaitFreePath, StepPayload::target("8"))],
            )
            .await
            .unwrap();
        let executor = crate::managers::executor::Executor::new(state.clone());
        executor.tick().await;

        // Statt die Einfahrt zu belegen, weicht amr-1 auf AW1 aus.
        assert!(await_navigate(&motion, "5", Duration::from_secs(2)).await);
        place(&state, "amr-1", "5", RobotStatus::Idle).await;

        // Abseits des Korridors besteht kein Klassen-Konflikt mehr.
        let status = executor.drive_until_terminal(&task.id, Duration::from_secs(3)).await;
        assert_eq!(status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn wait_free_path_ignores_unrelated_corridor_traffic() {
        let (state, motion) = test_state_with_motion().await;
        place(&state, "amr-1", "6", RobotStatus::Idle).await;
        // amr-2 fährt durch den Korridor zur Wartestation: keine
        // gemeinsame Rollen-Klasse mit der Einfahrt, kein Konflikt.
        place(&state, "amr-2", "7", RobotStatus::Moving).await;
        state.robots.set_destination("amr-2", Some("16".into())).await;

        let task = state
            .tasks
            .create(
                "amr-1",
                vec![StepDraft::new(StepKind::WaitFreePath, StepPayload::target("8"))],
            )
            .await
            .unwrap();
        let executor = crate::managers::executor::Executor::new(state.clone());

        let status = executor.drive_until_terminal(&task.id, Duration::from_secs(2)).await;
        assert_eq!(status, TaskStatus::Done);
        assert!(motion.commands.lock().await.is_empty());
    }

    #[tokio::test]
    async fn wait_free_path_holds_at_the_far_interchange() {
        let (state, motion) = test_state_with_motion().await;
        place(&state, "amr-1", "8", RobotStatus::Idle).await; // schon auf BX
        place(&state, "amr-2", "7", RobotStatus::Moving).await;
        state.robots.set_destination("amr-2", Some("6".into())).await;

        let task = state
            .tasks
            .create(
                "amr-1",
                vec![StepDraft::new(StepKind::WaitFreePath, StepPayload::target("8"))],
            )
            .await
            .unwrap();
        let executor = crate::managers::executor::Executor::new(state.clone());
        executor.tick().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Auf der Gegenseite wird nicht mehr gewichen: kein Fahrbefehl.
        assert!(motion.commands.lock().await.is_empty());
        assert!(!state.tasks.task_status(&task.id).await.unwrap().is_terminal());

        // Korridor frei -> Step läuft durch.
        state.robots.set_destination("amr-2", None).await;
        let status = executor.drive_until_terminal(&task.id, Duration::from_secs(2)).await;
        assert_eq!(status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn low_battery_inserts_a_charge_detour_after_storage() {
        let (state, _motion) = test_state_with_motion().await;
        state
            .robots
            .ingest(TelemetryUpdate {
                robot_id: "amr-1".into(),
                status: Some(RobotStatus::Idle),
                location_station_id: Some("9".into()),
                telemetry: Some(crate::core::types::Telemetry {
                    battery: Some(20.0),
                    ..Default::default()
                }),
            })
            .await;

        let task = state
            .tasks
            .create(
                "amr-1",
                vec![StepDraft::new(StepKind::CheckBatteryAfterBuffer, StepPayload::default())],
            )
            .await
            .unwrap();
        let executor = crate::managers::executor::Executor::new(state.clone());
        executor.process_robot("amr-1").await;

        let steps = state.tasks.steps_of(&task.id).await;
        let kinds: Vec<StepKind> = steps.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![StepKind::CheckBatteryAfterBuffer, StepKind::NavPre, StepKind::Nav]);
        // Umweg über die erste freie Ladestation der Region B.
        assert_eq!(steps[1].payload.target.as_deref(), Some("170"));
        assert_eq!(steps[2].payload.target.as_deref(), Some("17"));
    }

    #[tokio::test]
    async fn busy_chargers_only_overridden_below_emergency_level() {
        use crate::core::config::{MapData, RobotSeed};

        // Drittes Fahrzeug, damit beide Ladestationen besetzt sein
        // können, ohne dass ein fremder Task die Region sperrt.
        let mut map = MapData::default();
        map.robots.push(RobotSeed {
            id: "amr-3".into(),
            name: "AMR-3".into(),
            address: "127.0.0.1".into(),
        });
        let motion = crate::test_support::RecordingMotion::new();
        let state = crate::AppState::new(crate::test_support::fast_settings(), map, motion);

        place(&state, "amr-2", "17", RobotStatus::Charging).await; // BC1
        place(&state, "amr-3", "19", RobotStatus::Charging).await; // BC2
        state
            .robots
            .ingest(TelemetryUpdate {
                robot_id: "amr-1".into(),
                status: Some(RobotStatus::Idle),
                location_station_id: Some("9".into()),
                telemetry: Some(crate::core::types::Telemetry {
                    battery: Some(20.0),
                    ..Default::default()
                }),
            })
            .await;

        // Niedrig, aber über der Notgrenze: kein Platz frei -> kein Umweg.
        let task = state
            .tasks
            .create(
                "amr-1",
                vec![StepDraft::new(StepKind::CheckBatteryAfterBuffer, StepPayload::default())],
            )
            .await
            .unwrap();
        let executor = crate::managers::executor::Executor::new(state.clone());
        executor.process_robot("amr-1").await;
        executor.process_robot("amr-1").await;
        assert_eq!(state.tasks.get(&task.id).await.unwrap().status, TaskStatus::Done);
        assert_eq!(state.tasks.steps_of(&task.id).await.len(), 1);

        // Unter der Notgrenze wird auch eine besetzte Station angefahren.
        state
            .robots
            .ingest(TelemetryUpdate {
                robot_id: "amr-1".into(),
                status: None,
                location_station_id: None,
                telemetry: Some(crate::core::types::Telemetry {
                    battery: Some(10.0),
                    ..Default::default()
                }),
            })
            .await;
        let task = state
            .tasks
            .create(
                "amr-1",
                vec![StepDraft::new(StepKind::CheckBatteryAfterBuffer, StepPayload::default())],
            )
            .await
            .unwrap();
        executor.process_robot("amr-1").await;

        let steps = state.tasks.steps_of(&task.id).await;
        let kinds: Vec<StepKind> = steps.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![StepKind::CheckBatteryAfterBuffer, StepKind::NavPre, StepKind::Nav]);
        assert_eq!(steps[2].payload.target.as_deref(), Some("17"));
    }
}
