use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::core::types::{StepStatus, TaskStatus};
use crate::managers::allocator::{self, CrossingGoal};
use crate::managers::steps::StepOutcome;
use crate::AppState;

/// Scheduler-Kern. Fester Takt; pro Fahrzeug strikt serialisiert
/// (lock-and-skip: ein Fahrzeug, das noch in Bearbeitung ist, wird im
/// Tick übersprungen, nie doppelt angestoßen). Verschiedene Fahrzeuge
/// laufen parallel.
pub struct Executor {
    pub(crate) state: Arc<AppState>,
    /// Fahrzeuge, deren Step gerade ausgeführt wird.
    busy: Mutex<HashSet<String>>,
    /// Step-Ids mit bereits abgesetztem Hub-Befehl.
    pub(crate) jack_inflight: Mutex<HashSet<String>>,
    running: AtomicBool,
}

impl Executor {
    pub fn new(state: Arc<AppState>) -> Arc<Self> {
        Arc::new(Self {
            state,
            busy: Mutex::new(HashSet::new()),
            jack_inflight: Mutex::new(HashSet::new()),
            running: AtomicBool::new(true),
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn run(self: Arc<Self>) {
        info!("🚦 Task-Executor aktiv (Takt: {}ms)", self.state.settings.executor_tick_ms);
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.state.settings.executor_tick_ms));
        // Ein laufender Tick lässt den nächsten fälligen ausfallen.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// Ein Scheduler-Durchlauf: liegengebliebene Kreuzungs-Wünsche
    /// erneut versuchen, dann je Fahrzeug den ältesten aktiven Task
    /// anstoßen.
    pub async fn tick(self: &Arc<Self>) {
        self.drain_pending_retries().await;

        for task in self.state.tasks.oldest_active_per_robot().await {
            let robot_id = task.robot_id.clone();
            {
                let mut busy = self.busy.lock().await;
                if !busy.insert(robot_id.clone()) {
                    continue; // lock-and-skip
                }
            }

            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.process_robot(&robot_id).await;
                this.busy.lock().await.remove(&robot_id);
            });
        }
    }

    /// Bearbeitet genau einen Step-Fortschritt des Fahrzeugs. Läuft der
    /// Step-Körper in eine Wartezeit, bleibt das Fahrzeug so lange als
    /// "busy" markiert.
    pub(crate) async fn process_robot(&self, robot_id: &str) {
        let Some(task) = self.state.tasks.active_task_for(robot_id).await else {
            return;
        };

        match task.status {
            TaskStatus::Paused => return,
            TaskStatus::Pending => {
                self.state.tasks.set_task_status(&task.id, TaskStatus::Running).await;
                self.state
                    .events
                    .push(format!("Task {} gestartet (Fahrzeug {}).", task.id, robot_id), "info")
                    .await;
            }
            TaskStatus::Running => {}
            // Terminale Tasks liefert active_task_for nicht.
            _ => return,
        }

        let Some(step) = self.state.tasks.current_step(&task.id).await else {
            self.state.tasks.set_task_status(&task.id, TaskStatus::Done).await;
            self.state.robots.set_phase(robot_id, None, None).await;
            self.state
                .events
                .push(format!("Task {} abgeschlossen.", task.id), "success")
                .await;
            info!("✅ Task {} fertig (Fahrzeug {}).", task.id, robot_id);
            return;
        };

        match step.status {
            StepStatus::Failed => {
                let reason = step.error.clone().unwrap_or_else(|| "Step fehlgeschlagen".to_string());
                self.state.tasks.fail_task(&task.id, &reason).await;
                return;
            }
            StepStatus::Done => {
                // Seq nachziehen; der nächste Tick nimmt den Folgestep.
                self.state.tasks.complete_step(&task.id, step.seq).await;
                return;
            }
            StepStatus::Canceled => return,
            StepStatus::Running => return,
            StepStatus::Pending => {}
        }

        // Bremse 1: frischer Task, Region hat schon einen aktiven Mover.
        if step.retry_count == 0 && self.state.tasks.is_first_step(&task.id, step.seq).await {
            if self.region_busy_with_other_task(robot_id).await {
                return;
            }
        }

        // Bremse 2: Fahrzeug steht auf Handbetrieb.
        if self.state.robots.manual_mode(robot_id, &self.state.settings).await {
            return;
        }

        self.state.tasks.set_step_status(&task.id, step.seq, StepStatus::Running).await;
        let started = Instant::now();

        match self.run_step(&task, &step).await {
            Ok(StepOutcome::Finished) => {
                self.state.tasks.complete_step(&task.id, step.seq).await;
                self.state
                    .events
                    .push(
                        format!(
                            "Step {:?} (Seq {}) fertig nach {}ms.",
                            step.kind,
                            step.seq,
                            started.elapsed().as_millis()
                        ),
                        "info",
                    )
                    .await;
            }
            Ok(StepOutcome::NotYet) => {
                if self.state.tasks.task_status(&task.id).await.map_or(false, |s| !s.is_terminal()) {
                    self.state.tasks.set_step_status(&task.id, step.seq, StepStatus::Pending).await;
                }
            }
            Ok(StepOutcome::Interrupted) => {
                // Task hat RUNNING verlassen. Bei Pause bleibt der Step
                // offen und wird nach resume neu angestoßen; bei Abbruch
                // hat cancel die Steps bereits terminal gesetzt.
                if self.state.tasks.task_status(&task.id).await.map_or(false, |s| !s.is_terminal()) {
                    self.state.tasks.set_step_status(&task.id, step.seq, StepStatus::Pending).await;
                }
                warn!("⏹️ Step {:?} von Task {} unterbrochen.", step.kind, task.id);
            }
            Err(e) => {
                let fell = self
                    .state
                    .tasks
                    .record_step_failure(
                        &task.id,
                        step.seq,
                        &e.to_string(),
                        self.state.settings.step_retry_max,
                        e.is_fatal(),
                    )
                    .await;
                if fell {
                    error!("❌ Task {} gefallen: {}", task.id, e);
                    self.state
                        .events
                        .push(format!("Task {} fehlgeschlagen: {}", task.id, e), "error")
                        .await;
                }
            }
        }
    }

    /// Hat die Region des Fahrzeugs bereits ein anderes Fahrzeug mit
    /// nicht-terminalem Task?
    async fn region_busy_with_other_task(&self, robot_id: &str) -> bool {
        let Some(robot) = self.state.robots.get(robot_id).await else { return false };
        let Some(region) = robot
            .location_station_id
            .as_deref()
            .and_then(|s| self.state.map.region_of(s))
        else {
            return false;
        };

        for other_id in self.state.robots.ids_in_region(region, &self.state.map).await {
            if other_id == robot_id {
                continue;
            }
            if self.state.tasks.active_task_for(&other_id).await.is_some() {
                return true;
            }
        }
        false
    }

    /// Liegengebliebene Kreuzungs-Wünsche: jeden Tick neu prüfen, bis
    /// erfüllt oder vom nächsten Task des Fahrzeugs überholt.
    async fn drain_pending_retries(&self) {
        for (robot_id, dest_id) in self.state.pending.snapshot().await {
            if self.state.tasks.active_task_for(&robot_id).await.is_some() {
                // Überholt: das Fahrzeug hat inzwischen einen Task.
                self.state.pending.remove(&robot_id).await;
                continue;
            }
            let Some(robot) = self.state.robots.get(&robot_id).await else {
                self.state.pending.remove(&robot_id).await;
                continue;
            };
            let Some(dest) = self.state.map.by_id(&dest_id).map(|s| s.clone()) else {
                self.state.pending.remove(&robot_id).await;
                continue;
            };

            let from_region = robot
                .location_station_id
                .as_deref()
                .and_then(|s| self.state.map.region_of(s));
            let dest_region = dest.region();

            let created = match (from_region, dest_region) {
                (Some(from), Some(to)) if from != to => {
                    if !allocator::region_has_empty_buffer(&self.state, to).await {
                        continue; // weiter warten
                    }
                    let Some(steps) =
                        allocator::crossing_template(&self.state, from, CrossingGoal::BufferSearch)
                    else {
                        self.state.pending.remove(&robot_id).await;
                        continue;
                    };
                    self.state.tasks.create(&robot_id, steps).await
                }
                _ => {
                    if !allocator::station_free_for(&self.state, &dest, &robot_id).await {
                        continue;
                    }
                    self.state
                        .tasks
                        .create(&robot_id, vec![crate::core::types::StepDraft::nav(&dest.id)])
                        .await
                }
            };

            match created {
                Ok(task) => {
                    self.state.pending.remove(&robot_id).await;
                    self.state
                        .events
                        .push(
                            format!("Wartender Kreuzungs-Wunsch erfüllt: Task {} ({} -> {}).",
                                task.id, robot_id, dest.name),
                            "info",
                        )
                        .await;
                }
                Err(e) => {
                    warn!("⚠️ Wiedervorlage für {} weiter offen: {}", robot_id, e);
                }
            }
        }
    }

    /// Für Tests: führt so lange Ticks aus, bis der Task terminal ist
    /// oder die Frist abläuft.
    #[cfg(test)]
    pub(crate) async fn drive_until_terminal(self: &Arc<Self>, task_id: &str, deadline: Duration) -> TaskStatus {
        let until = Instant::now() + deadline;
        loop {
            self.tick().await;
            tokio::time::sleep(Duration::from_millis(
                self.state.settings.executor_tick_ms.max(5),
            ))
            .await;
            let status = self.state.tasks.task_status(task_id).await.unwrap();
            if status.is_terminal() || Instant::now() > until {
                return status;
            }
        }
    }
}
