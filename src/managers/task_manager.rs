use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Local;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::core::types::{
    SEQ_SPACING, StepDraft, StepStatus, Task, TaskStatus, TaskStep,
};
use crate::AppState;

/// Ablehnungen bei Task-Erzeugung und -Steuerung. Erzeugungs-Konflikte
/// haben keine Seiteneffekte.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Fahrzeug '{0}' hat bereits einen aktiven Task")]
    RobotBusy(String),
    #[error("Station '{0}' wird bereits von einem anderen Task angefahren")]
    DestinationConflict(String),
    #[error("Station '{0}' ist belegt")]
    DestinationOccupied(String),
    #[error("Unbekanntes Fahrzeug '{0}'")]
    UnknownRobot(String),
    #[error("Unbekannte Station '{0}'")]
    UnknownStation(String),
    #[error("Task '{0}' nicht gefunden")]
    UnknownTask(String),
    #[error("Task '{0}' ist in Status {1:?} nicht steuerbar")]
    InvalidTransition(String, TaskStatus),
    #[error("Task braucht mindestens einen Step")]
    EmptyPlan,
}

impl DispatchError {
    fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::RobotBusy(_)
            | DispatchError::DestinationConflict(_)
            | DispatchError::DestinationOccupied(_) => StatusCode::CONFLICT,
            DispatchError::UnknownRobot(_)
            | DispatchError::UnknownStation(_)
            | DispatchError::UnknownTask(_) => StatusCode::NOT_FOUND,
            DispatchError::InvalidTransition(_, _) | DispatchError::EmptyPlan => {
                StatusCode::BAD_REQUEST
            }
        }
    }
}

#[derive(Default)]
struct TaskTable {
    tasks: HashMap<String, Task>,
    /// Steps je Task, aufsteigend nach `seq` sortiert gehalten.
    steps: HashMap<String, Vec<TaskStep>>,
}

/// Task-Store: einzige Quelle der Wahrheit für Ausführungsfortschritt.
/// Mutationen sind kurze, transaktionale Abschnitte unter einem Lock;
/// kein Aufrufer hält das Lock über eine Wartezeit.
pub struct TaskManager {
    inner: RwLock<TaskTable>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self { inner: RwLock::new(TaskTable::default()) }
    }

    // --- ERZEUGUNG ---

    /// Legt einen Task mit initialem Plan an. Prüft die zentralen
    /// Invarianten: ein aktiver Task pro Fahrzeug, kein doppeltes
    /// NAV-Ziel über alle aktiven Tasks.
    pub async fn create(&self, robot_id: &str, drafts: Vec<StepDraft>) -> Result<Task, DispatchError> {
        if drafts.is_empty() {
            return Err(DispatchError::EmptyPlan);
        }

        let mut table = self.inner.write().await;

        if table.tasks.values().any(|t| t.robot_id == robot_id && !t.status.is_terminal()) {
            return Err(DispatchError::RobotBusy(robot_id.to_string()));
        }

        for draft in &drafts {
            if draft.kind.is_nav() {
                if let Some(target) = draft.payload.target.as_deref() {
                    if Self::nav_conflict(&table, target, robot_id) {
                        return Err(DispatchError::DestinationConflict(target.to_string()));
                    }
                }
            }
        }

        let task = Task::new(robot_id);
        let steps: Vec<TaskStep> = drafts
            .into_iter()
            .enumerate()
            .map(|(i, d)| TaskStep::from_draft(&task.id, (i as i64 + 1) * SEQ_SPACING, d))
            .collect();

        info!("🆕 Task {} für Fahrzeug {} angelegt ({} Steps).", task.id, robot_id, steps.len());
        table.steps.insert(task.id.clone(), steps);
        table.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    fn nav_conflict(table: &TaskTable, target: &str, exclude_robot: &str) -> bool {
        table.tasks.values().any(|t| {
            t.robot_id != exclude_robot
                && !t.status.is_terminal()
                && table.steps.get(&t.id).map_or(false, |steps| {
                    steps.iter().any(|s| {
                        matches!(s.status, StepStatus::Pending | StepStatus::Running)
                            && s.nav_target() == Some(target)
                    })
                })
        })
    }

    /// Fährt ein anderes Fahrzeug diese Station bereits an?
    pub async fn destination_targeted(&self, target: &str, exclude_robot: &str) -> bool {
        let table = self.inner.read().await;
        Self::nav_conflict(&table, target, exclude_robot)
    }

    // --- LESEZUGRIFFE ---

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        self.inner.read().await.tasks.get(task_id).cloned()
    }

    pub async fn list(&self) -> Vec<Task> {
        let table = self.inner.read().await;
        let mut tasks: Vec<Task> = table.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    pub async fn steps_of(&self, task_id: &str) -> Vec<TaskStep> {
        self.inner.read().await.steps.get(task_id).cloned().unwrap_or_default()
    }

    pub async fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.inner.read().await.tasks.get(task_id).map(|t| t.status)
    }

    /// Ältester nicht-terminaler Task des Fahrzeugs.
    pub async fn active_task_for(&self, robot_id: &str) -> Option<Task> {
        let table = self.inner.read().await;
        table
            .tasks
            .values()
            .filter(|t| t.robot_id == robot_id && !t.status.is_terminal())
            .min_by_key(|t| t.created_at)
            .cloned()
    }

    /// Für den Scheduler-Tick: je Fahrzeug der älteste aktive Task.
    pub async fn oldest_active_per_robot(&self) -> Vec<Task> {
        let table = self.inner.read().await;
        let mut per_robot: HashMap<&str, &Task> = HashMap::new();
        for t in table.tasks.values().filter(|t| !t.status.is_terminal()) {
            per_robot
                .entry(t.robot_id.as_str())
                .and_modify(|cur| {
                    if t.created_at < cur.created_at {
                        *cur = t;
                    }
                })
                .or_insert(t);
        }
        per_robot.into_values().cloned().collect()
    }

    pub async fn current_step(&self, task_id: &str) -> Option<TaskStep> {
        let table = self.inner.read().await;
        let task = table.tasks.get(task_id)?;
        table
            .steps
            .get(task_id)?
            .iter()
            .find(|s| s.seq == task.current_seq)
            .cloned()
    }

    /// Ist der Step der erste (niedrigste Seq) seines Tasks?
    pub async fn is_first_step(&self, task_id: &str, seq: i64) -> bool {
        let table = self.inner.read().await;
        table
            .steps
            .get(task_id)
            .and_then(|steps| steps.first())
            .map_or(false, |s| s.seq == seq)
    }

    // --- ZUSTANDSÜBERGÄNGE ---

    pub async fn set_task_status(&self, task_id: &str, status: TaskStatus) {
        let mut table = self.inner.write().await;
        if let Some(task) = table.tasks.get_mut(task_id) {
            task.status = status;
            if status.is_terminal() {
                task.finished_at = Some(Local::now());
            }
        }
    }

    pub async fn fail_task(&self, task_id: &str, error: &str) {
        let mut table = self.inner.write().await;
        if let Some(task) = table.tasks.get_mut(task_id) {
            task.status = TaskStatus::Failed;
            task.error = Some(error.to_string());
            task.finished_at = Some(Local::now());
        }
    }

    pub async fn set_step_status(&self, task_id: &str, seq: i64, status: StepStatus) {
        let mut table = self.inner.write().await;
        if let Some(steps) = table.steps.get_mut(task_id) {
            if let Some(step) = steps.iter_mut().find(|s| s.seq == seq) {
                step.status = status;
            }
        }
    }

    /// Step fertig: DONE markieren und `current_seq` auf den nächsten
    /// existierenden Step schieben.
    pub async fn complete_step(&self, task_id: &str, seq: i64) {
        let mut table = self.inner.write().await;
        let next = table.steps.get_mut(task_id).and_then(|steps| {
            if let Some(step) = steps.iter_mut().find(|s| s.seq == seq) {
                step.status = StepStatus::Done;
            }
            steps.iter().map(|s| s.seq).filter(|&s| s > seq).min()
        });
        if let Some(task) = table.tasks.get_mut(task_id) {
            task.current_seq = next.unwrap_or(seq + 1);
        }
    }

    /// Fehlschlag verbuchen. Unterhalb des Budgets geht der Step zurück
    /// auf PENDING; darüber (oder bei `fatal`) fallen Step und Task.
    /// Liefert true, wenn der Task gefallen ist.
    pub async fn record_step_failure(
        &self,
        task_id: &str,
        seq: i64,
        error: &str,
        retry_max: u32,
        fatal: bool,
    ) -> bool {
        let mut table = self.inner.write().await;
        let mut exhausted = fatal;

        if let Some(steps) = table.steps.get_mut(task_id) {
            if let Some(step) = steps.iter_mut().find(|s| s.seq == seq) {
                step.retry_count += 1;
                if step.retry_count >= retry_max {
                    exhausted = true;
                }
                if exhausted {
                    step.status = StepStatus::Failed;
                    step.error = Some(error.to_string());
                } else {
                    step.status = StepStatus::Pending;
                }
            }
        }

        if exhausted {
            if let Some(task) = table.tasks.get_mut(task_id) {
                task.status = TaskStatus::Failed;
                task.error = Some(error.to_string());
                task.finished_at = Some(Local::now());
            }
        }
        exhausted
    }

    // --- DYNAMISCHE PLAN-ERWEITERUNG ---

    /// Schiebt Steps direkt hinter den laufenden Step. Seq-Nummern
    /// werden in die Lücke zum nächsten existierenden Step gespreizt;
    /// bestehende Steps werden nie umnummeriert.
    pub async fn insert_after_current(&self, task_id: &str, drafts: Vec<StepDraft>) -> Result<(), DispatchError> {
        if drafts.is_empty() {
            return Ok(());
        }
        let mut table = self.inner.write().await;
        let current = table
            .tasks
            .get(task_id)
            .ok_or_else(|| DispatchError::UnknownTask(task_id.to_string()))?
            .current_seq;

        let steps = table.steps.entry(task_id.to_string()).or_default();
        let next = steps.iter().map(|s| s.seq).filter(|&s| s > current).min();

        let stride = match next {
            Some(n) => (((n - current) / (drafts.len() as i64 + 1)).max(1)) as i64,
            None => SEQ_SPACING,
        };

        for (i, draft) in drafts.into_iter().enumerate() {
            let seq = current + stride * (i as i64 + 1);
            if steps.iter().any(|s| s.seq == seq) {
                warn!("⚠️ Seq-Lücke in Task {} erschöpft, hänge Step ans Ende.", task_id);
                let tail = steps.iter().map(|s| s.seq).max().unwrap_or(current) + SEQ_SPACING;
                steps.push(TaskStep::from_draft(task_id, tail, draft));
            } else {
                steps.push(TaskStep::from_draft(task_id, seq, draft));
            }
        }
        steps.sort_by_key(|s| s.seq);
        Ok(())
    }

    // --- STEUERUNG VON AUSSEN ---

    pub async fn pause(&self, task_id: &str) -> Result<Task, DispatchError> {
        let mut table = self.inner.write().await;
        let task = table
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| DispatchError::UnknownTask(task_id.to_string()))?;
        match task.status {
            TaskStatus::Pending | TaskStatus::Running => {
                task.status = TaskStatus::Paused;
                info!("⏸️ Task {} pausiert.", task_id);
                Ok(task.clone())
            }
            other => Err(DispatchError::InvalidTransition(task_id.to_string(), other)),
        }
    }

    /// Setzt einen pausierten Task fort. `current_seq` bleibt stehen,
    /// der laufende Step wird beim nächsten Tick erneut angestoßen.
    pub async fn resume(&self, task_id: &str) -> Result<Task, DispatchError> {
        let mut table = self.inner.write().await;
        let task = table
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| DispatchError::UnknownTask(task_id.to_string()))?;
        match task.status {
            TaskStatus::Paused => {
                task.status = TaskStatus::Running;
                info!("▶️ Task {} fortgesetzt (Step-Seq {}).", task_id, task.current_seq);
                Ok(task.clone())
            }
            other => Err(DispatchError::InvalidTransition(task_id.to_string(), other)),
        }
    }

    /// Bricht einen Task ab; alle offenen Steps werden verworfen.
    pub async fn cancel(&self, task_id: &str) -> Result<Task, DispatchError> {
        let mut table = self.inner.write().await;
        let task = table
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| DispatchError::UnknownTask(task_id.to_string()))?;
        if task.status.is_terminal() {
            return Err(DispatchError::InvalidTransition(task_id.to_string(), task.status));
        }
        task.status = TaskStatus::Canceled;
        task.finished_at = Some(Local::now());
        let task = task.clone();

        if let Some(steps) = table.steps.get_mut(task_id) {
            for step in steps.iter_mut().filter(|s| !s.status.is_terminal()) {
                step.status = StepStatus::Canceled;
            }
        }
        info!("🛑 Task {} abgebrochen.", task_id);
        Ok(task)
    }

    pub async fn any_paused(&self) -> bool {
        self.inner.read().await.tasks.values().any(|t| t.status == TaskStatus::Paused)
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

// --- AXUM ROUTER ENDPUNKTE ---

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub robot_id: String,
    pub steps: Vec<StepDraft>,
}

#[derive(Deserialize)]
pub struct ManualDispatchRequest {
    pub robot: String,
    pub station: String,
}

#[derive(Serialize)]
pub struct TaskResponse {
    #[serde(flatten)]
    pub task: Task,
    pub steps: Vec<TaskStep>,
}

fn error_body(e: &DispatchError) -> (StatusCode, Json<serde_json::Value>) {
    (e.status_code(), Json(serde_json::json!({ "error": e.to_string() })))
}

pub async fn api_create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> impl IntoResponse {
    if state.robots.get(&req.robot_id).await.is_none() {
        return error_body(&DispatchError::UnknownRobot(req.robot_id)).into_response();
    }
    match state.tasks.create(&req.robot_id, req.steps).await {
        Ok(task) => {
            let steps = state.tasks.steps_of(&task.id).await;
            (StatusCode::CREATED, Json(TaskResponse { task, steps })).into_response()
        }
        Err(e) => error_body(&e).into_response(),
    }
}

pub async fn api_list_tasks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.tasks.list().await)
}

pub async fn api_get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match state.tasks.get(&task_id).await {
        Some(task) => {
            let steps = state.tasks.steps_of(&task_id).await;
            Json(TaskResponse { task, steps }).into_response()
        }
        None => error_body(&DispatchError::UnknownTask(task_id)).into_response(),
    }
}

pub async fn api_pause_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match state.tasks.pause(&task_id).await {
        Ok(task) => {
            // Externe Alarm-Anzeige setzen; das Gateway schreibt das Register.
            state.pause_alarm.store(true, Ordering::SeqCst);
            state.events.push(format!("Task {} pausiert.", task_id), "warning").await;
            Json(task).into_response()
        }
        Err(e) => error_body(&e).into_response(),
    }
}

pub async fn api_resume_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match state.tasks.resume(&task_id).await {
        Ok(task) => {
            if !state.tasks.any_paused().await {
                state.pause_alarm.store(false, Ordering::SeqCst);
            }
            state.events.push(format!("Task {} fortgesetzt.", task_id), "info").await;
            Json(task).into_response()
        }
        Err(e) => error_body(&e).into_response(),
    }
}

pub async fn api_cancel_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match state.tasks.cancel(&task_id).await {
        Ok(task) => {
            if !state.tasks.any_paused().await {
                state.pause_alarm.store(false, Ordering::SeqCst);
            }
            state.events.push(format!("Task {} abgebrochen.", task_id), "warning").await;
            Json(task).into_response()
        }
        Err(e) => error_body(&e).into_response(),
    }
}

/// Aktueller Task eines Fahrzeugs; 204 wenn keiner läuft.
pub async fn api_current_task(
    State(state): State<Arc<AppState>>,
    Path(robot_id): Path<String>,
) -> impl IntoResponse {
    match state.tasks.active_task_for(&robot_id).await {
        Some(task) => {
            let steps = state.tasks.steps_of(&task.id).await;
            Json(TaskResponse { task, steps }).into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Manueller Dispatch: Fahrzeugname + Zielstation -> Ein-Step-NAV-Task.
pub async fn api_manual_dispatch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ManualDispatchRequest>,
) -> impl IntoResponse {
    let Some(robot) = state.robots.by_name(&req.robot).await else {
        return error_body(&DispatchError::UnknownRobot(req.robot)).into_response();
    };
    let Some(station) = state.map.by_name(&req.station).map(|s| s.clone()) else {
        return error_body(&DispatchError::UnknownStation(req.station)).into_response();
    };

    if state.robots.station_occupied(&station.id, Some(&robot.id)).await {
        return error_body(&DispatchError::DestinationOccupied(station.name)).into_response();
    }

    match state.tasks.create(&robot.id, vec![StepDraft::nav(&station.id)]).await {
        Ok(task) => {
            state
                .events
                .push(format!("Manueller Dispatch: {} -> {}.", robot.name, station.name), "info")
                .await;
            let steps = state.tasks.steps_of(&task.id).await;
            (StatusCode::CREATED, Json(TaskResponse { task, steps })).into_response()
        }
        Err(e) => error_body(&e).into_response(),
    }
}
