use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Abstand der Sequenznummern bei der Task-Erzeugung. Der Zwischenraum
/// wird für zur Laufzeit eingeschobene Steps genutzt, Steps werden nie
/// umsortiert, nur mit höherer Seq nach dem laufenden Step eingefügt.
pub const SEQ_SPACING: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "PAUSED")]
    Paused,
    #[serde(rename = "CANCELED")]
    Canceled,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "DONE")]
    Done,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Canceled | TaskStatus::Failed | TaskStatus::Done)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELED")]
    Canceled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Failed | StepStatus::Canceled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepKind {
    #[serde(rename = "NAV")]
    Nav,
    #[serde(rename = "NAV_PRE")]
    NavPre,
    #[serde(rename = "JACK_UP")]
    JackUp,
    #[serde(rename = "JACK_DOWN")]
    JackDown,
    #[serde(rename = "JACK")]
    Jack,
    #[serde(rename = "WAIT_FREE_PATH")]
    WaitFreePath,
    #[serde(rename = "NAV_OR_BUFFER")]
    NavOrBuffer,
    #[serde(rename = "CHECK_BUFFER_BEFORE_NAV")]
    CheckBufferBeforeNav,
    #[serde(rename = "CHECK_BUFFER_WITHOUT_CHARGING")]
    CheckBufferWithoutCharging,
    #[serde(rename = "CHECK_BATTERY_AFTER_BUFFER")]
    CheckBatteryAfterBuffer,
    #[serde(rename = "FIND_EMPTY_B_BUFFER")]
    FindEmptyBBuffer,
    #[serde(rename = "FIND_EMPTY_B_CHARGE")]
    FindEmptyBCharge,
}

impl StepKind {
    /// Steps, deren Ziel in die Ziel-Konflikt-Prüfung eingeht.
    pub fn is_nav(&self) -> bool {
        matches!(self, StepKind::Nav | StepKind::NavPre)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepPayload {
    /// Ziel-Station (Id) für NAV-/Such-Steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Hubhöhe in Metern für JACK.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

impl StepPayload {
    pub fn target(station_id: &str) -> Self {
        Self { target: Some(station_id.to_string()), height: None }
    }

    pub fn height(h: f64) -> Self {
        Self { target: None, height: Some(h) }
    }
}

/// Noch nicht persistierter Step, wie ihn Dispatcher/Allocator bauen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDraft {
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default)]
    pub payload: StepPayload,
}

impl StepDraft {
    pub fn new(kind: StepKind, payload: StepPayload) -> Self {
        Self { kind, payload }
    }

    pub fn nav(station_id: &str) -> Self {
        Self::new(StepKind::Nav, StepPayload::target(station_id))
    }

    pub fn nav_pre(station_id: &str) -> Self {
        Self::new(StepKind::NavPre, StepPayload::target(station_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStep {
    pub id: String,
    pub task_id: String,
    pub seq: i64,
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub payload: StepPayload,
    pub status: StepStatus,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskStep {
    pub fn from_draft(task_id: &str, seq: i64, draft: StepDraft) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            seq,
            kind: draft.kind,
            payload: draft.payload,
            status: StepStatus::Pending,
            retry_count: 0,
            error: None,
        }
    }

    pub fn nav_target(&self) -> Option<&str> {
        if self.kind.is_nav() {
            self.payload.target.as_deref()
        } else {
            None
        }
    }
}

/// Ein Transportauftrag. Zentrale Invariante: pro Roboter höchstens ein
/// Task in einem nicht-terminalen Status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub robot_id: String,
    pub status: TaskStatus,
    /// Seq des aktuell auszuführenden Steps.
    pub current_seq: i64,
    pub created_at: DateTime<Local>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Local>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    pub fn new(robot_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            robot_id: robot_id.to_string(),
            status: TaskStatus::Pending,
            current_seq: SEQ_SPACING,
            created_at: Local::now(),
            finished_at: None,
            error: None,
        }
    }
}
