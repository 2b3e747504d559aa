pub mod robot;
pub mod station;
pub mod status;
pub mod task;
pub mod telemetry;

pub use robot::{Robot, RobotPhase, RobotStatus};
pub use station::{Region, Station, StationClass};
pub use status::ConnectionStatus;
pub use task::{
    SEQ_SPACING, StepDraft, StepKind, StepPayload, StepStatus, Task, TaskStatus, TaskStep,
};
pub use telemetry::Telemetry;
