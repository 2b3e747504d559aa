pub mod allocator;
pub mod dispatcher;
pub mod event_log;
pub mod executor;
pub mod map_manager;
pub mod robot_manager;
pub mod steps;
pub mod system_api;
pub mod task_manager;

pub use allocator::PendingRetryQueue;
pub use dispatcher::{Dispatcher, SignalEvent};
pub use event_log::EventLog;
pub use executor::Executor;
pub use map_manager::MapManager;
pub use robot_manager::RobotManager;
pub use task_manager::TaskManager;
