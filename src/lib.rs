pub mod core;
pub mod hardware;
pub mod managers;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use core::config::{DeviceConfig, MapData, Settings};
use hardware::motion::MotionPort;
use hardware::registers::RegisterStore;
use managers::allocator::PendingRetryQueue;
use managers::event_log::EventLog;
use managers::map_manager::MapManager;
use managers::robot_manager::RobotManager;
use managers::task_manager::TaskManager;

/// Geteilter Zustand des Leitsystems. Alles, was Executor, Dispatcher,
/// Gateway und API gemeinsam sehen, hängt hier.
pub struct AppState {
    pub settings: Settings,
    pub map: MapManager,
    pub devices: Vec<DeviceConfig>,
    pub robots: RobotManager,
    pub tasks: TaskManager,
    pub registers: RegisterStore,
    pub motion: Arc<dyn MotionPort>,
    pub events: EventLog,
    pub pending: PendingRetryQueue,
    /// Externe Alarm-Anzeige; das Gateway spiegelt das Flag ins
    /// Alarm-Register.
    pub pause_alarm: AtomicBool,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(settings: Settings, map_data: MapData, motion: Arc<dyn MotionPort>) -> Arc<Self> {
        let map = MapManager::new(&map_data);
        let registers = RegisterStore::new(&map_data, &map);
        Arc::new(Self {
            map,
            devices: map_data.devices,
            robots: RobotManager::new(&map_data.robots),
            tasks: TaskManager::new(),
            registers,
            motion,
            events: EventLog::new(),
            pending: PendingRetryQueue::new(),
            pause_alarm: AtomicBool::new(false),
            started_at: Instant::now(),
            settings,
        })
    }
}
