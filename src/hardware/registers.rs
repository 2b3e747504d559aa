use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};

use crate::core::config::MapData;
use crate::core::types::ConnectionStatus;
use crate::managers::map_manager::MapManager;

/// Letzter gelesener Register-Block eines I/O-Controllers.
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    pub values: Vec<u16>,
    pub status: ConnectionStatus,
    pub last_seen: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterWrite {
    pub device: String,
    pub index: u16,
    pub value: u16,
}

/// Geteilter Registerstand aller Geräte. Das Gateway schreibt die
/// Snapshots, Dispatcher/Allocator lesen sie; ausgehende Schreibzugriffe
/// (Quittungen) werden hier eingereiht und vom Gateway abgetragen.
pub struct RegisterStore {
    devices: RwLock<HashMap<String, DeviceSnapshot>>,
    writes: Mutex<VecDeque<RegisterWrite>>,
    /// Puffer-Station (Id) -> (Gerät, Register-Index) des Belegt-Flags.
    buffer_flags: HashMap<String, (String, u16)>,
}

impl RegisterStore {
    pub fn new(map_data: &MapData, map: &MapManager) -> Self {
        let mut buffer_flags = HashMap::new();
        let mut devices = HashMap::new();

        for device in &map_data.devices {
            devices.insert(device.id.clone(), DeviceSnapshot::default());
            for flag in &device.buffer_flags {
                if let Some(station) = map.by_name(&flag.station) {
                    buffer_flags.insert(station.id.clone(), (device.id.clone(), flag.index));
                } else {
                    tracing::warn!("⚠️ Belegt-Flag für unbekannte Station '{}' ignoriert.", flag.station);
                }
            }
        }

        Self {
            devices: RwLock::new(devices),
            writes: Mutex::new(VecDeque::new()),
            buffer_flags,
        }
    }

    // --- SNAPSHOTS (Schreiber: Gateway) ---

    pub async fn update_snapshot(&self, device: &str, values: Vec<u16>) {
        let mut devices = self.devices.write().await;
        let snap = devices.entry(device.to_string()).or_default();
        snap.values = values;
        snap.status = ConnectionStatus::Connected;
        snap.last_seen = Some(Instant::now());
    }

    pub async fn set_status(&self, device: &str, status: ConnectionStatus) {
        let mut devices = self.devices.write().await;
        devices.entry(device.to_string()).or_default().status = status;
    }

    // --- LESEZUGRIFFE ---

    pub async fn value(&self, device: &str, index: u16) -> Option<u16> {
        let devices = self.devices.read().await;
        let snap = devices.get(device)?;
        if snap.status != ConnectionStatus::Connected {
            return None;
        }
        snap.values.get(index as usize).copied()
    }

    /// Belegt-Flag eines Puffers laut Register. `None`, wenn für die
    /// Station kein Register konfiguriert oder das Gerät nicht
    /// erreichbar ist; dann zählt die Roboter-Position.
    pub async fn buffer_occupied(&self, station_id: &str) -> Option<bool> {
        let (device, index) = self.buffer_flags.get(station_id)?;
        self.value(device, *index).await.map(|v| v != 0)
    }

    pub async fn statuses(&self) -> HashMap<String, (ConnectionStatus, Option<u64>)> {
        let devices = self.devices.read().await;
        devices
            .iter()
            .map(|(id, snap)| {
                let age = snap.last_seen.map(|t| t.elapsed().as_secs());
                (id.clone(), (snap.status, age))
            })
            .collect()
    }

    // --- AUSGEHENDE SCHREIBZUGRIFFE ---

    pub async fn push_write(&self, device: &str, index: u16, value: u16) {
        self.writes.lock().await.push_back(RegisterWrite {
            device: device.to_string(),
            index,
            value,
        });
    }

    /// Holt die anstehenden Schreibzugriffe eines Geräts ab.
    pub async fn drain_writes(&self, device: &str) -> Vec<RegisterWrite> {
        let mut writes = self.writes.lock().await;
        let mut taken = Vec::new();
        let mut rest = VecDeque::new();
        while let Some(w) = writes.pop_front() {
            if w.device == device {
                taken.push(w);
            } else {
                rest.push_back(w);
            }
        }
        *writes = rest;
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RegisterStore {
        let map_data = MapData::default();
        let map = MapManager::new(&map_data);
        RegisterStore::new(&map_data, &map)
    }

    #[tokio::test]
    async fn buffer_flag_requires_connected_device() {
        let s = store();
        let map = MapManager::new(&MapData::default());
        let b1 = map.by_name("B1").unwrap();

        // Ohne Snapshot: kein Register-Urteil.
        assert_eq!(s.buffer_occupied(&b1.id).await, None);

        let mut values = vec![0u16; 32];
        values[20] = 1;
        s.update_snapshot("io-b", values).await;
        assert_eq!(s.buffer_occupied(&b1.id).await, Some(true));

        s.set_status("io-b", ConnectionStatus::Disconnected).await;
        assert_eq!(s.buffer_occupied(&b1.id).await, None);
    }

    #[tokio::test]
    async fn writes_drain_per_device() {
        let s = store();
        s.push_write("io-a", 14, 1).await;
        s.push_write("io-b", 15, 1).await;
        s.push_write("io-a", 4, 0).await;

        let a = s.drain_writes("io-a").await;
        assert_eq!(a.len(), 2);
        let b = s.drain_writes("io-b").await;
        assert_eq!(b.len(), 1);
        assert!(s.drain_writes("io-a").await.is_empty());
    }
}
