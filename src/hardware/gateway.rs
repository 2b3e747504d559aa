use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::core::config::{DeviceConfig, RouteConfig};
use crate::core::types::ConnectionStatus;
use crate::hardware::modbus::ModbusLink;
use crate::managers::dispatcher::SignalEvent;
use crate::AppState;

/// Startet je I/O-Controller eine eigene Poll-Schleife. Die Schleifen
/// teilen sich nur den RegisterStore und den Event-Kanal.
pub struct Gateway {
    state: Arc<AppState>,
    tx: mpsc::Sender<SignalEvent>,
}

impl Gateway {
    pub fn new(state: Arc<AppState>, tx: mpsc::Sender<SignalEvent>) -> Self {
        Self { state, tx }
    }

    pub fn spawn_all(&self) {
        for device in self.state.devices.clone() {
            info!("🔌 Gateway-Schleife für {} ({}) gestartet.", device.id, device.address);
            tokio::spawn(device_loop(Arc::clone(&self.state), device, self.tx.clone()));
        }
    }
}

/// Flanken-Erkennung: Register war 0 und ist jetzt 1.
fn rising_edges<'a>(prev: &[u16], curr: &[u16], routes: &'a [RouteConfig]) -> Vec<&'a RouteConfig> {
    routes
        .iter()
        .filter(|r| {
            let i = r.index as usize;
            let was = prev.get(i).copied().unwrap_or(0) != 0;
            let now = curr.get(i).copied().unwrap_or(0) != 0;
            now && !was
        })
        .collect()
}

fn route_event(device: &str, route: &RouteConfig) -> Option<SignalEvent> {
    if route.call {
        Some(SignalEvent::Call {
            device: device.to_string(),
            target: route.to.clone(),
            source_hint: route.from.clone(),
        })
    } else if let Some(from) = route.from.clone() {
        Some(SignalEvent::Transfer { device: device.to_string(), from, to: route.to.clone() })
    } else {
        warn!("⚠️ Route an Index {} ohne 'from' und ohne call-Flag, ignoriert.", route.index);
        None
    }
}

async fn device_loop(state: Arc<AppState>, device: DeviceConfig, tx: mpsc::Sender<SignalEvent>) {
    let io_timeout = Duration::from_millis(state.settings.modbus_timeout_ms);
    let cooldown = Duration::from_millis(state.settings.reconnect_cooldown_ms);
    let mut link = ModbusLink::new(&device.address, device.unit_id, io_timeout);
    let mut interval = tokio::time::interval(Duration::from_millis(state.settings.gateway_poll_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut prev: Option<Vec<u16>> = None;
    // Ausgang -> zuletzt geschriebener Wert und Zeitpunkt.
    let mut outputs: HashMap<u16, (u16, Instant)> = HashMap::new();

    loop {
        interval.tick().await;

        if !link.is_connected() {
            state.registers.set_status(&device.id, ConnectionStatus::Connecting).await;
            if let Err(e) = link.connect().await {
                state.registers.set_status(&device.id, ConnectionStatus::Disconnected).await;
                warn!("⚠️ {} nicht erreichbar: {}. Neuer Versuch nach Cooldown.", device.id, e);
                prev = None;
                tokio::time::sleep(cooldown).await;
                continue;
            }
            info!("✅ {} verbunden.", device.id);
        }

        let mut values = match link.read_holding(0, state.settings.register_block).await {
            Ok(v) => v,
            Err(e) => {
                warn!("⚠️ Lesefehler an {}: {}. Verbindung wird neu aufgebaut.", device.id, e);
                state.registers.set_status(&device.id, ConnectionStatus::Disconnected).await;
                link.reset();
                prev = None;
                tokio::time::sleep(cooldown).await;
                continue;
            }
        };
        state.registers.update_snapshot(&device.id, values.clone()).await;

        match &prev {
            Some(prev_values) => {
                for route in rising_edges(prev_values, &values, &device.routes) {
                    // Flanke immer löschen; der Controller hält das
                    // Signal, bis wir zurückschreiben.
                    if let Err(e) = link.write_single(route.index, 0).await {
                        warn!("⚠️ Flanke an {}:{} nicht löschbar: {}", device.id, route.index, e);
                        link.reset();
                    }
                    values[route.index as usize] = 0;

                    if let Some(event) = route_event(&device.id, route) {
                        if tx.send(event).await.is_err() {
                            warn!("⚠️ Dispatcher-Kanal geschlossen, Flanke verworfen.");
                        }
                    }
                }
            }
            None => {
                // Erste Lesung nach (Re-)Connect: hängengebliebene
                // Taster löschen, ohne sie auszuführen.
                for route in &device.routes {
                    let i = route.index as usize;
                    if values.get(i).copied().unwrap_or(0) != 0 {
                        warn!("⚠️ Altlast an {}:{} beim Verbinden gelöscht.", device.id, route.index);
                        if link.write_single(route.index, 0).await.is_err() {
                            link.reset();
                        }
                        values[i] = 0;
                    }
                }
            }
        }
        prev = Some(values);

        // Eingereihte Quittungen abtragen.
        for w in state.registers.drain_writes(&device.id).await {
            if let Err(e) = link.write_single(w.index, w.value).await {
                warn!("⚠️ Quittung {}:{} nicht schreibbar: {}", device.id, w.index, e);
                link.reset();
            }
        }

        // Türen: offen, solange eine zugehörige Station belegt ist.
        for door in &device.doors {
            let mut occupied = false;
            for station in state.map.door_stations(&door.door) {
                if state.robots.station_occupied(&station.id, None).await {
                    occupied = true;
                    break;
                }
            }
            write_output(&mut link, &mut outputs, door.index, occupied as u16, &state).await;
        }

        // Externer Alarm-Ausgang (pausierte/anomale Tasks).
        if device.id == state.settings.alarm_device {
            let desired = state.pause_alarm.load(Ordering::SeqCst) as u16;
            write_output(&mut link, &mut outputs, state.settings.alarm_index, desired, &state).await;
        }
    }
}

/// Schreibt einen Ausgang nur bei Wertänderung oder nach Ablauf des
/// Wiederhol-Cooldowns, damit die Hardware nicht flattert.
async fn write_output(
    link: &mut ModbusLink,
    outputs: &mut HashMap<u16, (u16, Instant)>,
    index: u16,
    desired: u16,
    state: &AppState,
) {
    let resend = Duration::from_millis(state.settings.output_resend_ms);
    let due = match outputs.get(&index) {
        Some((last, at)) => *last != desired || at.elapsed() >= resend,
        None => true,
    };
    if !due {
        return;
    }
    match link.write_single(index, desired).await {
        Ok(()) => {
            outputs.insert(index, (desired, Instant::now()));
        }
        Err(e) => {
            warn!("⚠️ Ausgang {} nicht schreibbar: {}", index, e);
            link.reset();
        }
    }
}
