use std::fs;
use std::path::PathBuf;
use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::core::types::{Station, StationClass};

// --- TUNING / INFRASTRUKTUR ---

/// Alle Stellschrauben des Leitsystems. Defaults entsprechen dem
/// Produktiv-Setup; Tests drehen die Wartezeiten auf Millisekunden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub http_host: String,
    pub http_port: u16,

    /// Scheduler-Takt des Task-Executors.
    pub executor_tick_ms: u64,
    /// Poll-Intervall innerhalb blockierender Step-Wartezeiten.
    pub wait_poll_ms: u64,
    /// Poll-Takt des Hardware-Gateways.
    pub gateway_poll_ms: u64,

    /// Obergrenze für Ankunfts-/Hub-Bestätigung (harter Step-Fehler).
    pub nav_timeout_ms: u64,
    pub jack_timeout_ms: u64,
    /// Beruhigungszeit nach Ankunft.
    pub settle_ms: u64,
    /// Zusätzliche Beruhigungszeit nach NAV_PRE.
    pub pre_settle_ms: u64,
    /// Wartezeit, bevor eine belegte Puffer-Suche erneut pollt.
    pub buffer_retry_delay_ms: u64,

    /// Retry-Budget pro Step. Bewusst groß, um transiente
    /// Kommandofehler zu überleben.
    pub step_retry_max: u32,
    /// Anzahl der Hub-Wiederholungen bei fehlendem Ladungs-Nachweis.
    pub jack_recovery_max: u32,

    pub battery_low: f64,
    pub battery_emergency: f64,
    /// Mindest-Akku, damit ein Roboter an einer Ladestation als
    /// Abruf-Kandidat gilt.
    pub battery_call_min: f64,
    /// Schwelle für die "nur bei hohem Akku, wenn genau einer"-Regel.
    pub battery_call_high: f64,

    /// DI-Bit, das Auto/Manuell signalisiert (true = Handbetrieb).
    pub manual_mode_di: usize,
    /// Die beiden Sensoren, die eine aufgenommene Ladung bestätigen.
    pub payload_sensor_di: [usize; 2],
    pub jack_up_height: f64,

    /// TCP-Port des Kommando-Kanals auf dem Fahrzeug.
    pub motion_port: u16,
    pub motion_timeout_ms: u64,

    pub modbus_timeout_ms: u64,
    pub reconnect_cooldown_ms: u64,
    /// Länge des gelesenen Register-Blocks pro Gerät.
    pub register_block: u16,
    /// Mindestabstand zwischen Wiederholungs-Schreibzugriffen auf
    /// Tür-/Alarm-Ausgänge.
    pub output_resend_ms: u64,
    /// Gerät und Index des "Task pausiert/anomal"-Ausgangs.
    pub alarm_device: String,
    pub alarm_index: u16,

    /// Ab diesem Alter gilt ein Link/Roboter als getrennt.
    pub stale_after_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_host: "0.0.0.0".to_string(),
            http_port: 8000,
            executor_tick_ms: 500,
            wait_poll_ms: 500,
            gateway_poll_ms: 500,
            nav_timeout_ms: 30 * 60 * 1000,
            jack_timeout_ms: 30 * 60 * 1000,
            settle_ms: 2_000,
            pre_settle_ms: 3_000,
            buffer_retry_delay_ms: 3_000,
            step_retry_max: 200,
            jack_recovery_max: 2,
            battery_low: 35.0,
            battery_emergency: 15.0,
            battery_call_min: 40.0,
            battery_call_high: 70.0,
            manual_mode_di: 12,
            payload_sensor_di: [4, 5],
            jack_up_height: 0.06,
            motion_port: 19206,
            motion_timeout_ms: 3_000,
            modbus_timeout_ms: 1_000,
            reconnect_cooldown_ms: 5_000,
            register_block: 32,
            output_resend_ms: 3_000,
            alarm_device: "io-a".to_string(),
            alarm_index: 17,
            stale_after_secs: 30,
        }
    }
}

impl Settings {
    /// Bootstrapping über Defaults + Environment (Prefix AMRFLEET_).
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::builder()
            .add_source(config::Config::try_from(&Settings::default())?)
            .add_source(File::with_name(".env").required(false))
            .add_source(Environment::with_prefix("AMRFLEET").separator("__"))
            .build()?;

        let settings: Settings = loader.try_deserialize()?;

        if settings.wait_poll_ms > 1_000 {
            warn!("⚠️ wait_poll_ms > 1s: Abbrüche werden erst verspätet beobachtet!");
        }
        info!("✅ Settings geladen (Executor-Takt: {}ms, Gateway-Takt: {}ms)",
            settings.executor_tick_ms, settings.gateway_poll_ms);
        Ok(settings)
    }
}

// --- KARTEN- & GERÄTEDATEN ---

/// Eine Register-Route: physischer Taster an `index`, interpretiert als
/// Abruf (`call`) zur Station `to` oder als Transfer `from` -> `to`.
/// Stationsangaben per Name, wie in den Kartendateien üblich.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub index: u16,
    #[serde(default)]
    pub call: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: String,
}

/// Belegt-Flag eines Puffers im Register-Block seines Controllers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferFlag {
    pub station: String,
    pub index: u16,
}

/// Tür-Ausgang: öffnet, solange eine Station mit dem Tag `door-<door>`
/// belegt ist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoorOutput {
    pub door: String,
    pub index: u16,
}

/// Quittungs-Register für Abruf-Taster (Annahme/Ablehnung am Panel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRegisters {
    pub success_index: u16,
    pub failure_index: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub address: String,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub buffer_flags: Vec<BufferFlag>,
    #[serde(default)]
    pub doors: Vec<DoorOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackRegisters>,
}

fn default_unit_id() -> u8 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotSeed {
    pub id: String,
    pub name: String,
    pub address: String,
}

/// SSoT der aktiven Karte: Stationen, I/O-Controller, Fahrzeuge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapData {
    pub stations: Vec<Station>,
    pub devices: Vec<DeviceConfig>,
    pub robots: Vec<RobotSeed>,
}

impl Default for MapData {
    /// Werkszustand: das Zwei-Regionen-Layout mit je drei Puffern,
    /// Hauptknoten, Warte-, Lade- und Übergabestationen.
    fn default() -> Self {
        use StationClass::*;

        fn buffer(id: &str, name: &str, region: StationClass) -> Vec<Station> {
            vec![
                Station::new(id, name, &[region.clone(), Buffer]),
                Station::new(
                    &format!("{}0", id),
                    &format!("{}_PRE", name),
                    &[region, Other("pre".to_string())],
                ),
            ]
        }

        let mut stations = Vec::new();
        stations.extend(buffer("1", "A1", RegionA));
        stations.extend(buffer("2", "A2", RegionA));
        stations.extend(buffer("3", "A3", RegionA));
        stations.push(Station::new("4", "A4", &[RegionA, Junction, Door("A-1".into())]));
        stations.push(Station::new("5", "AW1", &[RegionA, Waiting]));
        stations.push(Station::new("6", "AX", &[RegionA, Interchange, Crossing]));
        stations.push(Station::new("7", "MID", &[Midpoint, Crossing]));
        stations.push(Station::new("8", "BX", &[RegionB, Interchange, Crossing]));
        stations.extend(buffer("9", "B1", RegionB));
        stations.extend(buffer("11", "B2", RegionB));
        stations.extend(buffer("13", "B3", RegionB));
        stations.push(Station::new("15", "B4", &[RegionB, Junction, Door("B-1".into())]));
        stations.push(Station::new("16", "BW1", &[RegionB, Waiting]));
        stations.extend(buffer("17", "BC1", RegionB));
        stations.extend(buffer("19", "BC2", RegionB));
        stations.extend(buffer("21", "AC1", RegionA));
        // Ladestationen sind oben als buffer() angelegt worden, Klassen korrigieren:
        for st in stations.iter_mut() {
            if matches!(st.name.as_str(), "BC1" | "BC2" | "AC1") {
                st.classes.remove(&Buffer);
                st.classes.insert(Charging);
            }
        }

        let devices = vec![
            DeviceConfig {
                id: "io-a".to_string(),
                address: "192.168.0.50:502".to_string(),
                unit_id: 1,
                routes: vec![
                    RouteConfig { index: 0, call: true, from: Some("A1".into()), to: "A4".into() },
                    RouteConfig { index: 1, call: false, from: Some("A1".into()), to: "A4".into() },
                    RouteConfig { index: 2, call: false, from: Some("A2".into()), to: "A4".into() },
                    RouteConfig { index: 3, call: false, from: Some("A3".into()), to: "A4".into() },
                    // Designierte Kreuzungs-Route Richtung Region B
                    RouteConfig { index: 4, call: false, from: Some("A4".into()), to: "B4".into() },
                ],
                buffer_flags: vec![
                    BufferFlag { station: "A1".into(), index: 20 },
                    BufferFlag { station: "A2".into(), index: 21 },
                    BufferFlag { station: "A3".into(), index: 22 },
                ],
                doors: vec![DoorOutput { door: "A-1".into(), index: 16 }],
                feedback: Some(FeedbackRegisters { success_index: 14, failure_index: 15 }),
            },
            DeviceConfig {
                id: "io-b".to_string(),
                address: "192.168.0.51:502".to_string(),
                unit_id: 1,
                routes: vec![
                    RouteConfig { index: 0, call: true, from: Some("B1".into()), to: "B4".into() },
                    RouteConfig { index: 1, call: false, from: Some("B1".into()), to: "B4".into() },
                    RouteConfig { index: 2, call: false, from: Some("B2".into()), to: "B4".into() },
                    RouteConfig { index: 3, call: false, from: Some("B3".into()), to: "B4".into() },
                    RouteConfig { index: 4, call: false, from: Some("B4".into()), to: "A4".into() },
                ],
                buffer_flags: vec![
                    BufferFlag { station: "B1".into(), index: 20 },
                    BufferFlag { station: "B2".into(), index: 21 },
                    BufferFlag { station: "B3".into(), index: 22 },
                ],
                doors: vec![DoorOutput { door: "B-1".into(), index: 16 }],
                feedback: Some(FeedbackRegisters { success_index: 14, failure_index: 15 }),
            },
        ];

        let robots = vec![
            RobotSeed { id: "amr-1".into(), name: "AMR-1".into(), address: "192.168.0.71".into() },
            RobotSeed { id: "amr-2".into(), name: "AMR-2".into(), address: "192.168.0.72".into() },
        ];

        Self { stations, devices, robots }
    }
}

/// Lädt die Karten-SSoT aus `data/`, fällt auf den Werkszustand zurück.
pub struct ConfigManager {
    pub file_path: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Self {
        let mut path = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        path.push("data");
        path.push("map__active__01.json");
        Self { file_path: path }
    }

    pub fn load_map(&self) -> MapData {
        if !self.file_path.exists() {
            warn!("⚠️ Kartendatei nicht gefunden ({:?}), nehme Default-Layout.", self.file_path);
            return MapData::default();
        }

        match fs::read_to_string(&self.file_path) {
            Ok(content) => match serde_json::from_str::<MapData>(&content) {
                Ok(data) => {
                    info!("📖 Karte aus {:?} geladen: {} Stationen, {} Geräte, {} Fahrzeuge.",
                        self.file_path, data.stations.len(), data.devices.len(), data.robots.len());
                    data
                }
                Err(e) => {
                    error!("❌ JSON-Fehler in Kartendatei: {}", e);
                    MapData::default()
                }
            },
            Err(e) => {
                error!("❌ Kartendatei nicht lesbar: {}", e);
                MapData::default()
            }
        }
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Region;

    #[test]
    fn default_map_has_two_regions_and_cross_routes() {
        let map = MapData::default();
        let a_buffers = map.stations.iter()
            .filter(|s| s.region() == Some(Region::A) && s.has_class(&StationClass::Buffer))
            .count();
        let b_buffers = map.stations.iter()
            .filter(|s| s.region() == Some(Region::B) && s.has_class(&StationClass::Buffer))
            .count();
        assert_eq!(a_buffers, 3);
        assert_eq!(b_buffers, 3);

        let cross_routes: Vec<_> = map.devices.iter()
            .flat_map(|d| &d.routes)
            .filter(|r| !r.call && matches!((r.from.as_deref(), r.to.as_str()), (Some("A4"), "B4") | (Some("B4"), "A4")))
            .collect();
        assert_eq!(cross_routes.len(), 2);
    }

    #[test]
    fn map_data_roundtrips_as_json() {
        let map = MapData::default();
        let json = serde_json::to_string_pretty(&map).unwrap();
        let back: MapData = serde_json::from_str(&json).unwrap();
        assert_eq!(back.stations.len(), map.stations.len());
        assert_eq!(back.devices.len(), map.devices.len());
    }
}
