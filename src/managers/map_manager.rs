use std::collections::HashMap;
use tracing::{info, warn};

use crate::core::config::MapData;
use crate::core::types::{Region, Station, StationClass};

/// Stations-Registry der aktiven Karte. Wird einmal beim Start geladen
/// und danach nur gelesen; Lookup über Id oder Name.
pub struct MapManager {
    stations: Vec<Station>,
    by_id: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

impl MapManager {
    pub fn new(map: &MapData) -> Self {
        let stations = map.stations.clone();
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();

        for (i, st) in stations.iter().enumerate() {
            if by_id.insert(st.id.clone(), i).is_some() {
                warn!("⚠️ Doppelte Stations-Id '{}' in der Karte!", st.id);
            }
            if by_name.insert(st.name.clone(), i).is_some() {
                warn!("⚠️ Doppelter Stations-Name '{}' in der Karte!", st.name);
            }
        }

        info!("🗺️ Karte aktiv: {} Stationen registriert.", stations.len());
        Self { stations, by_id, by_name }
    }

    pub fn all(&self) -> &[Station] {
        &self.stations
    }

    pub fn by_id(&self, id: &str) -> Option<&Station> {
        self.by_id.get(id).map(|&i| &self.stations[i])
    }

    pub fn by_name(&self, name: &str) -> Option<&Station> {
        self.by_name.get(name).map(|&i| &self.stations[i])
    }

    pub fn region_of(&self, station_id: &str) -> Option<Region> {
        self.by_id(station_id).and_then(|s| s.region())
    }

    fn with_class(&self, region: Option<Region>, class: &StationClass) -> Vec<&Station> {
        self.stations
            .iter()
            .filter(|s| s.has_class(class))
            .filter(|s| region.is_none() || s.region() == region)
            .collect()
    }

    pub fn buffers(&self, region: Region) -> Vec<&Station> {
        self.with_class(Some(region), &StationClass::Buffer)
    }

    pub fn charge_stations(&self, region: Region) -> Vec<&Station> {
        self.with_class(Some(region), &StationClass::Charging)
    }

    /// Hauptknoten der Region (genau einer pro Region erwartet).
    pub fn junction(&self, region: Region) -> Option<&Station> {
        self.with_class(Some(region), &StationClass::Junction).into_iter().next()
    }

    pub fn waiting(&self, region: Region) -> Option<&Station> {
        self.with_class(Some(region), &StationClass::Waiting).into_iter().next()
    }

    pub fn interchange(&self, region: Region) -> Option<&Station> {
        self.with_class(Some(region), &StationClass::Interchange).into_iter().next()
    }

    pub fn midpoint(&self) -> Option<&Station> {
        self.with_class(None, &StationClass::Midpoint).into_iter().next()
    }

    /// Stationen, die als Korridor-/Kreuzungspunkte markiert sind.
    pub fn crossing_stations(&self) -> Vec<&Station> {
        self.with_class(None, &StationClass::Crossing)
    }

    /// Vorstaging-Station ("X" -> "X_PRE"), falls die Karte eine führt.
    pub fn pre_of(&self, station: &Station) -> Option<&Station> {
        self.by_name(&station.pre_name())
    }

    pub fn door_stations(&self, door: &str) -> Vec<&Station> {
        self.stations
            .iter()
            .filter(|s| s.is_door() == Some(door))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> MapManager {
        MapManager::new(&MapData::default())
    }

    #[test]
    fn lookup_by_id_and_name_agree() {
        let m = manager();
        let by_name = m.by_name("B4").unwrap();
        let by_id = m.by_id(&by_name.id).unwrap();
        assert_eq!(by_id.name, "B4");
        assert_eq!(by_id.region(), Some(Region::B));
    }

    #[test]
    fn region_resolvers_find_the_fixed_roles() {
        let m = manager();
        assert_eq!(m.junction(Region::A).unwrap().name, "A4");
        assert_eq!(m.junction(Region::B).unwrap().name, "B4");
        assert_eq!(m.waiting(Region::B).unwrap().name, "BW1");
        assert_eq!(m.interchange(Region::A).unwrap().name, "AX");
        assert_eq!(m.midpoint().unwrap().name, "MID");
        assert_eq!(m.buffers(Region::B).len(), 3);
        assert_eq!(m.charge_stations(Region::B).len(), 2);
    }

    #[test]
    fn pre_companion_resolves() {
        let m = manager();
        let b1 = m.by_name("B1").unwrap();
        assert_eq!(m.pre_of(b1).unwrap().name, "B1_PRE");
        let mid = m.midpoint().unwrap();
        assert!(m.pre_of(mid).is_none());
    }

    #[test]
    fn door_stations_by_tag() {
        let m = manager();
        let doors = m.door_stations("B-1");
        assert_eq!(doors.len(), 1);
        assert_eq!(doors[0].name, "B4");
    }
}
