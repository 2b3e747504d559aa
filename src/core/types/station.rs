use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Grobe Zwei-Teilung der Karte. Zwischen den Regionen liegt der
/// Übergabe-Korridor (Interchange -> Midpoint -> Interchange).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    A,
    B,
}

impl Region {
    pub fn other(&self) -> Region {
        match self {
            Region::A => Region::B,
            Region::B => Region::A,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::A => write!(f, "A"),
            Region::B => write!(f, "B"),
        }
    }
}

/// Typisierte Stations-Klassen. Die Kartendaten bleiben frei editierbar
/// (unbekannte Tags landen in `Other`), aber die Algorithmen arbeiten
/// gegen die festen Varianten.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StationClass {
    RegionA,
    RegionB,
    Buffer,
    Crossing,
    Waiting,
    Charging,
    Junction,
    Interchange,
    Midpoint,
    /// z.B. "door-A-1" -> Door("A-1")
    Door(String),
    Other(String),
}

impl FromStr for StationClass {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "A" => StationClass::RegionA,
            "B" => StationClass::RegionB,
            "buffer" => StationClass::Buffer,
            "crossing" => StationClass::Crossing,
            "waiting" => StationClass::Waiting,
            "charging" => StationClass::Charging,
            "junction" => StationClass::Junction,
            "interchange" => StationClass::Interchange,
            "midpoint" => StationClass::Midpoint,
            other => {
                if let Some(rest) = other.strip_prefix("door-") {
                    StationClass::Door(rest.to_string())
                } else {
                    StationClass::Other(other.to_string())
                }
            }
        })
    }
}

impl fmt::Display for StationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StationClass::RegionA => write!(f, "A"),
            StationClass::RegionB => write!(f, "B"),
            StationClass::Buffer => write!(f, "buffer"),
            StationClass::Crossing => write!(f, "crossing"),
            StationClass::Waiting => write!(f, "waiting"),
            StationClass::Charging => write!(f, "charging"),
            StationClass::Junction => write!(f, "junction"),
            StationClass::Interchange => write!(f, "interchange"),
            StationClass::Midpoint => write!(f, "midpoint"),
            StationClass::Door(d) => write!(f, "door-{}", d),
            StationClass::Other(o) => write!(f, "{}", o),
        }
    }
}

impl Serialize for StationClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for StationClass {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().expect("infallible"))
    }
}

/// Ein benannter Knoten der aktiven Karte. Innerhalb einer Kartenversion
/// unveränderlich; Lookup über Id oder Name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Station {
    pub id: String,
    pub name: String,
    pub classes: HashSet<StationClass>,
}

impl Station {
    pub fn new(id: &str, name: &str, classes: &[StationClass]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            classes: classes.iter().cloned().collect(),
        }
    }

    pub fn has_class(&self, class: &StationClass) -> bool {
        self.classes.contains(class)
    }

    pub fn region(&self) -> Option<Region> {
        if self.classes.contains(&StationClass::RegionA) {
            Some(Region::A)
        } else if self.classes.contains(&StationClass::RegionB) {
            Some(Region::B)
        } else {
            None
        }
    }

    /// Rollen-Klassen ohne die Regions-Tags. Grundlage für die
    /// Konflikt-Prüfung in WAIT_FREE_PATH (nur gleichklassige Kontention).
    pub fn role_classes(&self) -> HashSet<StationClass> {
        self.classes
            .iter()
            .filter(|c| !matches!(c, StationClass::RegionA | StationClass::RegionB))
            .cloned()
            .collect()
    }

    pub fn shares_role_class(&self, other: &Station) -> bool {
        !self.role_classes().is_disjoint(&other.role_classes())
    }

    pub fn is_door(&self) -> Option<&str> {
        self.classes.iter().find_map(|c| match c {
            StationClass::Door(d) => Some(d.as_str()),
            _ => None,
        })
    }

    /// Name der zugehörigen Vorstaging-Station ("X" -> "X_PRE").
    pub fn pre_name(&self) -> String {
        format!("{}_PRE", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_roundtrip_fixed_tags() {
        for tag in ["A", "B", "buffer", "crossing", "waiting", "charging", "junction", "interchange", "midpoint"] {
            let class: StationClass = tag.parse().unwrap();
            assert_eq!(class.to_string(), tag);
        }
    }

    #[test]
    fn door_tag_parses_with_suffix() {
        let class: StationClass = "door-A-1".parse().unwrap();
        assert_eq!(class, StationClass::Door("A-1".to_string()));
        assert_eq!(class.to_string(), "door-A-1");
    }

    #[test]
    fn unknown_tag_stays_open() {
        let class: StationClass = "maintenance".parse().unwrap();
        assert_eq!(class, StationClass::Other("maintenance".to_string()));
    }

    #[test]
    fn region_from_classes() {
        let st = Station::new("7", "B2", &[StationClass::RegionB, StationClass::Buffer]);
        assert_eq!(st.region(), Some(Region::B));
        assert!(st.has_class(&StationClass::Buffer));
    }

    #[test]
    fn role_intersection_ignores_region() {
        let a = Station::new("1", "AX", &[StationClass::RegionA, StationClass::Crossing]);
        let b = Station::new("2", "BX", &[StationClass::RegionB, StationClass::Crossing]);
        let c = Station::new("3", "B1", &[StationClass::RegionB, StationClass::Buffer]);
        assert!(a.shares_role_class(&b));
        assert!(!a.shares_role_class(&c));
    }
}
