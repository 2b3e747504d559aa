use serde::{Deserialize, Serialize};

/// Verbindungszustand eines Hardware-Links (I/O-Controller, Tür-Aktor).
/// Kleines Zustandsmodell: Disconnected -> Connecting -> Connected,
/// bei Fehlern zurück auf Disconnected mit Cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}
