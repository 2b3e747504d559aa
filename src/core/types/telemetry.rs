use serde::{Deserialize, Serialize};

/// Strukturierte Roboter-Telemetrie. Die Herstellerfelder, die wir nicht
/// auswerten, bleiben über `extra` erhalten (Forward-Kompatibilität).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Telemetry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velocity: Option<f64>,
    /// Digital-Eingänge des Fahrzeugs (Sensorleiste), Index = DI-Nummer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digital_inputs: Option<Vec<bool>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Telemetry {
    pub fn digital_input(&self, index: usize) -> Option<bool> {
        self.digital_inputs.as_ref().and_then(|di| di.get(index).copied())
    }
}
