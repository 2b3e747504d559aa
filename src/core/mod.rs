pub mod config;
pub mod types;

// Re-Export, damit die Manager bequem über crate::core::Settings
// arbeiten können, obwohl die Structs tief in config/ sitzen.
pub use config::{ConfigManager, MapData, Settings};
