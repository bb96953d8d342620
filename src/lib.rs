//! Bridge between Marstek CT energy meters and MQTT
//!
//! The meters are polled over their UDP request/response protocol, the readings
//! are mapped to power capabilities and published together with the meter's
//! availability and Home Assistant discovery messages.

pub mod models;
pub mod mqtt;
pub mod config;
pub mod metering_marstek;

// Re-export common types for easier access
pub use mqtt::{CALLBACKS, MeteringData};
pub use config::CONFIG;
pub use metering_marstek::MarstekManager;

pub fn get_unix_ts() -> u64 {
    return std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
}

pub fn get_id(protocol: String, meter_name: &String) -> String {
    return format!("{}-{}-{:?}", protocol, meter_name, get_unix_ts());
}
