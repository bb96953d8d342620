use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{utils, MarstekError};

pub const DEFAULT_PORT: u16 = 12345;
pub const DEFAULT_TIMEOUT_MS: u64 = 1500;
pub const DEFAULT_RETRIES: u32 = 2;
pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 10;

/// Field names of a reply, in wire order
pub const RESPONSE_LABELS: [&str; 24] = [
    "meter_dev_type",
    "meter_mac_code",
    "hhm_dev_type",
    "hhm_mac_code",
    "A_phase_power",
    "B_phase_power",
    "C_phase_power",
    "total_power",
    "A_chrg_nb",
    "B_chrg_nb",
    "C_chrg_nb",
    "ABC_chrg_nb",
    "wifi_rssi",
    "info_idx",
    "x_chrg_power",
    "A_chrg_power",
    "B_chrg_power",
    "C_chrg_power",
    "ABC_chrg_power",
    "x_dchrg_power",
    "A_dchrg_power",
    "B_dchrg_power",
    "C_dchrg_power",
    "ABC_dchrg_power",
];

/// The four parameters selecting which meter a request addresses.
///
/// Both MAC addresses are stored normalized (12 uppercase hex characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    device_type: String,
    ct_type: String,
    battery_mac: String,
    ct_mac: String,
}

/// Type names travel as one pipe separated ASCII field
fn check_type_field(kind: &str, value: &str) -> Result<(), MarstekError> {
    if !value.is_ascii() || value.contains('|') {
        return Err(MarstekError::InvalidIdentity(format!(
            "{kind} must be ASCII without '|', got '{value}'"
        )));
    }
    Ok(())
}

impl DeviceIdentity {
    pub fn new(device_type: &str, ct_type: &str, battery_mac: &str, ct_mac: &str) -> Result<Self, MarstekError> {
        check_type_field("device_type", device_type)?;
        check_type_field("ct_type", ct_type)?;

        Ok(DeviceIdentity {
            device_type: device_type.to_string(),
            ct_type: ct_type.to_string(),
            battery_mac: utils::normalize_mac(battery_mac)?,
            ct_mac: utils::normalize_mac(ct_mac)?,
        })
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn ct_type(&self) -> &str {
        &self.ct_type
    }

    pub fn battery_mac(&self) -> &str {
        &self.battery_mac
    }

    pub fn ct_mac(&self) -> &str {
        &self.ct_mac
    }
}

/// Where and how often to talk to one meter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub timeout_ms: u64,
    pub retries: u32,
    pub poll_interval_seconds: u64,
    pub debug: bool,
}

impl ConnectionConfig {
    /// Build a config with every tuning value forced into its allowed range
    pub fn clamped(host: &str, port: u16, timeout_ms: u64, retries: u32, poll_interval_seconds: u64, debug: bool) -> Self {
        ConnectionConfig {
            host: host.to_string(),
            port: if port == 0 { DEFAULT_PORT } else { port },
            timeout_ms: timeout_ms.clamp(500, 5000),
            retries: retries.min(5),
            poll_interval_seconds: poll_interval_seconds.clamp(2, 60),
            debug,
        }
    }

    pub fn new(host: &str) -> Self {
        Self::clamped(host, DEFAULT_PORT, DEFAULT_TIMEOUT_MS, DEFAULT_RETRIES, DEFAULT_POLL_INTERVAL_SECONDS, false)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    Int(i64),
    Text(String),
}

impl TelemetryValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TelemetryValue::Int(v) => Some(*v),
            TelemetryValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TelemetryValue::Int(_) => None,
            TelemetryValue::Text(s) => Some(s),
        }
    }
}

impl From<&TelemetryValue> for serde_json::Value {
    fn from(value: &TelemetryValue) -> Self {
        match value {
            TelemetryValue::Int(v) => serde_json::Value::from(*v),
            TelemetryValue::Text(s) => serde_json::Value::from(s.clone()),
        }
    }
}

/// One decoded reply, values in the order of `RESPONSE_LABELS`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryRecord {
    values: Vec<TelemetryValue>,
}

impl TelemetryRecord {
    pub(crate) fn from_values(values: Vec<TelemetryValue>) -> Self {
        debug_assert_eq!(values.len(), RESPONSE_LABELS.len());
        TelemetryRecord { values }
    }

    pub fn get(&self, label: &str) -> Option<&TelemetryValue> {
        RESPONSE_LABELS.iter().position(|l| *l == label).map(|i| &self.values[i])
    }

    pub fn int(&self, label: &str) -> Option<i64> {
        self.get(label).and_then(|v| v.as_i64())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &TelemetryValue)> {
        RESPONSE_LABELS.iter().copied().zip(self.values.iter())
    }

    pub fn meter_dev_type(&self) -> Option<&str> {
        self.get("meter_dev_type").and_then(|v| v.as_str())
    }

    pub fn meter_mac_code(&self) -> Option<&str> {
        self.get("meter_mac_code").and_then(|v| v.as_str())
    }

    pub fn total_power(&self) -> Option<i64> {
        self.int("total_power")
    }

    pub fn wifi_rssi(&self) -> Option<i64> {
        self.int("wifi_rssi")
    }

    pub fn to_json_map(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        for (label, value) in self.iter() {
            map.insert(label.to_string(), value.into());
        }
        map
    }
}

impl Serialize for TelemetryRecord {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (label, value) in self.iter() {
            map.serialize_entry(label, value)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollState {
    pub consecutive_failures: u32,
    pub available: bool,
    pub last_poll_time: Option<DateTime<Utc>>,
}

impl Default for PollState {
    fn default() -> Self {
        PollState {
            consecutive_failures: 0,
            available: true,
            last_poll_time: None,
        }
    }
}
