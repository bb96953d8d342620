/*
    Pairing support: find out which device/CT type combination a meter answers to.

    The meter only replies when the request carries a type combination it knows, the MAC
    addresses may be zero while probing.
*/

use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;

use super::client::MarstekClient;
use super::structs::{ConnectionConfig, DeviceIdentity, TelemetryRecord, DEFAULT_PORT};
use super::transport::Transport;
use super::MarstekError;
use crate::config::MarstekDeviceConfig;

pub const PLACEHOLDER_MAC: &str = "000000000000";
pub const DISCOVERY_TIMEOUT_MS: u64 = 2000;

/// (device type, CT type) combinations to probe, most common first
pub const DISCOVERY_CANDIDATES: [(&str, &str); 4] = [
    ("HMG50", "HME-4"),
    ("HMG50", "HME-3"),
    ("HMB50", "HME-4"),
    ("HMA50", "HME-4"),
];

/// Outcome of a successful probe
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredMeter {
    pub host: String,
    pub device_type: String,
    pub ct_type: String,
    pub meter_dev_type: Option<String>,
    pub meter_mac_code: Option<String>,
    pub record: TelemetryRecord,
}

impl DiscoveredMeter {
    /// Config entry for a new device, MACs stay placeholders until the user enters them
    pub fn to_device_config(&self, name: Option<String>) -> MarstekDeviceConfig {
        let name = name.unwrap_or_else(|| {
            format!("Marstek {}", self.meter_dev_type.clone().unwrap_or_else(|| self.device_type.clone()))
        });
        MarstekDeviceConfig::new(name, self.host.clone(), self.device_type.clone(), self.ct_type.clone(),
                                 PLACEHOLDER_MAC.to_string(), PLACEHOLDER_MAC.to_string())
    }
}

/// Probe `host` with every candidate until one answers
pub async fn discover(transport: Arc<dyn Transport>, host: &str) -> Result<DiscoveredMeter, MarstekError> {
    let config = ConnectionConfig {
        host: host.to_string(),
        port: DEFAULT_PORT,
        timeout_ms: DISCOVERY_TIMEOUT_MS,
        retries: 0,
        poll_interval_seconds: 0,
        debug: true,
    };
    let mut client = MarstekClient::new(transport).with_log_prefix(format!("[discover@{host}]"));
    let mut last_error = None;

    for (device_type, ct_type) in DISCOVERY_CANDIDATES {
        info!("[discover@{host}] Trying config: {device_type}/{ct_type}");
        let identity = DeviceIdentity::new(device_type, ct_type, PLACEHOLDER_MAC, PLACEHOLDER_MAC)?;

        match client.request(&config, &identity).await {
            Ok(record) => {
                info!("[discover@{host}] Success with config: {device_type}/{ct_type}");
                return Ok(DiscoveredMeter {
                    host: host.to_string(),
                    device_type: device_type.to_string(),
                    ct_type: ct_type.to_string(),
                    meter_dev_type: record.meter_dev_type().map(|s| s.to_string()),
                    meter_mac_code: record.meter_mac_code().map(|s| s.to_string()),
                    record,
                });
            }
            Err(e) => {
                info!("[discover@{host}] Config failed: {e}");
                last_error = Some(e);
            }
        }
    }

    warn!("[discover@{host}] All configs failed");
    Err(last_error.unwrap_or(MarstekError::Timeout(DISCOVERY_TIMEOUT_MS)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering_marstek::client::tests::{meter_reply, ScriptedTransport};
    use crate::metering_marstek::codec;
    use std::time::Duration;

    #[tokio::test]
    async fn test_third_candidate_wins() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(MarstekError::Timeout(2000)),
            Ok(vec![0x01]),
            Ok(meter_reply(99)),
        ]));

        let found = discover(transport.clone(), "192.168.1.77").await.unwrap();
        assert_eq!(found.device_type, "HMB50");
        assert_eq!(found.ct_type, "HME-4");
        assert_eq!(found.meter_dev_type.as_deref(), Some("HMG50"));
        assert_eq!(found.meter_mac_code.as_deref(), Some("aabbccddeeff"));
        assert_eq!(found.record.total_power(), Some(99));

        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|(_, host, port, timeout)| {
            host == "192.168.1.77" && *port == 12345 && *timeout == Duration::from_millis(2000)
        }));
        let candidate = DeviceIdentity::new("HMG50", "HME-3", PLACEHOLDER_MAC, PLACEHOLDER_MAC).unwrap();
        assert_eq!(calls[1].0, codec::build_request(&candidate));
    }

    #[tokio::test]
    async fn test_reports_last_error() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(MarstekError::Timeout(2000)),
            Err(MarstekError::Timeout(2000)),
            Err(MarstekError::Timeout(2000)),
            Ok(vec![0x01, 0x02, 0x03]),
        ]));

        let res = discover(transport.clone(), "192.168.1.77").await;
        assert!(matches!(res, Err(MarstekError::MalformedResponse(_))));
        assert_eq!(transport.call_count(), DISCOVERY_CANDIDATES.len());
    }

    #[tokio::test]
    async fn test_device_config_from_discovery() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(meter_reply(1))]));
        let found = discover(transport, "10.0.0.5").await.unwrap();

        let conf = found.to_device_config(None);
        assert_eq!(conf.name, "Marstek HMG50");
        assert_eq!(conf.host, "10.0.0.5");
        assert_eq!(conf.port, 12345);
        assert_eq!(conf.ct_type, "HME-4");
        assert_eq!(conf.poll_interval_seconds, 10);
        assert_eq!(conf.timeout_ms, 1500);
        assert_eq!(conf.retries, 2);
        assert!(!conf.debug);
    }
}
