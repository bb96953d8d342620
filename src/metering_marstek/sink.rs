use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc::Sender;

use super::structs::TelemetryRecord;
use crate::models::DeviceProtocol;
use crate::mqtt::{device_topic, PublishData, Transmission};
use crate::{get_id, get_unix_ts, MeteringData};

/// Receives every successfully decoded reply
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn publish_telemetry(&self, record: &TelemetryRecord);
}

/// Receives availability transitions. Both calls must be safe to repeat.
#[async_trait]
pub trait AvailabilitySink: Send + Sync {
    async fn set_available(&self);
    async fn set_unavailable(&self, reason: &str);
}

/// Host facing values derived from a record.
///
/// Positive total power is delivery (import), negative is production (export).
/// Text values are skipped, the meter reports empty strings for fields it does not know.
pub fn capability_values(record: &TelemetryRecord) -> serde_json::Map<String, serde_json::Value> {
    let mut caps = serde_json::Map::new();

    if let Some(total) = record.total_power() {
        caps.insert("power".to_string(), total.into());
        caps.insert("power_delivery".to_string(), total.max(0).into());
        caps.insert("power_production".to_string(), total.saturating_neg().max(0).into());
    }

    if let Some(rssi) = record.wifi_rssi() {
        caps.insert("signal_strength".to_string(), rssi.into());
    }

    for (cap, label) in [("power_l1", "A_phase_power"), ("power_l2", "B_phase_power"), ("power_l3", "C_phase_power")] {
        if let Some(v) = record.int(label) {
            caps.insert(cap.to_string(), v.into());
        }
    }

    caps
}

/// Sink forwarding everything to the MQTT thread
#[derive(Clone)]
pub struct MqttSink {
    sender: Sender<Transmission>,
    meter_name: String,
}

impl MqttSink {
    pub fn new(sender: Sender<Transmission>, meter_name: String) -> Self {
        MqttSink { sender, meter_name }
    }

    async fn publish(&self, suffix: &str, payload: String) {
        let p = PublishData {
            topic: format!("{}/{suffix}", device_topic(&DeviceProtocol::Marstek, &self.meter_name)),
            payload,
            qos: 1,
            retain: true,
        };
        if self.sender.send(Transmission::Publish(p)).await.is_err() {
            debug!("MQTT thread is gone, dropping {suffix} update for {}", self.meter_name);
        }
    }
}

#[async_trait]
impl TelemetrySink for MqttSink {
    async fn publish_telemetry(&self, record: &TelemetryRecord) {
        let mut meter_data = MeteringData::new();
        meter_data.meter_name = self.meter_name.clone();
        meter_data.protocol = DeviceProtocol::Marstek;
        meter_data.id = get_id("marstek".to_string(), &self.meter_name);
        meter_data.transmission_time = get_unix_ts();
        meter_data.metered_time = meter_data.transmission_time;
        meter_data.metered_values = capability_values(record);
        meter_data.metered_values.insert("raw".to_string(), record.to_json_map().into());

        if self.sender.send(Transmission::Metering(meter_data)).await.is_err() {
            debug!("MQTT thread is gone, dropping reading of {}", self.meter_name);
        }
    }
}

#[async_trait]
impl AvailabilitySink for MqttSink {
    async fn set_available(&self) {
        self.publish("availability", "online".to_string()).await;
        self.publish("status", "".to_string()).await;
    }

    async fn set_unavailable(&self, reason: &str) {
        self.publish("availability", "offline".to_string()).await;
        self.publish("status", reason.to_string()).await;
    }
}
