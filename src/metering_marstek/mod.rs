use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::Sender;

use crate::config::{ConfigBases, ConfigChange, MarstekDeviceConfig};
use crate::models::DeviceProtocol;
use crate::mqtt::ha_interface::{HaComponent, HaDiscover};
use crate::mqtt::{device_topic, publish_protocol_count, Transmission};
use crate::{get_config_or_panic, CONFIG};

pub mod utils;
pub mod structs;
pub mod codec;
pub mod transport;
pub mod client;
pub mod sink;
pub mod poller;
pub mod discovery;

use poller::{DevicePoller, PollerHandle};
use sink::MqttSink;
use transport::{Transport, UdpTransport};

#[derive(Error, Debug)]
pub enum MarstekError {
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("Timeout - No response from meter within {0} ms")]
    Timeout(u64),
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Runs one poller per enabled meter and keeps them in line with the configuration
pub struct MarstekManager {
    sender: Sender<Transmission>,
    config_change: tokio::sync::broadcast::Receiver<ConfigChange>,
    transport: Arc<dyn Transport>,
    pollers: HashMap<String, PollerHandle>,
    /* Device type last announced to Home Assistant, per meter */
    announced: HashMap<String, String>,
    ha_enabled: bool,
}

impl MarstekManager {
    pub fn new(sender: Sender<Transmission>) -> Self {
        let (config_change, ha_enabled) = {
            let c = CONFIG.read().unwrap();
            (c.get_change_receiver(), c.config.mqtt.ha_enabled)
        };
        return Self::with_parts(sender, config_change, Arc::new(UdpTransport::new()), ha_enabled);
    }

    pub fn with_parts(sender: Sender<Transmission>,
                      config_change: tokio::sync::broadcast::Receiver<ConfigChange>,
                      transport: Arc<dyn Transport>,
                      ha_enabled: bool) -> Self {
        return MarstekManager {
            sender,
            config_change,
            transport,
            pollers: HashMap::new(),
            announced: HashMap::new(),
            ha_enabled,
        }
    }

    pub async fn start_thread(&mut self) {
        info!("Starting Marstek thread");

        loop {
            let devices: Vec<MarstekDeviceConfig> = get_config_or_panic!("marstek", ConfigBases::Marstek);
            self.sync_devices(devices).await;

            publish_protocol_count(&self.sender, "marstek", self.pollers.len() as u32).await;
            info!("Marstek activated with {} meters, waiting for config changes", self.pollers.len());

            loop {
                match self.config_change.recv().await {
                    Ok(change) if change.base == "marstek" => break,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Missed {n} config changes, re-reading the config");
                        break;
                    }
                    Err(RecvError::Closed) => {
                        info!("Config channel closed, stopping all Marstek pollers");
                        self.stop_all().await;
                        return;
                    }
                }
            }
        }
    }

    /// Start, update or stop pollers so that exactly the enabled devices are polled
    pub async fn sync_devices(&mut self, devices: Vec<MarstekDeviceConfig>) {
        let wanted: HashMap<String, MarstekDeviceConfig> = devices
            .into_iter()
            .filter(|d| d.enabled)
            .map(|d| (d.name.clone(), d))
            .collect();

        let gone: Vec<String> = self.pollers.keys().filter(|n| !wanted.contains_key(*n)).cloned().collect();
        for name in gone {
            if let Some(handle) = self.pollers.remove(&name) {
                info!("Stopping poller of {name}");
                handle.stop().await;
            }
            self.announced.remove(&name);
        }

        for (name, conf) in wanted {
            self.announce(&conf).await;

            if let Some(handle) = self.pollers.get(&name) {
                if !handle.is_finished() {
                    /* The poller works out itself which settings changed */
                    debug!("Handing current settings to poller of {name}");
                    handle.update(conf).await;
                    continue;
                }
            }

            let sink = Arc::new(MqttSink::new(self.sender.clone(), name.clone()));
            let poller = DevicePoller::new(conf, self.transport.clone(), sink.clone(), sink);
            self.pollers.insert(name, PollerHandle::spawn(poller));
        }
    }

    /// Publish the HA device unless it is already announced with this device type
    async fn announce(&mut self, conf: &MarstekDeviceConfig) {
        if !self.ha_enabled || self.announced.get(&conf.name) == Some(&conf.device_type) {
            return;
        }

        let _ = self.sender.send(Transmission::AutoDiscovery(ha_discovery(conf))).await;
        self.announced.insert(conf.name.clone(), conf.device_type.clone());
    }

    pub async fn stop_all(&mut self) {
        for (_, handle) in self.pollers.drain() {
            handle.stop().await;
        }
        self.announced.clear();
    }

    pub fn device_count(&self) -> usize {
        self.pollers.len()
    }
}

/// Home Assistant device with the capabilities the sink publishes
pub fn ha_discovery(conf: &MarstekDeviceConfig) -> HaDiscover {
    let proto = format!("{:?}", DeviceProtocol::Marstek);
    let mut disc = HaDiscover::new(conf.name.clone(), "Marstek".to_string(), conf.device_type.clone(), proto.clone());
    disc.availability_topic = Some(format!("{}/availability", device_topic(&DeviceProtocol::Marstek, &conf.name)));

    let components = [
        HaComponent::new_power(conf.name.clone(), proto.clone(), "Power".to_string(), "power".to_string()),
        HaComponent::new_power(conf.name.clone(), proto.clone(), "Power delivery".to_string(), "power_delivery".to_string()),
        HaComponent::new_power(conf.name.clone(), proto.clone(), "Power production".to_string(), "power_production".to_string()),
        HaComponent::new_power(conf.name.clone(), proto.clone(), "Power L1".to_string(), "power_l1".to_string()),
        HaComponent::new_power(conf.name.clone(), proto.clone(), "Power L2".to_string(), "power_l2".to_string()),
        HaComponent::new_power(conf.name.clone(), proto.clone(), "Power L3".to_string(), "power_l3".to_string()),
        HaComponent::new_signal(conf.name.clone(), proto.clone(), "Signal strength".to_string(), "signal_strength".to_string()),
    ];

    for cmp in components {
        let key = cmp.object_id.clone();
        if let Ok(v) = serde_json::to_value(cmp) {
            disc.cmps.insert(key, v);
        }
    }

    disc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering_marstek::client::tests::{meter_reply, ScriptedTransport};

    fn device(name: &str) -> MarstekDeviceConfig {
        MarstekDeviceConfig::new(name.to_string(), "192.168.1.50".to_string(),
                                 "HMG50".to_string(), "HME-4".to_string(),
                                 "AABBCCDDEEFF".to_string(), "001122334455".to_string())
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(MarstekError::Timeout(1500).to_string(), "Timeout - No response from meter within 1500 ms");
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert!(matches!(MarstekError::from(io), MarstekError::Transport(_)));
    }

    #[test]
    fn test_ha_discovery() {
        let disc = ha_discovery(&device("garage"));
        assert_eq!(disc.cmps.len(), 7);
        assert_eq!(disc.state_topic, "marstek2mqtt/devs/Marstek/garage");
        assert_eq!(disc.availability_topic.as_deref(), Some("marstek2mqtt/devs/Marstek/garage/availability"));

        let json = serde_json::to_value(&disc).unwrap();
        assert_eq!(json["cmps"]["garage_power_delivery"]["value_template"], "{{ value_json.power_delivery }}");
        assert_eq!(json["cmps"]["garage_signal_strength"]["unit_of_measurement"], "dBm");
    }

    #[tokio::test]
    async fn test_sync_devices() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(100);
        let (_ctx, crx) = tokio::sync::broadcast::channel(4);
        let transport = Arc::new(ScriptedTransport::new(vec![]).then_always(meter_reply(12)));
        let mut manager = MarstekManager::with_parts(tx, crx, transport.clone(), true);

        let mut disabled = device("shed");
        disabled.enabled = false;
        manager.sync_devices(vec![device("garage"), device("attic"), disabled]).await;
        assert_eq!(manager.device_count(), 2);

        manager.sync_devices(vec![device("garage")]).await;
        assert_eq!(manager.device_count(), 1);

        manager.stop_all().await;
        assert_eq!(manager.device_count(), 0);

        let mut discoveries = 0;
        while let Ok(t) = rx.try_recv() {
            if let Transmission::AutoDiscovery(_) = t {
                discoveries += 1;
            }
        }
        assert_eq!(discoveries, 2);
    }

    #[tokio::test]
    async fn test_device_type_change_reannounces() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(100);
        let (_ctx, crx) = tokio::sync::broadcast::channel(4);
        let transport = Arc::new(ScriptedTransport::new(vec![]).then_always(meter_reply(12)));
        let mut manager = MarstekManager::with_parts(tx, crx, transport, true);

        let mut models = Vec::new();
        let mut conf = device("garage");
        manager.sync_devices(vec![conf.clone()]).await;

        /* Tuning changes keep the announced device */
        conf.poll_interval_seconds = 30;
        manager.sync_devices(vec![conf.clone()]).await;

        conf.device_type = "HMB50".to_string();
        manager.sync_devices(vec![conf.clone()]).await;
        manager.stop_all().await;

        while let Ok(t) = rx.try_recv() {
            if let Transmission::AutoDiscovery(disc) = t {
                models.push(serde_json::to_value(&disc).unwrap()["dev"]["model"].clone());
            }
        }
        assert_eq!(models, vec!["HMG50", "HMB50"]);
    }
}
