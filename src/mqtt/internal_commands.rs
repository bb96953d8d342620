use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::Sender;

use crate::config::{ConfigBases, ConfigOperation, MarstekDeviceConfig};
use crate::metering_marstek::discovery::{self, DiscoveredMeter};
use crate::metering_marstek::transport::Transport;
use crate::mqtt::{PublishData, SubscribeData, Transmission, TOPIC_BASE};
use crate::{get_config_or_panic, CONFIG};

#[derive(Debug, PartialEq)]
pub enum Command {
    Restart,
    /// Probe a host for a meter
    Discover(String),
    /// Turn the last discovery of a host into a configured device
    Add { host: String, name: Option<String> },
    Unknown(String),
}

impl Command {
    pub fn parse(input: &str) -> Self {
        let mut parts = input.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("restart"), None) => Command::Restart,
            (Some("discover"), Some(host)) => Command::Discover(host.to_string()),
            (Some("add"), Some(host)) => {
                let name: Vec<&str> = parts.collect();
                Command::Add {
                    host: host.to_string(),
                    name: if name.is_empty() { None } else { Some(name.join(" ")) },
                }
            }
            _ => Command::Unknown(input.trim().to_string()),
        }
    }
}

pub struct CommandHandler {
    sender: Sender<Transmission>,
    transport: Arc<dyn Transport>,
    discovered: HashMap<String, DiscoveredMeter>,
}

impl CommandHandler {

    pub fn new(sender: Sender<Transmission>, transport: Arc<dyn Transport>) -> Self {
        return CommandHandler {
            sender: sender,
            transport,
            discovered: HashMap::new(),
        }
    }

    pub async fn start_thread(&mut self) {
        info!("Starting CommandHandler thread");
        /* We need to subscribe to an MQTT topic and wait for data to fill our buffers */
        let (sender, mut receiver) = tokio::sync::mpsc::channel(10);

        let register = Transmission::Subscribe(SubscribeData{
            topic: "mgt/command".to_string(),
            sender
        });

        let _ = self.sender.send(register).await;

        /* We are not using the HADiscover and HAComponent stuff here because we know the json  */
        let json = r###"
        {
          "dev": {
            "ids":"m2m_management",
            "name":"marstek2mqtt Bridge",
            "manufacturer":"marstek2mqtt",
            "model":"Bridge"
          },
          "o": {
            "name":"marstek2mqtt",
            "support_url":"https://energy2mqtt.org"
          },
          "cmps":{
            "restart": {
              "p":"button",
              "device_class":"restart",
              "name":"restart",
              "object_id":"bridge_restart",
              "payload_press":"restart",
              "unique_id":"m2m_management_bridge_restart",
              "command_topic": "marstek2mqtt/mgt/command"
            },
            "uptime": {
              "p":"sensor",
              "name":"uptime",
              "object_id":"uptime",
              "unique_id":"m2m_management_uptime",
              "state_topic": "marstek2mqtt/mgt/uptime",
              "state_class": "measurement",
              "unit_of_measurement": "s"
            }
          }
        }"###;

        let p = Transmission::Publish(PublishData {
            topic: "homeassistant/device/m2m_bridge/config".to_string(),
            payload: json.to_string(),
            qos: 0,
            retain: true,
        });

        /* Send our data */
        let _ = self.sender.send(p).await;

        info!("Start waiting for command messages");
        while let Some(c) = receiver.recv().await {
            info!("Received command {c}");

            match Command::parse(&c) {
                Command::Restart => {
                    /* if we exit that thread the rest will exit, too */
                    info!("Request to shutdown received");
                    return;
                }
                Command::Discover(host) => {
                    let payload = self.discover(&host).await;
                    self.reply("discover", payload).await;
                }
                Command::Add { host, name } => {
                    let payload = match self.add_device(&host, name).and_then(apply_new_device) {
                        Ok(name) => serde_json::json!({ "added": name }),
                        Err(e) => serde_json::json!({ "error": e }),
                    };
                    self.reply("add", payload).await;
                }
                Command::Unknown(cmd) => {
                    warn!("Unknown command {cmd}");
                }
            }
        }
    }

    /// Probe `host` and remember the result for a later `add`
    pub async fn discover(&mut self, host: &str) -> serde_json::Value {
        match discovery::discover(self.transport.clone(), host).await {
            Ok(found) => {
                let payload = serde_json::to_value(&found).unwrap_or_default();
                self.discovered.insert(host.to_string(), found);
                payload
            }
            Err(e) => {
                self.discovered.remove(host);
                serde_json::json!({ "error": e.to_string() })
            }
        }
    }

    /// Config entry for a host that was discovered before
    pub fn add_device(&self, host: &str, name: Option<String>) -> Result<MarstekDeviceConfig, String> {
        match self.discovered.get(host) {
            Some(found) => Ok(found.to_device_config(name)),
            None => Err("Please test the connection first".to_string()),
        }
    }

    async fn reply(&self, command: &str, payload: serde_json::Value) {
        let p = Transmission::Publish(PublishData {
            topic: format!("{TOPIC_BASE}/mgt/{command}"),
            payload: payload.to_string(),
            qos: 1,
            retain: false,
        });
        let _ = self.sender.send(p).await;
    }
}

/// Append a device to the running config, the Marstek manager picks it up from the change
fn apply_new_device(conf: MarstekDeviceConfig) -> Result<String, String> {
    let mut devices: Vec<MarstekDeviceConfig> = get_config_or_panic!("marstek", ConfigBases::Marstek);
    if devices.iter().any(|d| d.name == conf.name) {
        error!("A device named {} is already configured", conf.name);
        return Err(format!("A device named {} is already configured", conf.name));
    }

    info!("Adding device {} at {}", conf.name, conf.host);
    let name = conf.name.clone();
    devices.push(conf);
    match CONFIG.write() {
        Ok(mut c) => c.update_config(ConfigOperation::ADD, ConfigBases::Marstek(devices)),
        Err(e) => {
            error!("Config lock poisoned: {e}");
            return Err("Config is not writable".to_string());
        }
    }
    Ok(name)
}
