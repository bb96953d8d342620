pub mod internal_commands;
pub mod ha_interface;

use std::collections::HashMap;
use lazy_static::lazy_static;
use tokio::sync::RwLock;
use crate::mqtt::ha_interface::HaDiscover;
use crate::config::MqttConfig;
use crate::models::DeviceProtocol;
use log::{debug, error, info};
use tokio::sync::mpsc::{Receiver, Sender};
use serde::{Serialize, Deserialize};
use serde_json;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::time::Instant;

/// Prefix of every topic we publish or subscribe below
pub const TOPIC_BASE: &str = "marstek2mqtt";

/// State topic of one meter, the availability and status topics hang below it
pub fn device_topic(protocol: &DeviceProtocol, meter_name: &str) -> String {
    format!("{TOPIC_BASE}/devs/{:?}/{}", protocol, meter_name)
}

/// Process wide state shared by the manager threads
#[derive(Clone)]
pub struct AppStatus {
    pub start_time: Instant,
}

impl AppStatus {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub enum TranmissionValueType{
    Now,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct MeteringData {
    pub id: String,
    pub meter_name: String,
    pub protocol: DeviceProtocol,
    pub transmission_time: u64,
    pub transmission_type: TranmissionValueType,
    pub metered_time: u64,
    pub metered_values: serde_json::Map<String, serde_json::Value>
}

impl MeteringData {
    pub fn new() -> Self {
        return MeteringData {
            id: "".to_string(),
            meter_name: "".to_string(),
            protocol: DeviceProtocol::Unknown,
            transmission_time: 0,
            transmission_type: TranmissionValueType::Now,
            metered_time: 0,
            metered_values: serde_json::Map::new()
        };
    }
}

#[derive(Debug)]
pub struct PublishData {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

#[derive(Debug)]
pub struct SubscribeData {
    pub topic: String,
    pub sender: tokio::sync::mpsc::Sender<String>
}

#[derive(Debug)]
pub enum Transmission {
    Metering(MeteringData),
    AutoDiscovery(HaDiscover),
    Subscribe(SubscribeData),
    Publish(PublishData)
}

pub struct MqttManager {
    rx: Receiver<Transmission>,
    exit_thread: bool,
    client: AsyncClient,
}

pub struct Callbacks {
    calls: HashMap<String, Vec<tokio::sync::mpsc::Sender<String>>>,
}

impl Callbacks {
    pub fn new() -> Self {
        return Callbacks { calls: HashMap::new() };
    }

    pub fn insert(&mut self, topic: String, callback: tokio::sync::mpsc::Sender<String>) {
        debug!("Adding callback to topic {topic}");
        self.calls.entry(topic).or_default().push(callback);
    }

    pub async fn send(&self, topic: &str, payload: String) {
        let Some(v) = self.calls.get(topic) else {
            debug!("Send for unkonwn topic {topic}");
            return;
        };

        for call in v {
            debug!("Sending to callback: {payload}");
            if call.send(payload.clone()).await.is_err() {
                debug!("Callback receiver of {topic} is gone");
            }
        }
    }

    pub fn get_topics(&self) -> Vec<String> {
        return self.calls.keys().cloned().collect();
    }
}

lazy_static! {
    pub static ref CALLBACKS: RwLock<Callbacks> = RwLock::new(Callbacks::new());
    pub static ref APP_STATUS: RwLock<AppStatus> = RwLock::new(AppStatus::new());
}

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

impl MqttManager {
    pub fn new(config: &MqttConfig) -> (Self, Sender<Transmission>) {
        let (mtx,mrx) = tokio::sync::mpsc::channel(100);

        info!("MQTT connection starting up");
        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        mqttoptions.set_credentials(config.user.clone(), config.pass.clone());

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        // Spawn a new task to handle the incomming commands
        let reconnect_c = client.clone();
        tokio::spawn( async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let topic = p.topic;
                        let payload = String::from_utf8_lossy(&p.payload).to_string();
                        debug!("Received MQTT command {payload:?}");

                        let callback = CALLBACKS.read().await;
                        callback.send(&topic, payload).await;
                    },
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected, resubscribing everything");

                        /* We are connected resubstribe to everything */
                        let callbacks = CALLBACKS.read().await.get_topics();
                        for callback in callbacks {
                            /* Move the resubscription to it's own task */
                            let client_clone = reconnect_c.clone();
                            tokio::spawn(async move {
                                if let Err(e) = client_clone.subscribe(callback.clone(), QoS::AtLeastOnce).await {
                                    error!("Resubscribing {callback} failed: {e}");
                                }
                            });
                        }
                    },
                    Ok(_) => {},
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting ", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        return (MqttManager {
            client: client,
            rx: mrx,
            exit_thread: false,
        }, mtx);
    }

    pub async fn start_thread(&mut self) {

        // Handle all the incomming metering stuff
        while !self.exit_thread {
            let Some(transmission) = self.rx.recv().await else {
                debug!("Reading returned none, we exit now");
                self.exit_thread = true;
                continue;
            };

            match transmission {
                Transmission::Metering(data) => {
                    info!("Metering data received: {}", data.id);
                    let raw = match serde_json::to_string(&data) {
                        Ok(r) => r,
                        Err(e) => { error!("Unable to serialize metering data: {e}"); continue; }
                    };
                    match self.client.publish(format!("{TOPIC_BASE}/raw"), QoS::AtLeastOnce, false, raw).await {
                        Err(e) => { error!("Error sending: {}", e); },
                        Ok(_) => { debug!("Send successfully"); }
                    }

                    let values = serde_json::Value::Object(data.metered_values).to_string();
                    let _ = self.client.publish(device_topic(&data.protocol, &data.meter_name),
                                                QoS::AtLeastOnce,
                                                false,
                                                values).await;
                },
                Transmission::AutoDiscovery(disc) => {
                    match serde_json::to_string(&disc) {
                        Ok(json) => { let _ = self.client.publish(disc.discover_topic.clone(), QoS::AtLeastOnce, true, json).await; },
                        Err(e) => { error!("Unable to serialize discovery of {}: {e}", disc.get_dev_id()); }
                    }
                },
                Transmission::Subscribe(subscribe_data) =>  {
                    let topic = format!("{TOPIC_BASE}/{}", subscribe_data.topic);
                    if self.client.subscribe(topic.clone(), QoS::AtLeastOnce).await.is_ok() {
                        CALLBACKS.write().await.insert(topic.clone(), subscribe_data.sender);
                        info!("Registered Callback {topic}");
                    }
                },
                Transmission::Publish(publish_data) => {
                    match self.client.publish(
                        publish_data.topic,
                        qos_from_u8(publish_data.qos),
                        publish_data.retain,
                        publish_data.payload
                    ).await {
                        Err(e) => { error!("Error publishing: {}", e); },
                        Ok(_) => { debug!("Published successfully"); }
                    }
                },
            };
        }

        info!("Thread exit, waiting");
    }
}

pub async fn get_app_status() -> AppStatus {
    APP_STATUS.read().await.clone()
}

pub async fn publish_uptime(mqtt_sender: &Sender<Transmission>) {
    let app_status = get_app_status().await;

    let uptime_publish = PublishData {
        topic: format!("{TOPIC_BASE}/mgt/uptime"),
        payload: app_status.uptime_seconds().to_string(),
        qos: 1,
        retain: true,
    };
    let _ = mqtt_sender.send(Transmission::Publish(uptime_publish)).await;
}

pub async fn publish_protocol_count(mqtt_sender: &Sender<Transmission>, protocol: &str, count: u32) {
    let count_publish = PublishData {
        topic: format!("{TOPIC_BASE}/mgt/{}/count", protocol),
        payload: count.to_string(),
        qos: 1,
        retain: true,
    };
    let _ = mqtt_sender.send(Transmission::Publish(count_publish)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_topic() {
        assert_eq!(device_topic(&DeviceProtocol::Marstek, "garage"), "marstek2mqtt/devs/Marstek/garage");
    }

    #[tokio::test]
    async fn test_callbacks_route_by_topic() {
        let mut callbacks = Callbacks::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel(2);
        callbacks.insert("marstek2mqtt/mgt/command".to_string(), tx);

        callbacks.send("marstek2mqtt/mgt/command", "restart".to_string()).await;
        callbacks.send("marstek2mqtt/other", "ignored".to_string()).await;

        assert_eq!(rx.recv().await.as_deref(), Some("restart"));
        assert!(rx.try_recv().is_err());
        assert_eq!(callbacks.get_topics(), vec!["marstek2mqtt/mgt/command".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uptime_message() {
        let status = AppStatus::new();
        tokio::time::advance(std::time::Duration::from_secs(42)).await;
        assert_eq!(status.uptime_seconds(), 42);

        let (tx, mut rx) = tokio::sync::mpsc::channel(2);
        publish_uptime(&tx).await;
        match rx.recv().await {
            Some(Transmission::Publish(p)) => {
                assert_eq!(p.topic, "marstek2mqtt/mgt/uptime");
                assert!(p.payload.parse::<u64>().is_ok());
                assert!(p.retain);
            }
            _ => panic!("expected publish"),
        }
    }

    #[tokio::test]
    async fn test_protocol_count_message() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(2);
        publish_protocol_count(&tx, "marstek", 3).await;
        match rx.recv().await {
            Some(Transmission::Publish(p)) => {
                assert_eq!(p.topic, "marstek2mqtt/mgt/marstek/count");
                assert_eq!(p.payload, "3");
                assert!(p.retain);
            }
            _ => panic!("expected publish"),
        }
    }
}
