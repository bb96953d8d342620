use lazy_static::lazy_static;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use serde_yml;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

use crate::metering_marstek::structs::{
    ConnectionConfig, DeviceIdentity, DEFAULT_POLL_INTERVAL_SECONDS, DEFAULT_PORT, DEFAULT_RETRIES, DEFAULT_TIMEOUT_MS,
};
use crate::metering_marstek::MarstekError;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read the config on config/e2m.yaml or e2m.yaml")]
    NotFound,
    #[error("Unable to access config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unable to parse config file: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("Unknown config base {0}")]
    UnknownBase(String),
}

fn mqtt_client_name_default() -> String { return "marstek2mqtt".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub ha_enabled: bool,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
}

fn marstek_port_default() -> u16 { DEFAULT_PORT }
fn marstek_poll_interval_default() -> u64 { DEFAULT_POLL_INTERVAL_SECONDS }
fn marstek_timeout_default() -> u64 { DEFAULT_TIMEOUT_MS }
fn marstek_retries_default() -> u32 { DEFAULT_RETRIES }
fn marstek_enabled_default() -> bool { true }

/// One CT meter as configured by the user
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct MarstekDeviceConfig {
    pub name: String,
    pub host: String,
    #[serde(default="marstek_port_default")]
    pub port: u16,
    pub device_type: String,
    pub battery_mac: String,
    pub ct_type: String,
    pub ct_mac: String,
    #[serde(default="marstek_poll_interval_default")]
    pub poll_interval_seconds: u64,
    #[serde(default="marstek_timeout_default")]
    pub timeout_ms: u64,
    #[serde(default="marstek_retries_default")]
    pub retries: u32,
    #[serde(default)]
    pub debug: bool,
    #[serde(default="marstek_enabled_default")]
    pub enabled: bool,
}

/// Settings whose change makes a cached request frame stale
pub const FRAME_KEYS: [&str; 5] = ["host", "device_type", "battery_mac", "ct_type", "ct_mac"];

impl MarstekDeviceConfig {
    pub fn new(name: String, host: String, device_type: String, ct_type: String, battery_mac: String, ct_mac: String) -> Self {
        return MarstekDeviceConfig {
            name,
            host,
            port: marstek_port_default(),
            device_type,
            battery_mac,
            ct_type,
            ct_mac,
            poll_interval_seconds: marstek_poll_interval_default(),
            timeout_ms: marstek_timeout_default(),
            retries: marstek_retries_default(),
            debug: false,
            enabled: true,
        }
    }

    /// Effective connection settings, out of range values are clamped
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig::clamped(&self.host, self.port, self.timeout_ms, self.retries, self.poll_interval_seconds, self.debug)
    }

    pub fn identity(&self) -> Result<DeviceIdentity, MarstekError> {
        DeviceIdentity::new(&self.device_type, &self.ct_type, &self.battery_mac, &self.ct_mac)
    }

    /// Names of the settings that differ between `self` and `other`
    pub fn changed_keys(&self, other: &MarstekDeviceConfig) -> Vec<&'static str> {
        let mut keys = Vec::new();
        if self.host != other.host { keys.push("host"); }
        if self.port != other.port { keys.push("port"); }
        if self.device_type != other.device_type { keys.push("device_type"); }
        if self.battery_mac != other.battery_mac { keys.push("battery_mac"); }
        if self.ct_type != other.ct_type { keys.push("ct_type"); }
        if self.ct_mac != other.ct_mac { keys.push("ct_mac"); }
        if self.poll_interval_seconds != other.poll_interval_seconds { keys.push("poll_interval_seconds"); }
        if self.timeout_ms != other.timeout_ms { keys.push("timeout_ms"); }
        if self.retries != other.retries { keys.push("retries"); }
        if self.debug != other.debug { keys.push("debug"); }
        if self.enabled != other.enabled { keys.push("enabled"); }
        keys
    }
}

#[derive(Deserialize, Serialize, Clone, PartialEq, Debug)]
pub enum ConfigOperation {
    ADD,
    DELETE,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ConfigChange {
    pub operation: ConfigOperation,
    pub base: String, /* mqtt or marstek */
}

#[derive(Clone)]
pub struct Callbacks {
    sender: tokio::sync::broadcast::Sender<ConfigChange>,
}

fn marstek_default() -> Vec<MarstekDeviceConfig> { return Vec::new(); }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    pub mqtt: MqttConfig,
    #[serde(default="marstek_default")]
    pub marstek: Vec<MarstekDeviceConfig>,
}

pub struct ConfigHolder {
    pub config: Config,
    pub callbacks: Callbacks,
    pub dirty: bool,
    pub base_path: PathBuf,
}

pub enum ConfigBases {
    Mqtt(MqttConfig),
    Marstek(Vec<MarstekDeviceConfig>),
}

impl ConfigHolder {
    /// Load `config/e2m.yaml`, falling back to `e2m.yaml` in the working directory
    pub fn load() -> Result<Self, ConfigError> {
        for dir in ["config", "."] {
            let base = PathBuf::from(dir);
            if base.join("e2m.yaml").is_file() {
                return Self::load_from(&base);
            }
        }
        Err(ConfigError::NotFound)
    }

    pub fn load_from(base_path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(base_path.join("e2m.yaml"))?;
        let mut holder = Self::from_yaml(&contents)?;
        holder.base_path = base_path.to_path_buf();
        info!("Config loaded from {}", base_path.join("e2m.yaml").display());
        Ok(holder)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let c: Config = serde_yml::from_str(contents)?;
        let (s, _) = tokio::sync::broadcast::channel(100);
        return Ok(ConfigHolder {
            config: c,
            callbacks: Callbacks { sender: s },
            dirty: false,
            base_path: PathBuf::from("."),
        })
    }

    pub fn save(&mut self) -> Result<(), ConfigError> {
        /* No need to write config if it's not dirty */
        if !self.dirty {
            debug!("Who ever called me, the config is not dirty");
            return Ok(());
        }

        let config_path = self.base_path.join("e2m.yaml");
        let backup_path = self.base_path.join("backup.yaml");

        if config_path.is_file() {
            if let Err(e) = fs::copy(&config_path, &backup_path) {
                error!("Backing up config failed, not replacing it");
                return Err(e.into());
            }
        }

        let x = serde_yml::to_string(&self.config)?;
        fs::write(&config_path, x.as_bytes())?;
        info!("New Config written");
        self.dirty = false;
        Ok(())
    }

    pub fn get_change_receiver(&self) -> tokio::sync::broadcast::Receiver<ConfigChange> {
        return self.callbacks.sender.subscribe();
    }

    pub fn is_dirty(&self) -> bool {
        return self.dirty;
    }

    pub fn update_config(&mut self, operation: ConfigOperation, new_data: ConfigBases) {
        let base: &str;

        match new_data {
            ConfigBases::Mqtt(mqtt_config) => {
                self.config.mqtt = mqtt_config;
                base = "mqtt";
            },
            ConfigBases::Marstek(marstek_configs) => {
                self.config.marstek = marstek_configs;
                base = "marstek";
            },
        }

        self.dirty = true;

        let _ = self.callbacks.sender.send(ConfigChange { operation: operation, base: base.to_string()});
    }

    pub fn get_copy(&self, base: &str) -> Result<ConfigBases, ConfigError> {
        match base {
            "mqtt" => { return Ok(ConfigBases::Mqtt(self.config.mqtt.clone())) },
            "marstek" => { return Ok(ConfigBases::Marstek(self.config.marstek.clone())) },
            _ => { Err(ConfigError::UnknownBase(base.to_string())) }
        }
    }

    pub fn get_complete_config(&self) -> Config {
        return self.config.clone();
    }
}

lazy_static! {
    pub static ref CONFIG: RwLock<ConfigHolder> = RwLock::new(
        ConfigHolder::load().unwrap_or_else(|e| panic!("{e}"))
    );
}

#[macro_export]
macro_rules! get_config_or_panic {
    ($base: expr, $pat: path) => {
        {
            let c = CONFIG.read().unwrap().get_copy($base).unwrap();
            if let $pat(a) = c {
                a
            } else {
                panic!(
                    "mismatch variant when cast to {}",
                    stringify!($pat));
            }
        }
    };
}
