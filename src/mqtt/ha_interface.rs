use serde::Serialize;

use crate::mqtt::TOPIC_BASE;

#[derive(Serialize, Debug)]
pub struct HaDevice {
    ids: String,
    name: String,
    manufacturer: String,
    model: String,
}

#[derive(Serialize, Debug)]
pub struct HaOrigin {
    pub name: String,
    pub sw_version: String,
    pub support_url: String,
}

fn is_none_str(value: &String) -> bool {
    if value.is_empty() || value == "NONE" {
        return true;
    }
    return false;
}

#[derive(Serialize, Debug)]
pub struct HaComponent {
    pub p: String,
    pub name: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub device_class: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub unit_of_measurement: String,
    pub value_template: String,
    pub unique_id: String,
    pub object_id: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub state_class: String,
}

impl HaComponent {
    fn new_measurement(device: String, dclass: &str, uof: &str, proto: String, name: String, json_key: String) -> Self {
        let safe_name = name.replace(" ", "_");
        return HaComponent {
            p: "sensor".to_string(),
            name: name,
            device_class: dclass.to_string(),
            unit_of_measurement: uof.to_string(),
            value_template: format!("{{{{ value_json.{json_key} }}}}"),
            unique_id: format!("m2m_{proto}_{device}_{safe_name}").to_lowercase(),
            object_id: format!("{device}_{safe_name}").to_lowercase(),
            state_class: "measurement".to_string(),
        }
    }

    pub fn new_power(device: String, proto: String, name: String, json_key: String) -> Self {
        Self::new_measurement(device, "power", "W", proto, name, json_key)
    }

    pub fn new_signal(device: String, proto: String, name: String, json_key: String) -> Self {
        Self::new_measurement(device, "signal_strength", "dBm", proto, name, json_key)
    }
}

#[derive(Serialize, Debug)]
pub struct HaDiscover {
    pub dev: HaDevice,
    pub o: HaOrigin,
    pub cmps: serde_json::Map<String, serde_json::Value>,
    pub state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability_topic: Option<String>,
    pub qos: u32,
    #[serde(skip_serializing)]
    pub discover_topic: String,
}

impl HaDiscover {
    pub fn new(name: String, manu: String, model: String, proto: String) -> Self {
        return HaDiscover {
            discover_topic: format!("homeassistant/device/m2m_{}-{}/config", proto, name),
            dev: HaDevice {
                ids: format!("m2m_{}_{}", proto, name),
                name: name.clone(),
                manufacturer: manu,
                model: model,
            },
            o: HaOrigin {
                name: "marstek2mqtt".to_string(),
                sw_version: env!("CARGO_PKG_VERSION").to_string(),
                support_url: "https://energy2mqtt.org".to_string()
            },
            cmps: serde_json::Map::new(),
            state_topic: format!("{TOPIC_BASE}/devs/{}/{}", proto, name),
            availability_topic: None,
            qos: 2
        }
    }

    pub fn get_dev_id(&self) -> String {
        return self.dev.ids.clone();
    }
}
