//! Maps decoded values onto Home Assistant's MQTT discovery scheme.
//!
//! Every parameter becomes a `sensor` entity. Its discovery config is published retained under
//! `homeassistant/sensor/<main_uid>/<object_id>/config` and its readings under the sibling `state` topic.

use serde::Serialize;

use crate::modbus::DecodedValue;
use crate::settings::UserSettings;

pub const DISCOVERY_PREFIX: &str = "homeassistant";

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

/// Lowercase ASCII alphanumerics, every other run of characters collapsed into `_`.
pub fn object_id(name: &str) -> String {
    let mut id = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            id.push(c.to_ascii_lowercase());
        } else if !id.is_empty() && !id.ends_with('_') {
            id.push('_');
        }
    }
    if id.ends_with('_') {
        id.pop();
    }
    id
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Device {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct SensorConfig<'a> {
    pub name: &'a str,
    pub unique_id: String,
    pub object_id: String,
    pub state_topic: String,
    pub availability_topic: &'a str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<&'a str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<&'a str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<&'a str>,

    pub device: &'a Device,
}

/// Topic layout and device description for one meter.
#[derive(Clone, Debug)]
pub struct Sensors {
    main_uid: String,
    availability_topic: String,
    device: Device,
}

impl Sensors {
    pub fn new(settings: &UserSettings) -> Self {
        let main_uid = settings.mqtt.main_uid.clone();
        let meter = &settings.energy_meter;

        Self {
            availability_topic: format!("{}/{}/status", env!("CARGO_PKG_NAME"), main_uid),
            device: Device {
                identifiers: vec![main_uid.clone()],
                name: meter.verbose_name.clone(),
                manufacturer: meter.manufacturer.clone(),
                model: meter.name.clone(),
            },
            main_uid,
        }
    }

    pub fn availability_topic(&self) -> &str {
        &self.availability_topic
    }

    fn topic(&self, object_id: &str, leaf: &str) -> String {
        format!(
            "{}/sensor/{}/{}/{}",
            DISCOVERY_PREFIX, self.main_uid, object_id, leaf
        )
    }

    pub fn config_topic(&self, value: &DecodedValue) -> String {
        self.topic(&object_id(&value.name), "config")
    }

    pub fn state_topic(&self, value: &DecodedValue) -> String {
        self.topic(&object_id(&value.name), "state")
    }

    pub fn config<'a>(&'a self, value: &'a DecodedValue) -> SensorConfig<'a> {
        let object_id = object_id(&value.name);

        SensorConfig {
            name: &value.name,
            unique_id: format!("{}-{}", self.main_uid, object_id),
            state_topic: self.topic(&object_id, "state"),
            object_id,
            availability_topic: &self.availability_topic,
            device_class: value.device_class.as_deref(),
            state_class: value.state_class.as_deref(),
            unit_of_measurement: value.unit.as_deref(),
            device: &self.device,
        }
    }

    pub fn config_payload(&self, value: &DecodedValue) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.config(value))?)
    }

    pub fn state_payload(&self, value: &DecodedValue) -> String {
        value.value.to_string()
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn object_id_slugs() {
    assert_eq!(object_id("Energy Counter Total"), "energy_counter_total");
    assert_eq!(object_id("  Power (L1) -- W "), "power_l1_w");
    assert_eq!(object_id("voltage"), "voltage");
    assert_eq!(object_id("Spannung Ü"), "spannung");
}

#[test]
fn sensor_discovery_payload() {
    use crate::modbus::Magnitude;
    use serde_json::json;

    let sensors = Sensors::new(&UserSettings::default());
    let value = DecodedValue {
        name: "Energy Counter Total".to_owned(),
        value: Magnitude::Scaled(1315.72),
        device_class: Some("energy".to_owned()),
        state_class: Some("total".to_owned()),
        unit: Some("kWh".to_owned()),
    };

    assert_eq!(
        sensors.config_topic(&value),
        "homeassistant/sensor/energymeter/energy_counter_total/config"
    );
    assert_eq!(
        sensors.state_topic(&value),
        "homeassistant/sensor/energymeter/energy_counter_total/state"
    );
    assert_eq!(sensors.state_payload(&value), "1315.72");

    let payload: serde_json::Value =
        serde_json::from_slice(&sensors.config_payload(&value).unwrap()).unwrap();
    assert_eq!(
        payload,
        json!({
            "name": "Energy Counter Total",
            "unique_id": "energymeter-energy_counter_total",
            "object_id": "energy_counter_total",
            "state_topic": "homeassistant/sensor/energymeter/energy_counter_total/state",
            "availability_topic": "energymeter2mqtt/energymeter/status",
            "device_class": "energy",
            "state_class": "total",
            "unit_of_measurement": "kWh",
            "device": {
                "identifiers": ["energymeter"],
                "name": "PCD ALD1D5FD",
                "manufacturer": "Saia",
                "model": "saia_pcd_ald1d5fd",
            },
        })
    );
}

#[test]
fn optional_metadata_is_omitted() {
    use crate::modbus::Magnitude;

    let sensors = Sensors::new(&UserSettings::default());
    let value = DecodedValue {
        name: "Power Factor".to_owned(),
        value: Magnitude::Raw(98),
        device_class: None,
        state_class: None,
        unit: None,
    };

    let payload: serde_json::Value =
        serde_json::from_slice(&sensors.config_payload(&value).unwrap()).unwrap();
    let keys: Vec<_> = payload.as_object().unwrap().keys().cloned().collect();
    assert!(!keys.iter().any(|k| k == "device_class"));
    assert!(!keys.iter().any(|k| k == "unit_of_measurement"));
    assert_eq!(sensors.state_payload(&value), "98");
}
