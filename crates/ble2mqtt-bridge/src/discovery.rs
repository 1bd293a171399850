//! Home Assistant MQTT discovery.
//!
//! Every entity of a device is announced with one retained message on
//! `homeassistant/<component>/<dev_id>/<entity>/config`. The payload
//! combines generic fields (name, unique id, device block, icon) with the
//! entity's own attributes and the topics Home Assistant should use.

use serde_json::{Value, json};

use ble2mqtt_core::BridgeDevice;
use ble2mqtt_types::{DeviceInfo, Entity, EntityDomain};

use crate::mqtt::Message;

/// Topic prefix Home Assistant listens on for discovery.
pub const DISCOVERY_PREFIX: &str = "homeassistant";

/// Suffix appended to a state topic to form its command topic.
pub const SET_POSTFIX: &str = "set";

/// Identity of the device an entity belongs to.
#[derive(Debug, Clone, Copy)]
pub struct DeviceIdentity<'a> {
    /// Stable identifier, e.g. `0xaabbccddeeff`.
    pub unique_id: &'a str,
    /// Identifier without the `0x` prefix, used in discovery topics.
    pub dev_id: &'a str,
    pub info: &'a DeviceInfo,
}

/// State topic of an entity.
pub fn state_topic(root: &str, unique_id: &str, entity: &str) -> String {
    format!("{}/{}/{}", root, unique_id, entity)
}

/// Discovery topic of an entity.
pub fn config_topic(domain: EntityDomain, dev_id: &str, entity: &str) -> String {
    format!("{}/{}/{}/{}/config", DISCOVERY_PREFIX, domain, dev_id, entity)
}

/// Build the discovery payload of one entity.
pub fn entity_config(
    root: &str,
    device: DeviceIdentity<'_>,
    domain: EntityDomain,
    entity: &Entity,
) -> Value {
    let name = format!("{}_{}", entity.name, device.dev_id);
    let state_topic = state_topic(root, device.unique_id, &entity.name);

    let mut payload = json!({
        "name": name,
        "unique_id": name,
        "device": {
            "identifiers": [device.unique_id],
            "name": device.unique_id,
            "sw_version": device.info.sw_version,
            "model": device.info.model,
            "manufacturer": device.info.manufacturer,
        },
    });

    if let Some(icon) = &entity.icon {
        payload["icon"] = json!(format!("mdi:{}", icon));
    }
    if let Some(device_class) = &entity.device_class {
        payload["device_class"] = json!(device_class);
    }
    if let Some(unit) = &entity.unit_of_measurement {
        payload["unit_of_measurement"] = json!(unit);
    }

    match domain {
        EntityDomain::Switch => {
            payload["command_topic"] = json!(format!("{}/{}", state_topic, SET_POSTFIX));
        }
        EntityDomain::Sensor => {
            payload["value_template"] = json!(format!("{{{{ value_json.{} }}}}", entity.name));
        }
    }
    payload["state_topic"] = json!(state_topic);

    payload
}

/// Discovery messages for every entity of `device`, in entity order.
pub fn messages(root: &str, device: &dyn BridgeDevice) -> Vec<Message> {
    let unique_id = device.unique_id();
    let dev_id = device.dev_id();
    let info = device.info();
    let identity = DeviceIdentity {
        unique_id: &unique_id,
        dev_id: &dev_id,
        info: &info,
    };

    device
        .entities()
        .iter()
        .flat_map(|(domain, entities)| {
            entities.iter().map(move |entity| {
                let payload = entity_config(root, identity, *domain, entity);
                Message::new(
                    config_topic(*domain, identity.dev_id, &entity.name),
                    payload.to_string(),
                )
                .retained()
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use ble2mqtt_core::MockDevice;

    fn info() -> DeviceInfo {
        DeviceInfo {
            model: "MiKettle".to_string(),
            manufacturer: "Xiaomi".to_string(),
            sw_version: Some("1.0.2_0067".to_string()),
        }
    }

    fn identity(info: &DeviceInfo) -> DeviceIdentity<'_> {
        DeviceIdentity {
            unique_id: "kettle1",
            dev_id: "aabbccddeeff",
            info,
        }
    }

    #[test]
    fn test_sensor_config() {
        let info = info();
        let entity = Entity::new("temperature")
            .device_class("temperature")
            .unit("°C");
        let payload = entity_config("ble2mqtt", identity(&info), EntityDomain::Sensor, &entity);

        assert_eq!(payload["state_topic"], "ble2mqtt/kettle1/temperature");
        assert_eq!(payload["value_template"], "{{ value_json.temperature }}");
        assert_eq!(payload["name"], "temperature_aabbccddeeff");
        assert_eq!(payload["unique_id"], "temperature_aabbccddeeff");
        assert_eq!(payload["device_class"], "temperature");
        assert_eq!(payload["unit_of_measurement"], "°C");
        assert!(payload.get("command_topic").is_none());
        assert!(payload.get("icon").is_none());
        assert_eq!(
            payload["device"],
            json!({
                "identifiers": ["kettle1"],
                "name": "kettle1",
                "sw_version": "1.0.2_0067",
                "model": "MiKettle",
                "manufacturer": "Xiaomi",
            })
        );
    }

    #[test]
    fn test_switch_config() {
        let info = info();
        let entity = Entity::new("heater").icon("kettle");
        let payload = entity_config("ble2mqtt", identity(&info), EntityDomain::Switch, &entity);

        assert_eq!(payload["state_topic"], "ble2mqtt/kettle1/heater");
        assert_eq!(payload["command_topic"], "ble2mqtt/kettle1/heater/set");
        assert_eq!(payload["icon"], "mdi:kettle");
        assert!(payload.get("value_template").is_none());
    }

    #[test]
    fn test_unknown_sw_version_is_null() {
        let info = DeviceInfo::default();
        let payload = entity_config(
            "ble2mqtt",
            identity(&info),
            EntityDomain::Sensor,
            &Entity::new("temperature"),
        );
        assert_eq!(payload["device"]["sw_version"], Value::Null);
    }

    #[test]
    fn test_messages_for_device() {
        let device = MockDevice::new("AA:BB:CC:DD:EE:FF").with_entities(BTreeMap::from([
            (EntityDomain::Switch, vec![Entity::new("heater")]),
            (EntityDomain::Sensor, vec![Entity::new("temperature"), Entity::new("humidity")]),
        ]));

        let messages = messages("ble2mqtt", &device);
        let topics: Vec<_> = messages.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(
            topics,
            vec![
                "homeassistant/sensor/aabbccddeeff/temperature/config",
                "homeassistant/sensor/aabbccddeeff/humidity/config",
                "homeassistant/switch/aabbccddeeff/heater/config",
            ]
        );
        assert!(messages.iter().all(|m| m.retain));

        let payload: Value = serde_json::from_slice(&messages[0].payload).unwrap();
        assert_eq!(payload["state_topic"], "ble2mqtt/0xaabbccddeeff/temperature");
    }
}
