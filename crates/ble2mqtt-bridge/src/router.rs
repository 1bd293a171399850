//! Inbound topic routing.

use std::sync::Arc;

use ble2mqtt_core::SharedDevice;

use crate::error::{BridgeError, Result};

/// Maps inbound command topics to the device that subscribed to them.
#[derive(Clone)]
pub struct Router {
    root: String,
    devices: Arc<[SharedDevice]>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("root", &self.root)
            .field("devices", &self.devices.len())
            .finish()
    }
}

/// A topic resolved to its owning device.
pub struct Route<'a> {
    /// Device that subscribed the topic.
    pub device: &'a SharedDevice,
    /// Topic relative to the bridge root.
    pub topic: &'a str,
}

impl Router {
    /// Create a router for `devices` under the `root` topic prefix.
    pub fn new(root: impl Into<String>, devices: Arc<[SharedDevice]>) -> Self {
        Self {
            root: root.into(),
            devices,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Absolute topic for a topic relative to the root.
    pub fn absolute(&self, topic: &str) -> String {
        format!("{}/{}", self.root, topic)
    }

    /// Find the device owning `topic`.
    ///
    /// Topics outside the bridge root resolve to `None`. A topic under the
    /// root that no device subscribed to is an error. When several devices
    /// list the same topic the first registered one wins.
    pub fn resolve<'a>(&'a self, topic: &'a str) -> Result<Option<Route<'a>>> {
        let Some(relative) = topic
            .strip_prefix(self.root.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return Ok(None);
        };

        self.devices
            .iter()
            .find(|device| device.subscribed_topics().iter().any(|t| t == relative))
            .map(|device| {
                Some(Route {
                    device,
                    topic: relative,
                })
            })
            .ok_or_else(|| BridgeError::UnroutableTopic(topic.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ble2mqtt_core::MockDevice;

    fn router() -> Router {
        let devices: Vec<SharedDevice> = vec![
            Arc::new(
                MockDevice::new("AA:BB:CC:DD:EE:01")
                    .with_topics(["0xaabbccddee01/heater/set", "shared/set"]),
            ),
            Arc::new(
                MockDevice::new("AA:BB:CC:DD:EE:02")
                    .with_topics(["0xaabbccddee02/heater/set", "shared/set"]),
            ),
        ];
        Router::new("ble2mqtt", devices.into())
    }

    #[test]
    fn test_resolve_owner() {
        let router = router();
        let route = router
            .resolve("ble2mqtt/0xaabbccddee02/heater/set")
            .unwrap()
            .unwrap();
        assert_eq!(route.device.mac(), "AA:BB:CC:DD:EE:02");
        assert_eq!(route.topic, "0xaabbccddee02/heater/set");
    }

    #[test]
    fn test_first_registered_device_wins() {
        let router = router();
        let route = router.resolve("ble2mqtt/shared/set").unwrap().unwrap();
        assert_eq!(route.device.mac(), "AA:BB:CC:DD:EE:01");
    }

    #[test]
    fn test_topic_outside_root_is_ignored() {
        let router = router();
        assert!(router.resolve("zigbee2mqtt/lamp/set").unwrap().is_none());
        assert!(router.resolve("ble2mqttx/shared/set").unwrap().is_none());
    }

    #[test]
    fn test_unknown_topic_under_root_is_error() {
        let router = router();
        assert!(matches!(
            router.resolve("ble2mqtt/0xffffffffffff/heater/set"),
            Err(BridgeError::UnroutableTopic(t)) if t == "ble2mqtt/0xffffffffffff/heater/set"
        ));
    }

    #[test]
    fn test_absolute() {
        assert_eq!(router().absolute("bridge/state"), "ble2mqtt/bridge/state");
    }
}
