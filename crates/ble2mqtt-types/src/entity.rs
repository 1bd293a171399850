//! Entity descriptors used to build Home Assistant discovery payloads.

use core::fmt;
use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Home Assistant component a device entity is exposed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum EntityDomain {
    /// Read-only value (temperature, humidity, ...).
    Sensor,
    /// On/off control with a command topic.
    Switch,
}

impl EntityDomain {
    /// Component name as used in discovery topics.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityDomain::Sensor => "sensor",
            EntityDomain::Switch => "switch",
        }
    }
}

impl fmt::Display for EntityDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entity exposed by a device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Entity {
    /// Entity name; also the last segment of its state topic.
    pub name: String,
    /// Home Assistant device class.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub device_class: Option<String>,
    /// Unit of measurement.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub unit_of_measurement: Option<String>,
    /// Material Design icon name, without the `mdi:` prefix.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub icon: Option<String>,
}

impl Entity {
    /// Create an entity with only a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device_class: None,
            unit_of_measurement: None,
            icon: None,
        }
    }

    /// Set the device class.
    #[must_use]
    pub fn device_class(mut self, class: impl Into<String>) -> Self {
        self.device_class = Some(class.into());
        self
    }

    /// Set the unit of measurement.
    #[must_use]
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit_of_measurement = Some(unit.into());
        self
    }

    /// Set the icon.
    #[must_use]
    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }
}

/// Entities of a device grouped by domain, in a stable order.
pub type Entities = BTreeMap<EntityDomain, Vec<Entity>>;
