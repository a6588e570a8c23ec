//! Property values and descriptors.
//!
//! A [`PropertyDescriptor`] is what the disassembler (or a discovery preset)
//! knows about a value. A [`Property`] is the descriptor placed into a node,
//! with its Homie topic and optional vendor command topic filled in.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Suffix of the Homie write channel below a property topic.
pub const SET_SUFFIX: &str = "set";

/// Homie datatype of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    String,
    Float,
    Boolean,
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Float => write!(f, "float"),
            Self::Boolean => write!(f, "boolean"),
        }
    }
}

/// Last known value of a property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Boolean(bool),
    Float(f64),
    String(String),
}

impl PropertyValue {
    /// Datatype inferred from the value kind.
    pub fn kind(&self) -> PropertyType {
        match self {
            Self::String(_) => PropertyType::String,
            Self::Float(_) => PropertyType::Float,
            Self::Boolean(_) => PropertyType::Boolean,
        }
    }

    /// Numeric view of the value, parsing strings when possible.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::String(s) => s.trim().parse().ok(),
            Self::Boolean(_) => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Float(v) => write!(f, "{}", v),
            Self::Boolean(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

/// Property as inferred from a payload, before it is placed in a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDescriptor {
    pub name: String,
    #[serde(rename = "datatype")]
    pub kind: PropertyType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<PropertyValue>,
    pub settable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub no_retain: bool,
}

impl PropertyDescriptor {
    /// Descriptor whose datatype follows the value.
    pub fn new(name: impl Into<String>, value: PropertyValue) -> Self {
        Self {
            name: name.into(),
            kind: value.kind(),
            value: Some(value),
            settable: false,
            format: None,
            no_retain: false,
        }
    }

    /// Descriptor with a declared datatype and no value yet.
    pub fn preset(name: impl Into<String>, kind: PropertyType) -> Self {
        Self {
            name: name.into(),
            kind,
            value: None,
            settable: false,
            format: None,
            no_retain: false,
        }
    }

    pub fn settable(mut self) -> Self {
        self.settable = true;
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Mark as event-like: values are published without the retain flag.
    pub fn no_retain(mut self) -> Self {
        self.no_retain = true;
        self
    }
}

/// A property placed in a node.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub kind: PropertyType,
    pub value: Option<PropertyValue>,
    pub settable: bool,
    pub format: Option<String>,
    pub no_retain: bool,
    /// `<base>/<device>/<node>/<name>`
    pub topic: String,
    /// Vendor topic a Homie write is forwarded to. Only set on settable properties.
    pub command_topic: Option<String>,
}

impl Property {
    /// Build a property below `node_topic` from a descriptor.
    pub fn from_descriptor(
        desc: PropertyDescriptor,
        node_topic: &str,
        command_topic: Option<String>,
    ) -> Self {
        let topic = format!("{}/{}", node_topic, desc.name);
        let command_topic = if desc.settable { command_topic } else { None };
        Self {
            name: desc.name,
            kind: desc.kind,
            value: desc.value,
            settable: desc.settable,
            format: desc.format,
            no_retain: desc.no_retain,
            topic,
            command_topic,
        }
    }

    /// Homie write channel of this property.
    pub fn write_topic(&self) -> String {
        format!("{}/{}", self.topic, SET_SUFFIX)
    }

    /// Payload published on the property topic.
    pub fn payload(&self) -> String {
        self.value
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_display() {
        assert_eq!(PropertyValue::Float(230.0).to_string(), "230");
        assert_eq!(PropertyValue::Float(23.5).to_string(), "23.5");
        assert_eq!(PropertyValue::Boolean(true).to_string(), "true");
        assert_eq!(PropertyValue::from("ON").to_string(), "ON");
    }

    #[test]
    fn test_value_as_f64() {
        assert_eq!(PropertyValue::Float(3.1).as_f64(), Some(3.1));
        assert_eq!(PropertyValue::from(" 87 ").as_f64(), Some(87.0));
        assert_eq!(PropertyValue::from("n/a").as_f64(), None);
        assert_eq!(PropertyValue::Boolean(true).as_f64(), None);
    }

    #[test]
    fn test_property_from_descriptor() {
        let desc = PropertyDescriptor::new("powerSwitch", PropertyValue::Boolean(true)).settable();
        let prop = Property::from_descriptor(
            desc,
            "homie/dev1/POWER",
            Some("cmnd/dev1/POWER".to_string()),
        );

        assert_eq!(prop.topic, "homie/dev1/POWER/powerSwitch");
        assert_eq!(prop.write_topic(), "homie/dev1/POWER/powerSwitch/set");
        assert_eq!(prop.command_topic.as_deref(), Some("cmnd/dev1/POWER"));
        assert_eq!(prop.kind, PropertyType::Boolean);
        assert_eq!(prop.payload(), "true");
    }

    #[test]
    fn test_read_only_property_drops_command_topic() {
        let desc = PropertyDescriptor::new("Voltage", PropertyValue::Float(230.0));
        let prop = Property::from_descriptor(desc, "homie/dev1/SENSOR", Some("cmnd/x".into()));
        assert!(prop.command_topic.is_none());
    }

    #[test]
    fn test_preset_has_empty_payload() {
        let desc = PropertyDescriptor::preset("click", PropertyType::String).no_retain();
        let prop = Property::from_descriptor(desc, "homie/switch/main", None);
        assert_eq!(prop.payload(), "");
        assert!(prop.no_retain);
    }
}
