//! Payload disassembler.
//!
//! Turns a raw vendor payload into an ordered list of property descriptors.
//! The context hint is the topic segment the payload arrived on (for example
//! `POWER2` or `SENSOR`) and drives two vendor conventions:
//!
//! - a scalar on a `POWER<n>` topic is a settable boolean switch
//! - classes listed in [`DisassemblerConfig::array_flatten_classes`] flatten
//!   array elements into separate properties instead of joining them
//!
//! ## Naming
//!
//! ```text
//! {"ENERGY": {"Voltage": 230, "Power": 10}}   → group ENERGY, Voltage, Power
//! {"Wifi": {"RSSI": 80}, "POWER": "ON"}        → WifiRSSI, POWER
//! {"Temps": [21.5, 22]}  (SENSOR)              → Temps1, Temps2
//! {"Temps": [21.5, 22]}  (other)               → Temps = "21.5, 22"
//! ```

use crate::error::{BridgeError, BridgeResult};
use crate::property::{PropertyDescriptor, PropertyValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::trace;

/// Topic prefix of the boolean switch convention.
pub const POWER_KEYWORD: &str = "POWER";
/// Scalar token meaning "switched on".
pub const ON_TOKEN: &str = "ON";
/// Scalar token meaning "switched off".
pub const OFF_TOKEN: &str = "OFF";
/// Property name prefix given to switch scalars.
pub const SWITCH_PROPERTY: &str = "powerSwitch";
/// Property name given to plain scalars.
pub const SCALAR_PROPERTY: &str = "value";

/// Flattening policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisassemblerConfig {
    /// Context hints whose arrays are flattened element by element
    #[serde(default = "default_array_flatten_classes")]
    pub array_flatten_classes: Vec<String>,
    /// Nesting depth after which a sub-tree is stored as JSON text
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_array_flatten_classes() -> Vec<String> {
    vec!["SENSOR".to_string()]
}

fn default_max_depth() -> usize {
    10
}

impl Default for DisassemblerConfig {
    fn default() -> Self {
        Self {
            array_flatten_classes: default_array_flatten_classes(),
            max_depth: default_max_depth(),
        }
    }
}

/// Result of disassembling one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Disassembled {
    /// Non-JSON payload, always exactly one property
    Scalar(PropertyDescriptor),
    /// Flattened JSON object
    Flat {
        group: Option<String>,
        properties: Vec<PropertyDescriptor>,
    },
}

impl Disassembled {
    /// Group name taken from a single top-level key, if any.
    pub fn group(&self) -> Option<&str> {
        match self {
            Self::Scalar(_) => None,
            Self::Flat { group, .. } => group.as_deref(),
        }
    }

    pub fn properties(&self) -> &[PropertyDescriptor] {
        match self {
            Self::Scalar(p) => std::slice::from_ref(p),
            Self::Flat { properties, .. } => properties,
        }
    }

    pub fn into_properties(self) -> Vec<PropertyDescriptor> {
        match self {
            Self::Scalar(p) => vec![p],
            Self::Flat { properties, .. } => properties,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.properties().is_empty()
    }
}

/// Whether a payload should be treated as a JSON object.
pub fn looks_like_json(payload: &str) -> bool {
    payload.starts_with('{') && payload.ends_with('}')
}

/// Numeric suffix of a switch hint: `POWER` → `""`, `POWER2` → `"2"`.
pub fn switch_suffix(hint: &str) -> Option<&str> {
    let suffix = hint.strip_prefix(POWER_KEYWORD)?;
    suffix
        .chars()
        .all(|c| c.is_ascii_digit())
        .then_some(suffix)
}

/// Stateless payload disassembler.
#[derive(Debug, Clone, Default)]
pub struct PayloadDisassembler {
    config: DisassemblerConfig,
}

impl PayloadDisassembler {
    pub fn new(config: DisassemblerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DisassemblerConfig {
        &self.config
    }

    /// Disassemble `payload` that arrived on a topic ending in `hint`.
    pub fn disassemble(&self, payload: &[u8], hint: &str) -> BridgeResult<Disassembled> {
        let text = String::from_utf8_lossy(payload);
        trace!(hint, payload = %text, "Disassembling payload");

        if !looks_like_json(&text) {
            return Ok(Disassembled::Scalar(Self::scalar(&text, hint)));
        }

        let object: Map<String, Value> = serde_json::from_str(&text)
            .map_err(|e| BridgeError::Parse(format!("{} ({})", e, hint)))?;

        let flatten_arrays = self.config.array_flatten_classes.iter().any(|c| c == hint);
        let mut properties = Vec::new();

        let group = if object.len() == 1 {
            let mut entries = object.into_iter();
            match entries.next() {
                Some((key, value @ (Value::Object(_) | Value::Array(_)))) => {
                    self.flatten("", &value, flatten_arrays, 0, &mut properties);
                    Some(key)
                }
                Some((key, scalar)) => {
                    // Nothing to unwrap, the key itself is the property
                    let mut wrapped = Map::new();
                    wrapped.insert(key.clone(), scalar);
                    self.flatten("", &Value::Object(wrapped), flatten_arrays, 0, &mut properties);
                    Some(key)
                }
                None => None,
            }
        } else {
            self.flatten("", &Value::Object(object), flatten_arrays, 0, &mut properties);
            None
        };

        trace!(hint, count = properties.len(), "Disassembled payload");
        Ok(Disassembled::Flat { group, properties })
    }

    fn scalar(text: &str, hint: &str) -> PropertyDescriptor {
        match switch_suffix(hint) {
            Some(suffix) => PropertyDescriptor::new(
                format!("{}{}", SWITCH_PROPERTY, suffix),
                PropertyValue::Boolean(text == ON_TOKEN),
            )
            .settable(),
            None => PropertyDescriptor::new(SCALAR_PROPERTY, PropertyValue::from(text)),
        }
    }

    /// Walk an object or array, appending one descriptor per leaf.
    fn flatten(
        &self,
        prefix: &str,
        container: &Value,
        flatten_arrays: bool,
        depth: usize,
        out: &mut Vec<PropertyDescriptor>,
    ) {
        let entries: Vec<(String, &Value)> = match container {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| ((i + 1).to_string(), v))
                .collect(),
            _ => return,
        };

        for (key, value) in entries {
            let path = format!("{}{}", prefix, key);
            let descend = match value {
                Value::Object(_) => true,
                Value::Array(_) => flatten_arrays,
                _ => false,
            };

            if descend && depth < self.config.max_depth {
                self.flatten(&path, value, flatten_arrays, depth + 1, out);
            } else {
                out.push(PropertyDescriptor::new(path, leaf_value(value)));
            }
        }
    }
}

/// Convert a leaf JSON value. Arrays are joined, deep objects kept as JSON text.
fn leaf_value(value: &Value) -> PropertyValue {
    match value {
        Value::Number(n) => n
            .as_f64()
            .map(PropertyValue::Float)
            .unwrap_or_else(|| PropertyValue::String(n.to_string())),
        Value::Bool(b) => PropertyValue::Boolean(*b),
        Value::String(s) => PropertyValue::String(s.clone()),
        Value::Null => PropertyValue::String(String::new()),
        Value::Array(items) => PropertyValue::String(
            items
                .iter()
                .map(join_element)
                .collect::<Vec<_>>()
                .join(", "),
        ),
        Value::Object(_) => PropertyValue::String(value.to_string()),
    }
}

fn join_element(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => n
            .as_f64()
            .map(|f| f.to_string())
            .unwrap_or_else(|| n.to_string()),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}
