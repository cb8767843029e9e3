//! Per-sample sensor state
//!
//! A `SensorState` is created once per sample found on the first successful
//! poll of a station and is then updated in place by every later poll.
//! Attributes are insert-or-overwrite: a key, once set, is never removed.

use std::fmt;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use crate::viva::SampleRecord;

pub const ICON: &str = "mdi:ferry";

/// Sensor attributes in first-insertion order.
pub type Attributes = IndexMap<String, String>;

/// How a sample's `Value` string is turned into the published state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueMode {
    /// Publish the value string verbatim.
    #[default]
    Raw,
    /// Publish the leading number and keep the rest as attributes.
    Numeric,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DisplayValue {
    Text(String),
    Number(f64),
}

impl fmt::Display for DisplayValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayValue::Text(s) => f.write_str(s),
            DisplayValue::Number(n) => write!(f, "{}", n),
        }
    }
}

/// `prefix_stationName_sampleName`
pub fn composite_id(prefix: &str, station_name: &str, sample_name: &str) -> String {
    format!("{}_{}_{}", prefix, station_name, sample_name)
}

// ── Numeric extraction ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct NumericValue {
    pub number: f64,
    /// The untouched value string.
    pub original: String,
    /// The value string with the first occurrence of the number removed.
    pub additional: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExtractionError {
    #[error("no digits in {0:?}")]
    NoDigits(String),
    #[error("{0:?} is not a number")]
    NotANumber(String),
}

/// Pull the first run of digits and decimal points out of `value`.
///
/// The run starts at the first digit or `.` and ends at the first byte that
/// is neither. A sign is not part of the run, and a run that does not parse
/// (a lone "." or "1.2.3") is an error.
pub fn extract_numeric(value: &str) -> Result<NumericValue, ExtractionError> {
    let is_numeric = |b: &u8| b.is_ascii_digit() || *b == b'.';
    let bytes = value.as_bytes();
    let start = bytes
        .iter()
        .position(is_numeric)
        .ok_or_else(|| ExtractionError::NoDigits(value.to_string()))?;

    let end = bytes[start..]
        .iter()
        .position(|b| !is_numeric(b))
        .map(|n| start + n)
        .unwrap_or(bytes.len());

    // All bytes in start..end are ASCII, so both ends are char boundaries.
    let run = &value[start..end];
    let number: f64 = run
        .parse()
        .map_err(|_| ExtractionError::NotANumber(run.to_string()))?;

    Ok(NumericValue {
        number,
        original: value.to_string(),
        additional: value.replacen(run, "", 1),
    })
}

/// Python-style truthiness of an optional JSON field.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn attribute_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── Sensor state ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SensorState {
    composite_id: String,
    sample_name: String,
    display_value: Option<DisplayValue>,
    unit: Option<String>,
    attributes: Attributes,
}

impl SensorState {
    /// New sensor with no value yet. The id is frozen here.
    pub fn new(prefix: &str, station_name: &str, sample_name: &str) -> Self {
        Self {
            composite_id: composite_id(prefix, station_name, sample_name),
            sample_name: sample_name.to_string(),
            display_value: None,
            unit: None,
            attributes: Attributes::new(),
        }
    }

    pub fn composite_id(&self) -> &str {
        &self.composite_id
    }

    pub fn sample_name(&self) -> &str {
        &self.sample_name
    }

    pub fn display_value(&self) -> Option<&DisplayValue> {
        self.display_value.as_ref()
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Copy a matching sample into this sensor.
    pub fn update(&mut self, sample: &SampleRecord, mode: ValueMode) {
        self.unit = Some(sample.unit.clone());
        self.display_value = Some(match mode {
            ValueMode::Raw => DisplayValue::Text(sample.value.clone()),
            ValueMode::Numeric => match extract_numeric(&sample.value) {
                Ok(numeric) => {
                    self.set_attribute("Original", numeric.original);
                    self.set_attribute("Additional", numeric.additional);
                    DisplayValue::Number(numeric.number)
                }
                Err(_) => DisplayValue::Text(sample.value.clone()),
            },
        });

        self.set_attribute("type", sample.sample_type.clone());
        self.set_attribute("last_modified", sample.updated.clone());

        // Absent or falsy fields keep whatever an earlier poll stored.
        for (name, value) in sample.optional_attributes() {
            if let Some(value) = value.filter(|v| is_truthy(v)) {
                self.set_attribute(name, attribute_text(value));
            }
        }
    }

    fn set_attribute(&mut self, key: &str, value: String) {
        self.attributes.insert(key.to_string(), value);
    }

    /// Attributes as published to the state store.
    pub fn entity_attributes(&self) -> serde_json::Map<String, Value> {
        let mut attrs = serde_json::Map::new();
        for (key, value) in &self.attributes {
            attrs.insert(key.clone(), Value::String(value.clone()));
        }
        attrs.insert("friendly_name".into(), Value::String(self.composite_id.clone()));
        attrs.insert("icon".into(), Value::String(ICON.to_string()));
        if let Some(unit) = self.unit.as_deref().filter(|u| !u.is_empty()) {
            attrs.insert("unit_of_measurement".into(), Value::String(unit.to_string()));
        }
        attrs
    }
}
