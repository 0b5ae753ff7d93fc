use crate::prelude::*;
use crate::register::Register;

use async_trait::async_trait;
use std::collections::BTreeMap;

pub mod modbus;
pub mod simulated;

pub use modbus::ModbusReader;
pub use simulated::SimulatedReader;

/// One field of a poll: a decoded value with its unit, or why it could not
/// be read.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldReading {
    Value { value: f64, unit: String },
    Error { error: String },
}

impl FieldReading {
    pub fn value(&self) -> Option<f64> {
        match self {
            FieldReading::Value { value, .. } => Some(*value),
            FieldReading::Error { .. } => None,
        }
    }
}

/// Result of polling one device. Live and simulated readers produce the same
/// shape.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceReading {
    pub device_id: String,
    pub name: String,
    pub class: config::DeviceClass,
    pub timestamp: String,
    pub fields: BTreeMap<String, FieldReading>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeviceReading {
    pub fn new(device: &config::Device) -> Self {
        Self {
            device_id: device.id().to_string(),
            name: device.name().to_string(),
            class: device.class(),
            timestamp: Utils::now_iso8601(),
            fields: BTreeMap::new(),
            error: None,
        }
    }

    /// A reading for a device that could not be polled at all.
    pub fn failed(device: &config::Device, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::new(device)
        }
    }

    /// Decodes `words` for `field` and records the value, or records the
    /// transport/decode error against that field alone.
    pub fn push_words(&mut self, field: &str, register: &Register, words: Result<Vec<u16>, String>) {
        let reading = match words.and_then(|w| register.decode(&w).map_err(|e| e.to_string())) {
            Ok(value) => FieldReading::Value {
                value,
                unit: register.unit.clone(),
            },
            Err(error) => {
                debug!("{}.{}: {}", self.device_id, field, error);
                FieldReading::Error { error }
            }
        };

        self.fields.insert(field.to_string(), reading);
    }

    pub fn value(&self, field: &str) -> Option<f64> {
        self.fields.get(field).and_then(FieldReading::value)
    }

    pub fn field_errors(&self) -> usize {
        self.fields
            .values()
            .filter(|f| matches!(f, FieldReading::Error { .. }))
            .count()
    }

    /// State of charge, for battery-class devices that report one.
    pub fn battery_level(&self) -> Option<f64> {
        if self.class != config::DeviceClass::Battery {
            return None;
        }
        self.value("soc").or_else(|| self.value("battery_level"))
    }

    /// What gets cached and published for this reading.
    pub fn to_payload(&self) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "name": self.name,
            "class": self.class,
            "fields": self.fields,
        });
        if let Some(error) = &self.error {
            payload["error"] = serde_json::Value::from(error.as_str());
        }
        payload
    }
}

#[async_trait]
pub trait DeviceReader: Send + Sync {
    /// Devices this reader can poll. For the live reader, only those whose
    /// connection came up at startup.
    fn devices(&self) -> Vec<config::Device>;

    /// Fails only when `id` is not a pollable device; per-field problems are
    /// reported inside the reading.
    async fn read_device(&self, id: &str) -> Result<DeviceReading>;

    async fn read_all_devices(&self) -> Vec<DeviceReading> {
        let mut readings = Vec::new();

        for device in self.devices() {
            match self.read_device(device.id()).await {
                Ok(reading) => readings.push(reading),
                Err(err) => {
                    warn!("device {}: {}", device.id(), err);
                    readings.push(DeviceReading::failed(&device, err.to_string()));
                }
            }
        }

        readings
    }
}
