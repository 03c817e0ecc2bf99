//! ---
//! acp_section: "02-messaging-transport"
//! acp_subsection: "module"
//! acp_type: "source"
//! acp_scope: "code"
//! acp_description: "Structured message templates with per-send overrides."
//! acp_version: "v0.1.0"
//! acp_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{CommsError, Result};

/// Structured message body: field name to JSON value.
pub type Fields = serde_json::Map<String, Value>;

/// Default field values merged under per-send overrides.
///
/// The template is never modified by a send; [`merge`](Self::merge) always
/// builds a fresh map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageTemplate {
    fields: Fields,
}

impl MessageTemplate {
    /// Wrap a field map.
    pub fn new(fields: Fields) -> Self {
        Self { fields }
    }

    /// Sensor reading schema used by the ACP publishers.
    pub fn sensor_reading() -> Self {
        let value = json!({
            "sensor_id": null,
            "sensor_type": null,
            "data_type": null,
            "timestamp": null,
            "location": { "lat": null, "lon": null },
            "metadata": {
                "units": null,
                "schema_version": "1.0",
                "tags": []
            },
            "data": {}
        });
        match value {
            Value::Object(fields) => Self { fields },
            _ => Self::default(),
        }
    }

    /// Template fields.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Set one default, returning the updated template.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Copy of the template with `overrides` applied per top-level key.
    pub fn merge(&self, overrides: &Fields) -> Fields {
        let mut merged = self.fields.clone();
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Merge `overrides` and serialize the result as JSON text.
    pub fn render(&self, overrides: &Fields) -> Result<String> {
        Ok(serde_json::to_string(&self.merge(overrides))?)
    }
}

impl From<Fields> for MessageTemplate {
    fn from(fields: Fields) -> Self {
        Self::new(fields)
    }
}

impl TryFrom<Value> for MessageTemplate {
    type Error = CommsError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self::new(fields)),
            other => Err(CommsError::InvalidConfiguration(format!(
                "template must be a JSON object, got {other}"
            ))),
        }
    }
}
