use std::fmt;

use chrono::Utc;
use serde_json::{json, Value};

use myosin_engine::{Document, ModelError, ModelId, StateModel};

/// Latest temperature reading from the sensor board.
///
/// The timestamp is stamped at serialization time and never restored.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    pub id: Option<ModelId>,
    pub tp: f64,
}

impl Telemetry {
    pub const DEFAULT_TP: f64 = 25.5;

    pub fn new() -> Self {
        Self::with_tp(Self::DEFAULT_TP)
    }

    pub fn with_tp(tp: f64) -> Self {
        Self { id: None, tp }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl StateModel for Telemetry {
    const TYPE_TAG: &'static str = "Telemetry";

    fn id(&self) -> Option<&ModelId> {
        self.id.as_ref()
    }

    fn dump(&self) -> Result<Document, ModelError> {
        let mut document = Document::new();
        document.insert("id".into(), serde_json::to_value(&self.id)?);
        document.insert("temp".into(), json!(self.tp));
        document.insert(
            "timestamp".into(),
            json!(Utc::now().timestamp_millis() as f64 / 1000.0),
        );
        Ok(document)
    }

    fn hydrate(&mut self, document: &Document) -> Result<(), ModelError> {
        for (key, value) in document {
            match key.as_str() {
                "id" => self.id = serde_json::from_value(value.clone())?,
                "temp" => self.tp = as_number("temp", value)?,
                _ => {}
            }
        }
        Ok(())
    }
}

impl fmt::Display for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Telemetry(temp={:.2})", self.tp)
    }
}

fn as_number(field: &str, value: &Value) -> Result<f64, ModelError> {
    value.as_f64().ok_or_else(|| ModelError::InvalidField {
        field: field.to_string(),
        reason: format!("expected a number, got {}", myosin_core::json_kind(value)),
    })
}
