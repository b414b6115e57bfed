//! Myosin state model contract.
//!
//! Every value shared through the engine implements [`StateModel`]:
//! - a stable, compile-time type tag that locates the model in the registry
//! - an optional primary key
//! - an explicit dump/hydrate pair to and from a JSON object
//!
//! Models that are plain serde structs can implement the contract with
//! [`to_document`] and [`from_document`].

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::ModelError;

/// A serialized model: field name to value.
pub type Document = serde_json::Map<String, Value>;

/// Primary key of a model instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelId {
    Int(i64),
    Str(String),
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelId::Int(id) => write!(f, "{}", id),
            ModelId::Str(id) => write!(f, "{}", id),
        }
    }
}

impl From<i64> for ModelId {
    fn from(id: i64) -> Self {
        ModelId::Int(id)
    }
}

impl From<&str> for ModelId {
    fn from(id: &str) -> Self {
        ModelId::Str(id.to_string())
    }
}

impl From<String> for ModelId {
    fn from(id: String) -> Self {
        ModelId::Str(id)
    }
}

/// A user-defined state model.
///
/// Exactly one instance per `TYPE_TAG` is live in an engine at a time.
/// `dump` followed by `hydrate` must restore every field except
/// those the model deliberately recomputes (timestamps and the like).
pub trait StateModel: Clone + Send + Sync + 'static {
    /// Stable type identity. Also names the cached document on disk.
    const TYPE_TAG: &'static str;

    /// Primary key, if the model carries one.
    fn id(&self) -> Option<&ModelId>;

    /// Serialize the model into a document.
    ///
    /// Returns [`ModelError::Uninitialized`] when a required field has not
    /// been set yet.
    fn dump(&self) -> Result<Document, ModelError>;

    /// Restore fields from a document.
    fn hydrate(&mut self, document: &Document) -> Result<(), ModelError>;
}

/// Stable key of a registered model type.
///
/// Ordered so that sessions can acquire locks in a canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeTag(&'static str);

impl TypeTag {
    /// Tag of a model type.
    pub fn of<T: StateModel>() -> Self {
        TypeTag(T::TYPE_TAG)
    }

    /// Tag from a raw string constant.
    pub const fn new(tag: &'static str) -> Self {
        TypeTag(tag)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serialize any serde value into a document.
///
/// Fails if the value does not serialize to a JSON object.
pub fn to_document<T: Serialize>(value: &T) -> Result<Document, ModelError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(ModelError::InvalidField {
            field: "<root>".to_string(),
            reason: format!("expected an object, got {}", json_kind(&other)),
        }),
    }
}

/// Deserialize a document into a fresh serde value.
pub fn from_document<T: DeserializeOwned>(document: &Document) -> Result<T, ModelError> {
    Ok(serde_json::from_value(Value::Object(document.clone()))?)
}

/// Short name of a JSON value's kind, for error messages.
pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Demo {
        id: Option<ModelId>,
        name: Option<String>,
    }

    impl StateModel for Demo {
        const TYPE_TAG: &'static str = "Demo";

        fn id(&self) -> Option<&ModelId> {
            self.id.as_ref()
        }

        fn dump(&self) -> Result<Document, ModelError> {
            if self.name.is_none() {
                return Err(ModelError::Uninitialized {
                    field: "name".to_string(),
                });
            }
            to_document(self)
        }

        fn hydrate(&mut self, document: &Document) -> Result<(), ModelError> {
            *self = from_document(document)?;
            Ok(())
        }
    }

    #[test]
    fn test_model_id_untagged() {
        let int: ModelId = serde_json::from_str("1").unwrap();
        let string: ModelId = serde_json::from_str("\"sensor-a\"").unwrap();
        assert_eq!(int, ModelId::Int(1));
        assert_eq!(string, ModelId::from("sensor-a"));
        assert_eq!(serde_json::to_string(&ModelId::Int(7)).unwrap(), "7");
    }

    #[test]
    fn test_serde_round_trip() {
        let demo = Demo {
            id: Some(ModelId::Int(1)),
            name: Some("cS".to_string()),
        };
        let document = demo.dump().unwrap();
        assert_eq!(document["id"], serde_json::json!(1));
        assert_eq!(document["name"], serde_json::json!("cS"));

        let mut restored = Demo {
            id: None,
            name: None,
        };
        restored.hydrate(&document).unwrap();
        assert_eq!(restored, demo);
        assert_eq!(restored.dump().unwrap(), document);
    }

    #[test]
    fn test_serde_derived_model_method_calls() {
        // both serde traits and StateModel are in scope here
        let demo = Demo {
            id: Some(ModelId::Str("sensor-a".into())),
            name: Some("uart".to_string()),
        };
        let via_serde = serde_json::to_value(&demo).unwrap();
        let via_model = demo.dump().unwrap();
        assert_eq!(via_serde, Value::Object(via_model.clone()));

        let mut restored: Demo = serde_json::from_value(via_serde).unwrap();
        restored.name = None;
        restored.hydrate(&via_model).unwrap();
        assert_eq!(restored, demo);
    }

    #[test]
    fn test_uninitialized_field() {
        let demo = Demo {
            id: Some(ModelId::Int(1)),
            name: None,
        };
        match demo.dump() {
            Err(ModelError::Uninitialized { field }) => assert_eq!(field, "name"),
            other => panic!("Expected Uninitialized, got {:?}", other),
        }
    }

    #[test]
    fn test_to_document_rejects_scalars() {
        assert!(to_document(&42).is_err());
        assert!(to_document(&vec![1, 2]).is_err());
    }

    #[test]
    fn test_type_tag_ordering() {
        let mut tags = vec![TypeTag::new("Telemetry"), TypeTag::of::<Demo>(), TypeTag::new("System")];
        tags.sort();
        let names: Vec<&str> = tags.iter().map(|t| t.as_str()).collect();
        assert_eq!(names, vec!["Demo", "System", "Telemetry"]);
    }
}
