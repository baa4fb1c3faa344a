//! Instance wrapper bound to its collection.

use super::{Collection, ID_FIELD};
use crate::error::CoreResult;
use serde_json::Value;

/// A validated instance plus the collection it belongs to.
///
/// The document does not own storage: `save` writes the current value to
/// the collection, `exists` asks the collection.
#[derive(Debug, Clone)]
pub struct Document {
    collection: Collection,
    value: Value,
}

impl Document {
    pub(crate) fn new(collection: Collection, value: Value) -> Self {
        Self { collection, value }
    }

    /// Returns the instance id.
    #[must_use]
    pub fn id(&self) -> &str {
        self.value
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Returns the owning collection.
    #[must_use]
    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    /// Returns a top-level field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.value.get(field)
    }

    /// Sets a top-level field. Changing `_id` is not allowed and is ignored.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        if field != ID_FIELD {
            if let Value::Object(map) = &mut self.value {
                map.insert(field.to_owned(), value.into());
            }
        }
        self
    }

    /// Returns the raw instance.
    #[must_use]
    pub fn data(&self) -> &Value {
        &self.value
    }

    /// Returns the raw instance for in-place edits.
    pub fn data_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    /// Validates and stores the current value.
    pub fn save(&self) -> CoreResult<()> {
        self.collection.save(vec![self.value.clone()])?;
        Ok(())
    }

    /// Deletes the instance from the collection.
    pub fn remove(&self) -> CoreResult<()> {
        self.collection.delete([self.id()])
    }

    /// Returns true if the instance is stored.
    pub fn exists(&self) -> CoreResult<bool> {
        self.collection.has(self.id())
    }

    /// Returns a copy of the raw instance.
    #[must_use]
    pub fn to_json(&self) -> Value {
        self.value.clone()
    }

    /// Consumes the document, returning the raw instance.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.value
    }
}
