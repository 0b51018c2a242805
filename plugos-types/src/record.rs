use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single persisted record: a unique key and an arbitrary JSON value.
///
/// This is also the element shape of `store.batchSet` arguments and
/// `store.query` results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvPair {
    pub key: String,
    pub value: Value,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    /// Looks up a top-level property of the value.
    ///
    /// Returns `None` when the value is not an object or lacks the property.
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.value.as_object().and_then(|obj| obj.get(name))
    }
}
