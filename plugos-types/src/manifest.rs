use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named bundle of exported functions handed to an execution provider.
///
/// ```json
/// { "name": "test", "functions": { "test1": { "code": "..." } } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDefinition {
    pub name: String,
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionDefinition>,
}

impl PluginDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: BTreeMap::new(),
        }
    }

    /// Adds an exported function backed by `code`.
    pub fn function(mut self, name: impl Into<String>, code: impl Into<String>) -> Self {
        self.functions
            .insert(name.into(), FunctionDefinition { code: code.into() });
        self
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

/// One exported function. `code` is opaque to the host and only
/// interpreted by the execution provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub code: String,
}
