// ============================================================
// Layer 3 — Text Example
// ============================================================
// One raw example as a task's data source yields it, before
// tokenization. Feature names match the sequence length keys.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextExample {
    pub inputs:  String,
    pub targets: String,
}

impl TextExample {
    pub fn new(inputs: impl Into<String>, targets: impl Into<String>) -> Self {
        Self {
            inputs:  inputs.into(),
            targets: targets.into(),
        }
    }

    /// Text for a feature key, if this example carries it
    pub fn feature(&self, key: &str) -> Option<&str> {
        match key {
            "inputs"  => Some(&self.inputs),
            "targets" => Some(&self.targets),
            _ => None,
        }
    }
}
