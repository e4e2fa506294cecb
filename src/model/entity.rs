use serde::{Deserialize, Serialize};

/// A monitored city or region. Entities come from configuration only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub region: String,
    /// Fixed training seed; derived from `id` and the base seed when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Entity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            region: String::new(),
            seed: None,
        }
    }
}
