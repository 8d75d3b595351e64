use std::path::Path;

use arbor_replica::ReplicaConfig;
use arbor_tree::PreconditionPolicy;
use serde::{Deserialize, Serialize};

use crate::error::{SdkError, SdkResult};

/// Settings for one [`Arbor`](crate::Arbor) instance.
///
/// ```toml
/// name = "planets"
///
/// [precondition]
/// default = "identity"
/// overrides = { record = "structural" }
///
/// [replica]
/// collection = "planets"
/// max_write_attempts = 4
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArborConfig {
    /// Instance name, used in logs.
    pub name: String,
    pub precondition: PreconditionPolicy,
    /// Replication settings; local-only when absent.
    pub replica: Option<ReplicaConfig>,
}

impl Default for ArborConfig {
    fn default() -> Self {
        Self {
            name: "arbor".into(),
            precondition: PreconditionPolicy::default(),
            replica: None,
        }
    }
}

impl ArborConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Replicated through a collection named after the instance.
    pub fn replicated(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            replica: Some(ReplicaConfig::new(name.clone())),
            ..Self::new(name)
        }
    }

    pub fn from_toml_str(text: &str) -> SdkResult<Self> {
        toml::from_str(text).map_err(|e| SdkError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> SdkResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> SdkResult<String> {
        toml::to_string(self).map_err(|e| SdkError::Config(e.to_string()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> SdkResult<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }
}
