//! Serde schema of the role rule configuration

use super::types::RuleType;
use crate::error::{Result, SecurityError};
use crate::types::{ObjectId, RoleId, RuleId, TypeName};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level rule configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRulesConfig {
    /// Declared roles; when non-empty, rules naming other roles are rejected
    #[serde(default)]
    pub roles: Vec<RoleId>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl RoleRulesConfig {
    pub fn new(rules: Vec<RuleConfig>) -> Self {
        Self {
            roles: Vec::new(),
            rules,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SecurityError::config(format!("cannot read rule config {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// BLAKE3 hex digest of the canonical JSON form
    ///
    /// Persisted next to the role index; a different value at startup means the
    /// index was built from another rule set.
    pub fn version_hash(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}

/// One rule entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: RuleId,
    /// Target type; mutually exclusive with `storage_type`
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub target_type: Option<TypeName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_type: Option<String>,
    #[serde(default)]
    pub inherit: bool,
    #[serde(default)]
    pub role: RoleId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_role: Option<RoleId>,
    /// Type whose instances carry the source role (inheritance rules)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<TypeName>,
    #[serde(default)]
    pub kind: RuleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<ObjectId>,
    #[serde(default)]
    pub path: Vec<PathStepConfig>,
}

impl RuleConfig {
    /// Plain rule on a type
    pub fn new(id: impl Into<RuleId>, target_type: impl Into<TypeName>, role: impl Into<RoleId>) -> Self {
        Self {
            id: id.into(),
            target_type: Some(target_type.into()),
            storage_type: None,
            inherit: false,
            role: role.into(),
            source_role: None,
            source_type: None,
            kind: RuleType::Plain,
            base: None,
            path: Vec::new(),
        }
    }

    /// Plain rule on a storage-type tag
    pub fn on_storage_type(id: impl Into<RuleId>, storage_type: impl Into<String>, role: impl Into<RoleId>) -> Self {
        let mut config = Self::new(id, String::new(), role);
        config.target_type = None;
        config.storage_type = Some(storage_type.into());
        config
    }

    pub fn inherited(mut self) -> Self {
        self.inherit = true;
        self
    }

    pub fn from_source_role(mut self, source_role: impl Into<RoleId>) -> Self {
        self.kind = RuleType::Inheritance;
        self.source_role = Some(source_role.into());
        self
    }

    pub fn with_source_type(mut self, source_type: impl Into<TypeName>) -> Self {
        self.source_type = Some(source_type.into());
        self
    }

    pub fn with_base(mut self, base: impl Into<ObjectId>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, inverse: bool) -> Self {
        self.path.push(PathStepConfig {
            source_type: None,
            attribute: Some(name.into()),
            association: None,
            inverse,
        });
        self
    }

    pub fn association(mut self, name: impl Into<String>, inverse: bool) -> Self {
        self.path.push(PathStepConfig {
            source_type: None,
            attribute: None,
            association: Some(name.into()),
            inverse,
        });
        self
    }

    /// Set the declared type of the most recently added step
    pub fn from_type(mut self, type_name: impl Into<TypeName>) -> Self {
        if let Some(step) = self.path.last_mut() {
            step.source_type = Some(type_name.into());
        }
        self
    }
}

/// One path step: referenced type, attribute-or-association name, direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathStepConfig {
    /// Type declaring the attribute; may be omitted on the first step only
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<TypeName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub association: Option<String>,
    #[serde(default)]
    pub inverse: bool,
}
