//! Type model: concrete and abstract types, their specializations and attributes

use super::TypeName;
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// A reference attribute declared on a type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDef {
    pub name: String,
    /// Type the attribute points to, if constrained
    #[serde(default)]
    pub target_type: Option<TypeName>,
    #[serde(default)]
    pub multiple: bool,
}

/// Declaration of a single type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: TypeName,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    /// Storage-type tag shared by all instances persisted in the same table
    #[serde(default)]
    pub storage_type: Option<String>,
    #[serde(default)]
    pub generalizations: Vec<TypeName>,
    #[serde(default)]
    pub attributes: Vec<AttributeDef>,
}

impl TypeDef {
    /// Create a concrete type without attributes
    pub fn new(name: impl Into<TypeName>) -> Self {
        Self {
            name: name.into(),
            is_abstract: false,
            storage_type: None,
            generalizations: Vec::new(),
            attributes: Vec::new(),
        }
    }

    /// Mark the type abstract
    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Add a direct generalization
    pub fn extends(mut self, parent: impl Into<TypeName>) -> Self {
        self.generalizations.push(parent.into());
        self
    }

    /// Set the storage-type tag
    pub fn with_storage_type(mut self, tag: impl Into<String>) -> Self {
        self.storage_type = Some(tag.into());
        self
    }

    /// Declare a reference attribute
    pub fn with_reference(mut self, name: impl Into<String>, target: impl Into<TypeName>) -> Self {
        self.attributes.push(AttributeDef {
            name: name.into(),
            target_type: Some(target.into()),
            multiple: false,
        });
        self
    }

    /// Declare a multi-valued reference attribute
    pub fn with_references(mut self, name: impl Into<String>, target: impl Into<TypeName>) -> Self {
        self.attributes.push(AttributeDef {
            name: name.into(),
            target_type: Some(target.into()),
            multiple: true,
        });
        self
    }
}

/// The type graph the rule set is resolved against
#[derive(Debug, Clone, Default)]
pub struct TypeModel {
    types: BTreeMap<TypeName, TypeDef>,
    specializations: BTreeMap<TypeName, BTreeSet<TypeName>>,
}

impl TypeModel {
    /// Create an empty model
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a model from type declarations, checking that every generalization exists
    pub fn from_types(defs: impl IntoIterator<Item = TypeDef>) -> Result<Self> {
        let mut model = Self::new();
        for def in defs {
            model.insert(def)?;
        }
        model.validate()?;
        Ok(model)
    }

    /// Parse a JSON array of type declarations
    pub fn from_json(json: &str) -> Result<Self> {
        let defs: Vec<TypeDef> = serde_json::from_str(json)?;
        Self::from_types(defs)
    }

    fn insert(&mut self, def: TypeDef) -> Result<()> {
        if self.types.contains_key(&def.name) {
            return Err(CoreError::model(format!("duplicate type {}", def.name)));
        }
        for parent in &def.generalizations {
            self.specializations
                .entry(parent.clone())
                .or_default()
                .insert(def.name.clone());
        }
        self.types.insert(def.name.clone(), def);
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for def in self.types.values() {
            for parent in &def.generalizations {
                if !self.types.contains_key(parent) {
                    return Err(CoreError::model(format!(
                        "type {} extends unknown type {}",
                        def.name, parent
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeDef> {
        self.types.values()
    }

    pub fn is_abstract(&self, name: &str) -> bool {
        self.types.get(name).map(|t| t.is_abstract).unwrap_or(false)
    }

    /// Direct specializations of a type
    pub fn specializations(&self, name: &str) -> impl Iterator<Item = &TypeName> {
        self.specializations.get(name).into_iter().flatten()
    }

    /// The type itself (if concrete) plus every concrete type below it
    pub fn concrete_specializations(&self, name: &str) -> BTreeSet<TypeName> {
        let mut result = BTreeSet::new();
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([name.to_string()]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if self.types.get(&current).map(|t| !t.is_abstract).unwrap_or(false) {
                result.insert(current.clone());
            }
            queue.extend(self.specializations(&current).cloned());
        }
        result
    }

    /// All generalizations of a type, nearest first, excluding the type itself
    pub fn generalizations(&self, name: &str) -> Vec<TypeName> {
        let mut result = Vec::new();
        let mut queue: VecDeque<TypeName> = self
            .types
            .get(name)
            .map(|t| t.generalizations.iter().cloned().collect())
            .unwrap_or_default();
        while let Some(current) = queue.pop_front() {
            if result.contains(&current) {
                continue;
            }
            if let Some(def) = self.types.get(&current) {
                queue.extend(def.generalizations.iter().cloned());
            }
            result.push(current);
        }
        result
    }

    pub fn is_subtype_of(&self, sub: &str, sup: &str) -> bool {
        sub == sup || self.generalizations(sub).iter().any(|g| g == sup)
    }

    /// Look up an attribute on a type or any of its generalizations
    pub fn find_attribute(&self, type_name: &str, attribute: &str) -> Option<&AttributeDef> {
        std::iter::once(type_name.to_string())
            .chain(self.generalizations(type_name))
            .filter_map(|t| self.types.get(&t))
            .flat_map(|def| def.attributes.iter())
            .find(|a| a.name == attribute)
    }

    /// Storage-type tag of a type: its own tag, the nearest inherited one, or its name
    pub fn storage_type_of(&self, type_name: &str) -> String {
        std::iter::once(type_name.to_string())
            .chain(self.generalizations(type_name))
            .filter_map(|t| self.types.get(&t).and_then(|def| def.storage_type.clone()))
            .next()
            .unwrap_or_else(|| type_name.to_string())
    }

    /// Whether some type carries this storage-type tag
    pub fn is_storage_type(&self, tag: &str) -> bool {
        self.types
            .values()
            .any(|def| def.storage_type.as_deref() == Some(tag))
    }
}
