//! Rule index: inheritance expansion and change-detection lookups
//!
//! The index is built once per rule set and never mutated afterwards. A reload
//! builds a new index off to the side and publishes it through [`RuleRegistry`],
//! so readers only ever see a complete index.

use super::types::{Rule, RuleTarget};
use crate::provider::{ExternalRoleProvider, RoleProvider};
use crate::types::{RoleId, RuleId, TypeName};
use arc_swap::ArcSwap;
use rolegraph_core::{ObjectGraph, TypeModel};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Rules resolved against the type model
#[derive(Debug, Default)]
pub struct ResolvedRules {
    pub providers: Vec<RoleProvider>,
    /// concrete type -> rules applying to its instances
    pub by_type: HashMap<TypeName, Vec<RoleProvider>>,
    /// storage-type tag -> rules declared on it
    pub by_storage_type: HashMap<String, Vec<RoleProvider>>,
}

/// Collect the concrete types an expanded rule lands on
///
/// The declared type is included when concrete; with `inherit` every
/// specialization is visited recursively.
fn add_to_sub_elements(model: &TypeModel, type_name: &str, inherit: bool, out: &mut BTreeSet<TypeName>) {
    if !model.is_abstract(type_name) {
        out.insert(type_name.to_string());
    }
    if inherit {
        for specialization in model.specializations(type_name) {
            if !out.contains(specialization) {
                add_to_sub_elements(model, specialization, inherit, out);
            }
        }
    }
}

/// Expand rules to their concrete types and index them by type and storage type
pub fn resolve(rules: Vec<Rule>, model: &TypeModel) -> ResolvedRules {
    let mut resolved = ResolvedRules::default();
    for mut rule in rules {
        if let RuleTarget::Type(type_name) = &rule.target {
            let mut concrete = BTreeSet::new();
            add_to_sub_elements(model, type_name, rule.inherit, &mut concrete);
            rule.concrete_types = concrete;
        }
        let provider = RoleProvider::from_rule(rule);
        if let Some(rule) = provider.rule() {
            match &rule.target {
                RuleTarget::Type(_) => {
                    for type_name in &rule.concrete_types {
                        resolved
                            .by_type
                            .entry(type_name.clone())
                            .or_default()
                            .push(provider.clone());
                    }
                }
                RuleTarget::StorageType(tag) => {
                    resolved
                        .by_storage_type
                        .entry(tag.clone())
                        .or_default()
                        .push(provider.clone());
                }
            }
        }
        resolved.providers.push(provider);
    }
    resolved
}

/// Immutable lookup structure over all role providers
#[derive(Debug, Default)]
pub struct RuleIndex {
    providers: BTreeMap<RuleId, RoleProvider>,
    by_type: HashMap<TypeName, Vec<RoleProvider>>,
    by_storage_type: HashMap<String, Vec<RoleProvider>>,
    by_attribute: HashMap<String, Vec<RoleProvider>>,
    by_association: HashMap<String, Vec<RoleProvider>>,
    by_role: HashMap<RoleId, Vec<RoleProvider>>,
    by_source_role: HashMap<RoleId, Vec<RoleProvider>>,
    by_affecting_type: HashMap<String, Vec<RoleProvider>>,
    externals: Vec<RoleProvider>,
    version: String,
}

impl RuleIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build an index from validated rules and external providers
    ///
    /// Ids must be unique; a later duplicate replaces nothing and is ignored.
    pub fn build(
        rules: Vec<Rule>,
        model: &TypeModel,
        externals: Vec<Arc<dyn ExternalRoleProvider>>,
        version: impl Into<String>,
    ) -> Self {
        let mut seen = BTreeSet::new();
        let rules: Vec<Rule> = rules.into_iter().filter(|r| seen.insert(r.id.clone())).collect();
        let externals: Vec<RoleProvider> = externals
            .into_iter()
            .filter(|p| seen.insert(p.id().to_string()))
            .map(RoleProvider::External)
            .collect();

        let resolved = resolve(rules, model);
        let mut index = RuleIndex {
            by_type: resolved.by_type,
            by_storage_type: resolved.by_storage_type,
            version: version.into(),
            ..Default::default()
        };
        for provider in resolved.providers.into_iter().chain(externals) {
            index.insert(provider);
        }
        index
    }

    fn insert(&mut self, provider: RoleProvider) {
        if let Some(rule) = provider.rule() {
            let attributes: BTreeSet<&str> = rule.attributes().collect();
            for attribute in attributes {
                self.by_attribute
                    .entry(attribute.to_string())
                    .or_default()
                    .push(provider.clone());
            }
            let associations: BTreeSet<&str> = rule.associations().collect();
            for association in associations {
                self.by_association
                    .entry(association.to_string())
                    .or_default()
                    .push(provider.clone());
            }
        }
        if let RoleProvider::External(external) = &provider {
            for storage_type in external.affecting_types() {
                self.by_affecting_type
                    .entry(storage_type)
                    .or_default()
                    .push(provider.clone());
            }
            self.externals.push(provider.clone());
        }
        if let Some(source_role) = provider.source_role() {
            self.by_source_role
                .entry(source_role.to_string())
                .or_default()
                .push(provider.clone());
        }
        self.by_role
            .entry(provider.role().to_string())
            .or_default()
            .push(provider.clone());
        self.providers.insert(provider.id().to_string(), provider);
    }

    /// Hash of the rule configuration this index was built from
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&RoleProvider> {
        self.providers.get(id)
    }

    /// All providers in id order
    pub fn providers(&self) -> impl Iterator<Item = &RoleProvider> {
        self.providers.values()
    }

    pub fn rules_for_type(&self, type_name: &str) -> &[RoleProvider] {
        self.by_type.get(type_name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn rules_for_storage_type(&self, storage_type: &str) -> &[RoleProvider] {
        self.by_storage_type.get(storage_type).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn rules_for_attribute(&self, attribute: &str) -> &[RoleProvider] {
        self.by_attribute.get(attribute).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn rules_for_association(&self, association: &str) -> &[RoleProvider] {
        self.by_association.get(association).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn rules_with_role(&self, role: &str) -> &[RoleProvider] {
        self.by_role.get(role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Inheritance rules and external providers deriving from `role`
    pub fn rules_with_source_role(&self, role: &str) -> &[RoleProvider] {
        self.by_source_role.get(role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// External providers re-evaluated when objects of a storage type change
    pub fn providers_affected_by(&self, storage_type: &str) -> &[RoleProvider] {
        self.by_affecting_type.get(storage_type).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn externals(&self) -> &[RoleProvider] {
        &self.externals
    }

    /// Providers to evaluate for an object: its concrete type, its storage type, and matching externals
    pub fn rules_for_object(&self, graph: &dyn ObjectGraph, object: &str) -> Vec<RoleProvider> {
        let Some(info) = graph.object_info(object) else {
            return Vec::new();
        };
        let mut providers: Vec<RoleProvider> = self
            .rules_for_type(&info.type_name)
            .iter()
            .chain(self.rules_for_storage_type(&info.storage_type))
            .cloned()
            .collect();
        providers.extend(
            self.externals
                .iter()
                .filter(|p| p.matches(graph, object))
                .cloned(),
        );
        providers
    }
}

/// Holder of the current rule index with atomic replacement
pub struct RuleRegistry {
    current: ArcSwap<RuleIndex>,
}

impl RuleRegistry {
    pub fn new(index: RuleIndex) -> Self {
        Self {
            current: ArcSwap::from_pointee(index),
        }
    }

    /// Snapshot of the current index
    pub fn load(&self) -> Arc<RuleIndex> {
        self.current.load_full()
    }

    /// Publish a new index; returns the one it replaced
    pub fn publish(&self, index: RuleIndex) -> Arc<RuleIndex> {
        self.current.swap(Arc::new(index))
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new(RuleIndex::empty())
    }
}
