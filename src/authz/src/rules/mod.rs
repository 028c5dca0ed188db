//! Role rules: model, configuration schema, loading and indexing
//!
//! A rule grants a role on the instances of a type to the groups reached by walking
//! a short path of attribute and association hops from each instance. Inheritance
//! rules re-derive a role from a role already held on the objects the path reaches.
//!
//! # Example
//!
//! ```rust
//! use rolegraph_authz::rules::{load_rules, RoleRulesConfig, RuleConfig};
//! use rolegraph_core::{TypeDef, TypeModel};
//!
//! let model = TypeModel::from_types([
//!     TypeDef::new("Project").with_reference("owner", "Person"),
//!     TypeDef::new("Person"),
//! ])
//! .unwrap();
//!
//! let config = RoleRulesConfig::new(vec![
//!     RuleConfig::new("project-owner", "Project", "Member").attribute("owner", false),
//! ]);
//!
//! let (index, problems) = load_rules(&config, &model, &[]).unwrap();
//! assert!(problems.is_empty());
//! assert_eq!(index.rules_for_type("Project").len(), 1);
//! assert_eq!(index.rules_for_attribute("owner").len(), 1);
//! ```

pub mod config;
pub mod index;
pub mod loader;
pub mod types;

#[cfg(test)]
mod tests;

pub use config::{PathStepConfig, RoleRulesConfig, RuleConfig};
pub use index::{resolve, ResolvedRules, RuleIndex, RuleRegistry};
pub use loader::load_rules;
pub use types::{EdgeKind, Hop, PathElement, Rule, RuleProblem, RuleTarget, RuleType};
