//! Rule loading and validation
//!
//! Validation never fails the load as a whole. Each problem is collected and the
//! offending rule is left out, so a broken rule behaves like an absent rule.

use super::config::{PathStepConfig, RoleRulesConfig, RuleConfig};
use super::index::RuleIndex;
use super::types::{EdgeKind, Hop, PathElement, Rule, RuleProblem, RuleTarget, RuleType};
use crate::error::Result;
use crate::provider::ExternalRoleProvider;
use crate::types::TypeName;
use rolegraph_core::TypeModel;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Load, validate and index a rule configuration
pub fn load_rules(
    config: &RoleRulesConfig,
    model: &TypeModel,
    externals: &[Arc<dyn ExternalRoleProvider>],
) -> Result<(RuleIndex, Vec<RuleProblem>)> {
    let builder = RuleBuilder::new(model, &config.roles);
    let mut seen: HashSet<&str> = externals.iter().map(|p| p.id()).collect();
    let mut rules = Vec::with_capacity(config.rules.len());
    let mut problems = Vec::new();

    for entry in &config.rules {
        if !seen.insert(entry.id.as_str()) {
            problems.push(RuleProblem::DuplicateId { rule: entry.id.clone() });
            continue;
        }
        match builder.build(entry) {
            Ok(rule) => rules.push(rule),
            Err(mut found) => problems.append(&mut found),
        }
    }

    for problem in &problems {
        warn!(rule = problem.rule_id(), problem = %problem, "role rule dropped");
    }

    let index = RuleIndex::build(rules, model, externals.to_vec(), config.version_hash()?);
    info!(
        rules = index.len(),
        problems = problems.len(),
        version = index.version(),
        "role rules loaded"
    );
    Ok((index, problems))
}

struct RuleBuilder<'a> {
    model: &'a TypeModel,
    roles: BTreeSet<&'a str>,
}

impl<'a> RuleBuilder<'a> {
    fn new(model: &'a TypeModel, roles: &'a [String]) -> Self {
        Self {
            model,
            roles: roles.iter().map(String::as_str).collect(),
        }
    }

    fn build(&self, entry: &RuleConfig) -> std::result::Result<Rule, Vec<RuleProblem>> {
        let mut problems = Vec::new();
        let id = &entry.id;

        if entry.role.is_empty() {
            problems.push(RuleProblem::MissingRole { rule: id.clone() });
        } else {
            self.check_role(id, &entry.role, &mut problems);
        }

        let rule_type = if entry.kind == RuleType::Inheritance || entry.source_role.is_some() {
            RuleType::Inheritance
        } else {
            RuleType::Plain
        };
        match (&rule_type, &entry.source_role) {
            (RuleType::Inheritance, None) => problems.push(RuleProblem::MissingSourceRole { rule: id.clone() }),
            (_, Some(source_role)) => self.check_role(id, source_role, &mut problems),
            _ => {}
        }

        let target = self.check_target(entry, &mut problems);

        if let Some(source_type) = &entry.source_type {
            if !self.model.contains(source_type) {
                problems.push(RuleProblem::UnknownType {
                    rule: id.clone(),
                    type_name: source_type.clone(),
                });
            } else if self.model.is_abstract(source_type) {
                problems.push(RuleProblem::AbstractInheritanceSource {
                    rule: id.clone(),
                    type_name: source_type.clone(),
                });
            }
        }

        let first_type = match &target {
            Some(RuleTarget::Type(type_name)) => Some(type_name.clone()),
            _ => None,
        };
        let mut path = Vec::with_capacity(entry.path.len());
        for (step, config) in entry.path.iter().enumerate() {
            if let Some(element) = self.build_step(id, step, config, first_type.as_ref(), &mut problems) {
                path.push(element);
            }
        }

        match target {
            Some(target) if problems.is_empty() => {
                let mut rule = Rule::new(id.clone(), target, entry.role.clone()).with_path(path);
                rule.inherit = entry.inherit;
                rule.rule_type = rule_type;
                rule.source_role = entry.source_role.clone();
                rule.base = entry.base.clone();
                Ok(rule)
            }
            _ => Err(problems),
        }
    }

    fn check_role(&self, rule: &str, role: &str, problems: &mut Vec<RuleProblem>) {
        if !self.roles.is_empty() && !self.roles.contains(role) {
            problems.push(RuleProblem::UnknownRole {
                rule: rule.to_string(),
                role: role.to_string(),
            });
        }
    }

    fn check_target(&self, entry: &RuleConfig, problems: &mut Vec<RuleProblem>) -> Option<RuleTarget> {
        let id = &entry.id;
        match (&entry.target_type, &entry.storage_type) {
            (Some(type_name), None) => {
                if !self.model.contains(type_name) {
                    problems.push(RuleProblem::UnknownType {
                        rule: id.clone(),
                        type_name: type_name.clone(),
                    });
                    None
                } else if self.model.is_abstract(type_name) && !entry.inherit {
                    problems.push(RuleProblem::AbstractTargetType {
                        rule: id.clone(),
                        type_name: type_name.clone(),
                    });
                    None
                } else {
                    Some(RuleTarget::Type(type_name.clone()))
                }
            }
            (None, Some(tag)) => {
                let known = self.model.is_storage_type(tag)
                    || self
                        .model
                        .types()
                        .any(|t| self.model.storage_type_of(&t.name) == *tag);
                if known {
                    Some(RuleTarget::StorageType(tag.clone()))
                } else {
                    problems.push(RuleProblem::UnknownStorageType {
                        rule: id.clone(),
                        storage_type: tag.clone(),
                    });
                    None
                }
            }
            _ => {
                problems.push(RuleProblem::AmbiguousTarget { rule: id.clone() });
                None
            }
        }
    }

    fn build_step(
        &self,
        rule: &str,
        step: usize,
        config: &PathStepConfig,
        first_type: Option<&TypeName>,
        problems: &mut Vec<RuleProblem>,
    ) -> Option<PathElement> {
        let (kind, name) = match (&config.attribute, &config.association) {
            (Some(attribute), None) => (EdgeKind::Attribute, attribute.clone()),
            (None, Some(association)) => (EdgeKind::Association, association.clone()),
            _ => {
                problems.push(RuleProblem::InvalidStep {
                    rule: rule.to_string(),
                    step,
                });
                return None;
            }
        };

        // Only the first hop may fall back to the rule's own type
        let source_type = match (&config.source_type, step) {
            (Some(type_name), _) => Some(type_name.clone()),
            (None, 0) => first_type.cloned(),
            (None, _) => {
                problems.push(RuleProblem::MissingStepType {
                    rule: rule.to_string(),
                    step,
                });
                return None;
            }
        };

        if let Some(type_name) = &source_type {
            if !self.model.contains(type_name) {
                problems.push(RuleProblem::UnknownType {
                    rule: rule.to_string(),
                    type_name: type_name.clone(),
                });
                return None;
            }
        }

        if kind == EdgeKind::Attribute {
            // An inverse first hop starts at the attribute's values, so without an
            // explicit type any declaring type will do
            let declared = match (&config.source_type, config.inverse) {
                (None, true) => self
                    .model
                    .types()
                    .any(|t| t.attributes.iter().any(|a| a.name == name)),
                _ => source_type
                    .as_ref()
                    .map(|t| self.declares_attribute(t, &name))
                    .unwrap_or(true),
            };
            if !declared {
                problems.push(RuleProblem::UnknownAttribute {
                    rule: rule.to_string(),
                    type_name: source_type.unwrap_or_default(),
                    attribute: name,
                });
                return None;
            }
        }

        Some(PathElement::Hop(Hop {
            kind,
            name,
            inverse: config.inverse,
            source_type,
        }))
    }

    /// Declared on the type, a generalization, or (for abstract types) some specialization
    fn declares_attribute(&self, type_name: &str, attribute: &str) -> bool {
        self.model.find_attribute(type_name, attribute).is_some()
            || self
                .model
                .concrete_specializations(type_name)
                .iter()
                .any(|t| self.model.find_attribute(t, attribute).is_some())
    }
}
