//! Tests for rule loading, validation and inheritance expansion

use super::*;
use proptest::prelude::*;
use rolegraph_core::{TypeDef, TypeModel};
use std::collections::BTreeSet;

fn model() -> TypeModel {
    TypeModel::from_types([
        TypeDef::new("Element")
            .abstract_type()
            .with_storage_type("StructuredElement")
            .with_reference("parent", "Element"),
        TypeDef::new("Project").extends("Element").with_reference("owner", "Person"),
        TypeDef::new("SubProject").extends("Project"),
        TypeDef::new("AbstractDoc").abstract_type().extends("Element"),
        TypeDef::new("Report").extends("AbstractDoc").with_reference("author", "Person"),
        TypeDef::new("Placeholder").abstract_type(),
        TypeDef::new("Task"),
        TypeDef::new("Person"),
    ])
    .unwrap()
}

fn load(rules: Vec<RuleConfig>) -> (RuleIndex, Vec<RuleProblem>) {
    load_rules(&RoleRulesConfig::new(rules), &model(), &[]).unwrap()
}

fn types_of(index: &RuleIndex, rule_id: &str) -> BTreeSet<String> {
    ["Element", "Project", "SubProject", "AbstractDoc", "Report", "Task", "Person"]
        .iter()
        .filter(|t| index.rules_for_type(t).iter().any(|p| p.id() == rule_id))
        .map(|t| t.to_string())
        .collect()
}

// ============================================================================
// Inheritance Expansion Tests
// ============================================================================

#[test]
fn test_inherit_expands_to_concrete_specializations() {
    let (index, problems) = load(vec![RuleConfig::new("r", "Element", "Reader").inherited()]);

    assert!(problems.is_empty());
    assert_eq!(
        types_of(&index, "r"),
        BTreeSet::from(["Project".to_string(), "SubProject".to_string(), "Report".to_string()])
    );
}

#[test]
fn test_without_inherit_only_declared_type() {
    let (index, _) = load(vec![RuleConfig::new("r", "Project", "Member").attribute("owner", false)]);

    assert_eq!(types_of(&index, "r"), BTreeSet::from(["Project".to_string()]));
}

#[test]
fn test_abstract_type_without_inherit_is_dropped() {
    let (index, problems) = load(vec![RuleConfig::new("r", "Element", "Reader")]);

    assert!(index.is_empty());
    assert_eq!(
        problems,
        vec![RuleProblem::AbstractTargetType {
            rule: "r".into(),
            type_name: "Element".into()
        }]
    );
}

// ============================================================================
// Validation Tests
// ============================================================================

#[test]
fn test_unknown_type_and_attribute() {
    let (index, problems) = load(vec![
        RuleConfig::new("a", "Missing", "Member"),
        RuleConfig::new("b", "Project", "Member").attribute("nope", false),
        RuleConfig::new("c", "Project", "Member").attribute("owner", false),
    ]);

    assert_eq!(index.len(), 1);
    assert!(index.get("c").is_some());
    assert_eq!(problems.len(), 2);
    assert!(matches!(&problems[0], RuleProblem::UnknownType { type_name, .. } if type_name == "Missing"));
    assert!(matches!(&problems[1], RuleProblem::UnknownAttribute { attribute, .. } if attribute == "nope"));
}

#[test]
fn test_later_steps_need_explicit_type() {
    let (_, problems) = load(vec![
        RuleConfig::new("r", "Project", "Member")
            .attribute("parent", false)
            .attribute("owner", false),
    ]);
    assert_eq!(problems, vec![RuleProblem::MissingStepType { rule: "r".into(), step: 1 }]);

    let (index, problems) = load(vec![
        RuleConfig::new("r", "Project", "Member")
            .attribute("parent", false)
            .attribute("owner", false)
            .from_type("Project"),
    ]);
    assert!(problems.is_empty());
    assert_eq!(index.get("r").and_then(|p| p.rule()).map(|r| r.path.len()), Some(2));
}

#[test]
fn test_inverse_first_step_checks_any_declaring_type() {
    let (index, problems) = load(vec![RuleConfig::new("r", "Person", "Owner").attribute("owner", true)]);
    assert!(problems.is_empty());
    assert_eq!(index.rules_for_attribute("owner").len(), 1);
}

#[test]
fn test_step_must_name_one_edge() {
    let mut rule = RuleConfig::new("r", "Project", "Member").attribute("owner", false);
    rule.path[0].association = Some("belongsTo".into());
    let (_, problems) = load(vec![rule]);
    assert_eq!(problems, vec![RuleProblem::InvalidStep { rule: "r".into(), step: 0 }]);
}

#[test]
fn test_duplicate_ids_keep_first() {
    let (index, problems) = load(vec![
        RuleConfig::new("r", "Project", "Member"),
        RuleConfig::new("r", "Task", "Viewer"),
    ]);
    assert_eq!(problems, vec![RuleProblem::DuplicateId { rule: "r".into() }]);
    assert_eq!(index.get("r").map(|p| p.role().to_string()), Some("Member".to_string()));
}

#[test]
fn test_inheritance_rule_needs_source_role() {
    let mut rule = RuleConfig::new("r", "Task", "Viewer").association("belongsTo", true);
    rule.kind = RuleType::Inheritance;
    let (_, problems) = load(vec![rule]);
    assert_eq!(problems, vec![RuleProblem::MissingSourceRole { rule: "r".into() }]);
}

#[test]
fn test_abstract_inheritance_source_is_rejected() {
    let (index, problems) = load(vec![
        RuleConfig::new("r", "Task", "Viewer")
            .from_source_role("Member")
            .with_source_type("Placeholder")
            .association("belongsTo", true),
    ]);
    assert!(matches!(&problems[0], RuleProblem::AbstractInheritanceSource { type_name, .. } if type_name == "Placeholder"));
    assert!(index.is_empty());

    // Having concrete specializations does not make an abstract source acceptable
    let (index, problems) = load(vec![
        RuleConfig::new("r", "Task", "Viewer")
            .from_source_role("Member")
            .with_source_type("Element")
            .association("belongsTo", true),
    ]);
    assert!(matches!(&problems[0], RuleProblem::AbstractInheritanceSource { type_name, .. } if type_name == "Element"));
    assert!(index.is_empty());

    let (index, problems) = load(vec![
        RuleConfig::new("r", "Task", "Viewer")
            .from_source_role("Member")
            .with_source_type("Project")
            .association("belongsTo", true),
    ]);
    assert!(problems.is_empty());
    assert_eq!(index.len(), 1);
}

#[test]
fn test_declared_roles_are_enforced() {
    let config = RoleRulesConfig {
        roles: vec!["Member".into()],
        rules: vec![
            RuleConfig::new("ok", "Project", "Member"),
            RuleConfig::new("bad", "Project", "Auditor"),
        ],
    };
    let (index, problems) = load_rules(&config, &model(), &[]).unwrap();
    assert_eq!(index.len(), 1);
    assert_eq!(
        problems,
        vec![RuleProblem::UnknownRole {
            rule: "bad".into(),
            role: "Auditor".into()
        }]
    );
    assert_eq!(problems[0].to_string(), "rule 'bad': unknown role 'Auditor'");
}

#[test]
fn test_storage_type_rules() {
    let (index, problems) = load(vec![
        RuleConfig::on_storage_type("s", "StructuredElement", "Reader"),
        RuleConfig::on_storage_type("bad", "NoSuchTable", "Reader"),
    ]);
    assert_eq!(problems.len(), 1);
    assert_eq!(index.rules_for_storage_type("StructuredElement").len(), 1);
    assert!(types_of(&index, "s").is_empty());
}

// ============================================================================
// Index Lookup Tests
// ============================================================================

#[test]
fn test_empty_path_becomes_identity() {
    let (index, _) = load(vec![RuleConfig::new("r", "Person", "Self")]);
    let rule = index.get("r").and_then(|p| p.rule()).cloned().unwrap();
    assert_eq!(rule.path, vec![PathElement::Identity]);
}

#[test]
fn test_lookup_by_association_and_source_role() {
    let (index, _) = load(vec![
        RuleConfig::new("r1", "Project", "Member").attribute("owner", false),
        RuleConfig::new("r2", "Task", "Viewer")
            .from_source_role("Member")
            .association("belongsTo", true),
    ]);

    assert_eq!(index.rules_for_association("belongsTo")[0].id(), "r2");
    assert_eq!(index.rules_with_source_role("Member")[0].id(), "r2");
    assert!(index.rules_with_source_role("Viewer").is_empty());
    assert_eq!(index.rules_with_role("Member")[0].id(), "r1");
}

#[test]
fn test_registry_publishes_atomically() {
    let registry = RuleRegistry::default();
    assert!(registry.load().is_empty());

    let (index, _) = load(vec![RuleConfig::new("r1", "Project", "Member")]);
    let version = index.version().to_string();
    let before = registry.load();
    let previous = registry.publish(index);

    assert!(previous.is_empty());
    assert!(before.is_empty());
    assert_eq!(registry.load().version(), version);
    assert_eq!(registry.load().len(), 1);
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #[test]
    fn prop_inherit_expansion_matches_concrete_descendants(
        parents in prop::collection::vec(any::<prop::sample::Index>(), 1..10),
        abstract_flags in prop::collection::vec(any::<bool>(), 11),
    ) {
        // T0 is the root; T(i+1) extends some earlier type
        let count = parents.len() + 1;
        let parent_of: Vec<Option<usize>> = std::iter::once(None)
            .chain(parents.iter().enumerate().map(|(i, idx)| Some(idx.index(i + 1))))
            .collect();
        let defs = (0..count).map(|i| {
            let mut def = TypeDef::new(format!("T{}", i));
            if abstract_flags[i] {
                def = def.abstract_type();
            }
            if let Some(p) = parent_of[i] {
                def = def.extends(format!("T{}", p));
            }
            def
        });
        let model = TypeModel::from_types(defs).unwrap();

        for declared in 0..count {
            let config = RoleRulesConfig::new(vec![RuleConfig::new("r", format!("T{}", declared), "Role").inherited()]);
            let (index, problems) = load_rules(&config, &model, &[]).unwrap();
            prop_assert!(problems.is_empty());

            let mut expected = BTreeSet::new();
            for candidate in 0..count {
                let mut cursor = Some(candidate);
                while let Some(c) = cursor {
                    if c == declared {
                        if !abstract_flags[candidate] {
                            expected.insert(format!("T{}", candidate));
                        }
                        break;
                    }
                    cursor = parent_of[c];
                }
            }
            let actual: BTreeSet<String> = (0..count)
                .map(|i| format!("T{}", i))
                .filter(|t| !index.rules_for_type(t).is_empty())
                .collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
