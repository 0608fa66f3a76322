//! Policy rule evaluation.
//!
//! Rules are priority-ordered, deterministic, first match wins. `warn`
//! permits the write but annotates the response.

use std::collections::HashMap;

use crate::model::{PolicyAction, PolicyRule, labels_match};

/// Outcome of evaluating the rule chain for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow { warnings: Vec<String> },
    Deny { rule: String, message: String },
}

fn rule_matches(rule: &PolicyRule, kind: &str, verb: &str, labels: &HashMap<String, String>) -> bool {
    if !rule.kind.is_empty() && rule.kind != kind {
        return false;
    }
    if !rule.verb.is_empty() && rule.verb != verb {
        return false;
    }
    labels_match(labels, &rule.match_labels)
}

pub fn evaluate(
    rules: &[PolicyRule],
    kind: &str,
    verb: &str,
    labels: &HashMap<String, String>,
) -> PolicyDecision {
    let mut ordered: Vec<&PolicyRule> = rules.iter().collect();
    // Priority, then name, so evaluation order is total.
    ordered.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));

    for rule in ordered {
        if !rule_matches(rule, kind, verb, labels) {
            continue;
        }
        return match rule.action {
            PolicyAction::Allow => PolicyDecision::Allow { warnings: vec![] },
            PolicyAction::Warn => PolicyDecision::Allow {
                warnings: vec![
                    rule.message
                        .clone()
                        .unwrap_or_else(|| format!("policy rule '{}' warns", rule.name)),
                ],
            },
            PolicyAction::Deny => PolicyDecision::Deny {
                rule: rule.name.clone(),
                message: rule
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("denied by policy rule '{}'", rule.name)),
            },
        };
    }
    PolicyDecision::Allow { warnings: vec![] }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, priority: u32, kind: &str, action: PolicyAction) -> PolicyRule {
        PolicyRule {
            name: name.to_string(),
            priority,
            kind: kind.to_string(),
            verb: String::new(),
            match_labels: HashMap::new(),
            action,
            message: None,
        }
    }

    #[test]
    fn test_no_rules_allows() {
        let d = evaluate(&[], "vm", "create", &HashMap::new());
        assert_eq!(d, PolicyDecision::Allow { warnings: vec![] });
    }

    #[test]
    fn test_first_match_wins_by_priority() {
        let rules = vec![
            rule("deny-all-vms", 10, "vm", PolicyAction::Deny),
            rule("allow-vms", 1, "vm", PolicyAction::Allow),
        ];
        // The allow has lower priority number and fires first.
        let d = evaluate(&rules, "vm", "create", &HashMap::new());
        assert!(matches!(d, PolicyDecision::Allow { .. }));
    }

    #[test]
    fn test_deny_matches_kind_and_verb() {
        let mut deny = rule("no-vm-delete", 1, "vm", PolicyAction::Deny);
        deny.verb = "delete".to_string();
        let rules = vec![deny];

        assert!(matches!(
            evaluate(&rules, "vm", "delete", &HashMap::new()),
            PolicyDecision::Deny { .. }
        ));
        assert!(matches!(
            evaluate(&rules, "vm", "create", &HashMap::new()),
            PolicyDecision::Allow { .. }
        ));
        assert!(matches!(
            evaluate(&rules, "volume", "delete", &HashMap::new()),
            PolicyDecision::Allow { .. }
        ));
    }

    #[test]
    fn test_warn_permits_with_annotation() {
        let mut warn = rule("flag-gpu", 1, "vm", PolicyAction::Warn);
        warn.match_labels.insert("gpu".to_string(), "true".to_string());
        warn.message = Some("GPU VMs are billed hourly".to_string());
        let rules = vec![warn];

        let mut labels = HashMap::new();
        labels.insert("gpu".to_string(), "true".to_string());
        match evaluate(&rules, "vm", "create", &labels) {
            PolicyDecision::Allow { warnings } => {
                assert_eq!(warnings, vec!["GPU VMs are billed hourly".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Without the label the rule does not fire.
        match evaluate(&rules, "vm", "create", &HashMap::new()) {
            PolicyDecision::Allow { warnings } => assert!(warnings.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
