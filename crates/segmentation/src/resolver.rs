//! Dependency resolver: greedy subset cover of a new rule's conditions by the
//! condition sets of existing rules.
//!
//! A rule whose full condition set is covered by existing rules becomes an
//! INTERSECTION composite over them, plus whatever residual conditions no
//! existing rule covers.

use std::collections::{HashMap, HashSet};

use audience_core::{RuleId, SetOperation};
use serde::Serialize;
use tracing::{debug, info};

use crate::catalog::Rule;
use crate::condition::{Condition, ConditionSet};

/// Outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub dependencies: Vec<RuleId>,
    pub operation: SetOperation,
    /// Conditions of the new rule that no selected dependency covers, in
    /// their original order.
    pub residual: Vec<Condition>,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve `conditions` against `candidates`, never selecting `exclude`.
    pub fn resolve(
        &self,
        conditions: &[Condition],
        candidates: &[Rule],
        exclude: Option<RuleId>,
    ) -> Option<Resolution> {
        let excluded: HashSet<RuleId> = exclude.into_iter().collect();
        self.resolve_excluding(conditions, candidates, &excluded)
    }

    /// Like [`resolve`](Self::resolve) but skips every rule in `excluded`. Pass
    /// the rule itself and all of its dependents to keep the graph acyclic.
    pub fn resolve_excluding(
        &self,
        conditions: &[Condition],
        candidates: &[Rule],
        excluded: &HashSet<RuleId>,
    ) -> Option<Resolution> {
        let target = ConditionSet::from_conditions(conditions);
        if target.is_empty() {
            return None;
        }

        // Largest sets first, lowest id breaks ties.
        let by_id: HashMap<RuleId, &Rule> = candidates.iter().map(|r| (r.id, r)).collect();
        let mut usable: Vec<(RuleId, ConditionSet)> = candidates
            .iter()
            .filter(|r| r.active && !excluded.contains(&r.id))
            .filter(|r| is_reusable(r, &by_id, &mut HashSet::new()))
            .map(|r| (r.id, ConditionSet::from_conditions(&r.declared_conditions)))
            .filter(|(_, set)| !set.is_empty() && set.len() < target.len() && set.is_subset(&target))
            .collect();
        usable.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(&b.0)));

        let mut remaining = target;
        let mut dependencies = Vec::new();
        for (id, set) in usable {
            if remaining.is_empty() {
                break;
            }
            if set.is_subset(&remaining) {
                remaining = remaining.difference(&set);
                dependencies.push(id);
                debug!(dependency = %id, remaining = remaining.len(), "Selected covering rule");
            }
        }

        if dependencies.is_empty() {
            debug!(conditions = conditions.len(), "No covering rules found");
            metrics::counter!("resolver.misses").increment(1);
            return None;
        }

        let mut seen = HashSet::new();
        let residual: Vec<Condition> = conditions
            .iter()
            .filter(|c| {
                let key = c.key();
                remaining.contains(&key) && seen.insert(key)
            })
            .cloned()
            .collect();

        info!(
            dependencies = ?dependencies,
            residual = residual.len(),
            "Resolved rule as intersection of existing rules"
        );
        metrics::counter!("resolver.hits").increment(1);
        Some(Resolution {
            dependencies,
            operation: SetOperation::Intersection,
            residual,
        })
    }
}

/// Whether a rule's segment is exactly the users matching its declared
/// conditions. Holds for base rules and for intersections whose operands all
/// hold it; any UNION or DIFFERENCE below an intersection breaks it. Operands
/// missing from `rules` are taken at their declared conditions.
fn is_reusable(
    rule: &Rule,
    rules: &HashMap<RuleId, &Rule>,
    visiting: &mut HashSet<RuleId>,
) -> bool {
    match rule.operation {
        None => true,
        Some(SetOperation::Union) | Some(SetOperation::Difference) => false,
        Some(SetOperation::Intersection) => {
            if !visiting.insert(rule.id) {
                return false;
            }
            let reusable = rule.dependencies.iter().flatten().all(|dep| match rules.get(dep) {
                Some(operand) => is_reusable(operand, rules, visiting),
                None => true,
            });
            visiting.remove(&rule.id);
            reusable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{base_entry, composite_entry};
    use serde_json::json;

    fn amount_gt_1000() -> Condition {
        Condition::new("amount", ">", json!(1000))
    }

    fn tier_1() -> Condition {
        Condition::new("city_tier", "=", json!(1))
    }

    fn upi() -> Condition {
        Condition::new("transaction_type", "=", json!("UPI"))
    }

    fn rule(id: u64, conditions: Vec<Condition>) -> Rule {
        base_entry(id, &format!("r{id}"), conditions).rule
    }

    #[test]
    fn test_no_candidates_means_base_rule() {
        let resolver = DependencyResolver::new();
        assert!(resolver.resolve(&[amount_gt_1000()], &[], None).is_none());
        assert!(resolver.resolve(&[], &[rule(1, vec![amount_gt_1000()])], None).is_none());
    }

    #[test]
    fn test_superset_of_existing_rule_becomes_composite() {
        let resolver = DependencyResolver::new();
        let r1 = rule(1, vec![amount_gt_1000()]);
        let resolution = resolver
            .resolve(&[tier_1(), amount_gt_1000()], &[r1], None)
            .unwrap();
        assert_eq!(resolution.dependencies, vec![RuleId(1)]);
        assert_eq!(resolution.operation, SetOperation::Intersection);
        assert_eq!(resolution.residual, vec![tier_1()]);
    }

    #[test]
    fn test_equal_sets_do_not_depend_on_each_other() {
        let resolver = DependencyResolver::new();
        let r1 = rule(1, vec![amount_gt_1000(), tier_1()]);
        assert!(resolver.resolve(&[tier_1(), amount_gt_1000()], &[r1], None).is_none());
    }

    #[test]
    fn test_greedy_prefers_larger_sets_and_lower_ids() {
        let resolver = DependencyResolver::new();
        let candidates = vec![
            rule(4, vec![upi()]),
            rule(3, vec![amount_gt_1000()]),
            rule(2, vec![amount_gt_1000(), tier_1()]),
            rule(5, vec![amount_gt_1000(), tier_1()]),
        ];
        let resolution = resolver
            .resolve(&[amount_gt_1000(), tier_1(), upi()], &candidates, None)
            .unwrap();
        assert_eq!(resolution.dependencies, vec![RuleId(2), RuleId(4)]);
        assert!(resolution.residual.is_empty());
    }

    #[test]
    fn test_partial_cover_keeps_residual_once() {
        let resolver = DependencyResolver::new();
        let candidates = vec![rule(1, vec![upi()])];
        let resolution = resolver
            .resolve(&[upi(), tier_1(), tier_1(), amount_gt_1000()], &candidates, None)
            .unwrap();
        assert_eq!(resolution.residual, vec![tier_1(), amount_gt_1000()]);
    }

    #[test]
    fn test_excluded_inactive_and_non_intersection_rules_are_skipped() {
        let resolver = DependencyResolver::new();
        let mut inactive = rule(1, vec![amount_gt_1000()]);
        inactive.active = false;
        let mut union = composite_entry(2, "u", vec![7, 8], SetOperation::Union).rule;
        union.declared_conditions = vec![amount_gt_1000()];
        let own = rule(3, vec![amount_gt_1000()]);

        let target = [amount_gt_1000(), tier_1()];
        assert!(resolver
            .resolve(&target, &[inactive, union, own.clone()], Some(RuleId(3)))
            .is_none());

        let excluded: HashSet<RuleId> = [RuleId(3)].into_iter().collect();
        assert!(resolver.resolve_excluding(&target, &[own.clone()], &excluded).is_none());
        assert!(resolver.resolve(&target, &[own], None).is_some());
    }

    #[test]
    fn test_intersection_over_union_is_not_reused() {
        let resolver = DependencyResolver::new();
        let a = rule(1, vec![amount_gt_1000()]);
        let b = rule(2, vec![upi()]);
        let union = composite_entry(3, "u", vec![1, 2], SetOperation::Union).rule;
        let mut over_union = composite_entry(4, "i", vec![3], SetOperation::Intersection).rule;
        over_union.conditions = vec![tier_1()];
        over_union.declared_conditions = vec![tier_1()];
        let mut nested = composite_entry(5, "n", vec![4], SetOperation::Intersection).rule;
        nested.declared_conditions = vec![tier_1()];

        let candidates = vec![a, b, union, over_union, nested];
        let resolution = resolver.resolve(&[tier_1(), upi()], &candidates, None).unwrap();
        assert_eq!(resolution.dependencies, vec![RuleId(2)]);
        assert_eq!(resolution.residual, vec![tier_1()]);

        let c = rule(6, vec![tier_1()]);
        let mut over_base = composite_entry(7, "j", vec![1, 6], SetOperation::Intersection).rule;
        over_base.declared_conditions = vec![amount_gt_1000(), tier_1()];
        let candidates = vec![rule(1, vec![amount_gt_1000()]), c, over_base];
        let resolution = resolver
            .resolve(&[amount_gt_1000(), tier_1(), upi()], &candidates, None)
            .unwrap();
        assert_eq!(resolution.dependencies, vec![RuleId(7)]);
        assert_eq!(resolution.residual, vec![upi()]);
    }

    #[test]
    fn test_spelling_differences_still_match() {
        let resolver = DependencyResolver::new();
        let r1 = rule(1, vec![Condition::new("Amount", "> ", json!(1000.0))]);
        let resolution = resolver
            .resolve(&[amount_gt_1000(), tier_1()], &[r1], None)
            .unwrap();
        assert_eq!(resolution.dependencies, vec![RuleId(1)]);
    }
}
