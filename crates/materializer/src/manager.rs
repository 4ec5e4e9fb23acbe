//! Segment manager: the catalog API. Creates, updates and deletes rules,
//! keeping the catalog row, the recurring job and the output table in step.

use std::collections::HashSet;
use std::sync::Arc;

use audience_core::config::CatalogConfig;
use audience_core::event_bus::{make_event, EventKind, EventSink};
use audience_core::{AudienceError, AudienceResult, RuleId, Schedule, SetOperation};
use audience_segmentation::catalog::SegmentRecord;
use audience_segmentation::compiler::Compilation;
use audience_segmentation::lineage::{dependents_in, lineage, LineageGraph};
use audience_segmentation::{
    CatalogEntry, CatalogStore, CompileWarning, Composition, Condition, ConditionCompiler,
    ConditionSet, DependencyResolver, Rule, RuleDraft, Segment, SegmentSource,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::engine::OutputTables;
use crate::scheduler::{JobKey, MaterializationScheduler};

const UPDATE_ATTEMPTS: u32 = 3;

/// Partial update of a rule. Absent members are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RulePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub conditions: Option<Vec<Condition>>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub active: Option<bool>,
}

/// A committed rule together with the conditions its compilation dropped.
#[derive(Debug, Clone, Serialize)]
pub struct RuleOutcome {
    pub entry: CatalogEntry,
    pub warnings: Vec<CompileWarning>,
}

/// How a rule's segment will be computed.
struct Plan {
    conditions: Vec<Condition>,
    declared: Vec<Condition>,
    source: SegmentSource,
}

impl Plan {
    fn apply(self, rule: &mut Rule, segment: &mut Segment) {
        let (dependencies, operation) = match &self.source {
            SegmentSource::Base { .. } => (None, None),
            SegmentSource::Composite {
                depends_on,
                operation,
                ..
            } => (Some(depends_on.clone()), Some(*operation)),
        };
        rule.conditions = self.conditions;
        rule.declared_conditions = self.declared;
        rule.dependencies = dependencies;
        rule.operation = operation;
        segment.source = self.source;
    }
}

pub struct SegmentManager {
    catalog: Arc<dyn CatalogStore>,
    compiler: ConditionCompiler,
    resolver: DependencyResolver,
    scheduler: Arc<MaterializationScheduler>,
    tables: Arc<dyn OutputTables>,
    events: Arc<dyn EventSink>,
    naming: CatalogConfig,
}

impl SegmentManager {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        compiler: ConditionCompiler,
        scheduler: Arc<MaterializationScheduler>,
        tables: Arc<dyn OutputTables>,
        events: Arc<dyn EventSink>,
        naming: CatalogConfig,
    ) -> Self {
        Self {
            catalog,
            compiler,
            resolver: DependencyResolver::new(),
            scheduler,
            tables,
            events,
            naming,
        }
    }

    pub fn scheduler(&self) -> &Arc<MaterializationScheduler> {
        &self.scheduler
    }

    /// Create a rule, reusing existing segments where its conditions allow.
    pub fn create_rule(&self, draft: RuleDraft) -> AudienceResult<RuleOutcome> {
        let name = draft.name.trim().to_string();
        if name.is_empty() {
            return Err(AudienceError::InvalidRule("rule name must not be empty".into()));
        }
        if self.catalog.list().iter().any(|e| e.rule.name == name) {
            return Err(AudienceError::DuplicateRuleName(name));
        }

        let compilation = self.compiler.compile(&draft.conditions);
        let id = self.catalog.allocate_id();
        let excluded: HashSet<RuleId> = [id].into_iter().collect();
        let plan = self.plan(
            &draft.conditions,
            draft.composition.as_ref(),
            &excluded,
            &compilation,
        )?;

        let now = Utc::now();
        let mut rule = Rule {
            id,
            name,
            description: draft.description,
            conditions: Vec::new(),
            declared_conditions: Vec::new(),
            dependencies: None,
            operation: None,
            active: draft.active,
            schedule: draft.schedule,
            next_run_at: draft.active.then_some(now),
            last_run_at: None,
            created_at: now,
            updated_at: now,
        };
        let mut segment = Segment {
            rule_id: id,
            segment_name: self.naming.segment_name(id),
            table_name: self.naming.table_name(id),
            source: SegmentSource::Base {
                query: compilation.query.clone(),
            },
            row_count: 0,
            last_refreshed_at: None,
            data_as_of: None,
            created_at: now,
        };
        plan.apply(&mut rule, &mut segment);

        let stored = self.catalog.insert(CatalogEntry {
            rule,
            segment,
            version: 0,
        })?;

        if let Err(e) = self.scheduler.schedule(&stored.rule) {
            warn!(rule_id = %id, error = %e, "Scheduling failed, rolling back rule creation");
            if let Err(rollback) = self.catalog.remove(id) {
                error!(rule_id = %id, error = %rollback, "Rollback of rule creation failed");
            }
            return Err(e);
        }

        self.events.emit(make_event(EventKind::RuleCreated, id));
        info!(
            rule_id = %id,
            name = %stored.rule.name,
            depends_on = ?stored.rule.dependencies,
            dropped_conditions = compilation.warnings.len(),
            "Rule created"
        );
        Ok(RuleOutcome {
            entry: stored,
            warnings: compilation.warnings,
        })
    }

    pub fn update_rule(&self, id: RuleId, patch: RulePatch) -> AudienceResult<RuleOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self
                .catalog
                .get(id)
                .ok_or(AudienceError::RuleNotFound(id))?;
            let (next, warnings) = self.apply_patch(&current, &patch)?;

            let stored = match self.catalog.replace(next, current.version) {
                Ok(stored) => stored,
                Err(AudienceError::VersionConflict { .. }) if attempt < UPDATE_ATTEMPTS => {
                    debug!(rule_id = %id, attempt, "Concurrent change, retrying update");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Err(e) = self.scheduler.schedule(&stored.rule) {
                warn!(rule_id = %id, error = %e, "Scheduling failed, rolling back rule update");
                match self.catalog.replace(current.clone(), stored.version) {
                    Ok(restored) => {
                        if let Err(e) = self.scheduler.schedule(&restored.rule) {
                            debug!(rule_id = %id, error = %e, "Previous job could not be restored");
                        }
                    }
                    Err(rollback) => {
                        error!(rule_id = %id, error = %rollback, "Rollback of rule update failed")
                    }
                }
                return Err(e);
            }

            self.events.emit(make_event(EventKind::RuleUpdated, id));
            info!(rule_id = %id, version = stored.version, "Rule updated");
            return Ok(RuleOutcome {
                entry: stored,
                warnings,
            });
        }
    }

    /// Delete a rule, its job and its output table. Rules that other rules
    /// depend on cannot be deleted.
    pub async fn delete_rule(&self, id: RuleId) -> AudienceResult<CatalogEntry> {
        let entries = self.catalog.list();
        let current = entries
            .iter()
            .find(|e| e.id() == id)
            .cloned()
            .ok_or(AudienceError::RuleNotFound(id))?;
        let dependents = dependents_in(&entries, id);
        if !dependents.is_empty() {
            return Err(AudienceError::HasDependents {
                rule_id: id,
                dependents: dependents.into_iter().collect(),
            });
        }

        self.scheduler.remove(id);
        let _guard = self.scheduler.lock_rule(id).await;

        if let Err(e) = self.tables.drop_output(&current.segment.table_name) {
            self.restore_job(&current.rule);
            return Err(AudienceError::Engine(e.to_string()));
        }
        let removed = match self.catalog.remove(id) {
            Ok(removed) => removed,
            Err(e) => {
                self.restore_job(&current.rule);
                return Err(e);
            }
        };

        self.events.emit(make_event(EventKind::RuleDeleted, id));
        info!(rule_id = %id, table = %removed.segment.table_name, "Rule deleted");
        Ok(removed)
    }

    pub fn trigger_rule(&self, id: RuleId) -> AudienceResult<JobKey> {
        self.scheduler.trigger(id)
    }

    pub fn get_lineage(&self, id: RuleId) -> AudienceResult<LineageGraph> {
        lineage(self.catalog.as_ref(), id)
    }

    pub fn get_rule(&self, id: RuleId) -> Option<Rule> {
        self.catalog.get(id).map(|e| e.rule)
    }

    pub fn list_rules(&self) -> Vec<Rule> {
        self.catalog.rules()
    }

    pub fn get_segment(&self, id: RuleId) -> Option<Segment> {
        self.catalog.get(id).map(|e| e.segment)
    }

    pub fn list_segments(&self) -> Vec<Segment> {
        self.catalog.list().into_iter().map(|e| e.segment).collect()
    }

    /// Segment rows in their persisted shape.
    pub fn segment_records(&self) -> AudienceResult<Vec<SegmentRecord>> {
        self.list_segments()
            .iter()
            .map(SegmentRecord::try_from)
            .collect()
    }

    fn restore_job(&self, rule: &Rule) {
        if let Err(e) = self.scheduler.schedule(rule) {
            error!(rule_id = %rule.id, error = %e, "Could not restore job");
        }
    }

    fn apply_patch(
        &self,
        current: &CatalogEntry,
        patch: &RulePatch,
    ) -> AudienceResult<(CatalogEntry, Vec<CompileWarning>)> {
        let id = current.id();
        let now = Utc::now();
        let mut next = current.clone();

        if let Some(name) = &patch.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(AudienceError::InvalidRule("rule name must not be empty".into()));
            }
            next.rule.name = name.to_string();
        }
        if let Some(description) = &patch.description {
            next.rule.description = Some(description.clone());
        }
        if let Some(schedule) = patch.schedule {
            if schedule != current.rule.schedule {
                next.rule.schedule = schedule;
                next.rule.next_run_at = Some(schedule.next_run(now));
            }
        }
        if let Some(active) = patch.active {
            if active && !current.rule.active {
                next.rule.next_run_at = Some(now);
            }
            next.rule.active = active;
        }

        let mut warnings = Vec::new();
        let changed = patch.conditions.as_ref().filter(|c| {
            ConditionSet::from_conditions(c)
                != ConditionSet::from_conditions(&current.rule.declared_conditions)
        });
        if let Some(conditions) = changed {
            let entries = self.catalog.list();
            let dependents = dependents_in(&entries, id);
            if !dependents.is_empty() {
                return Err(AudienceError::HasDependents {
                    rule_id: id,
                    dependents: dependents.into_iter().collect(),
                });
            }
            let mut excluded: HashSet<RuleId> = dependents.into_iter().collect();
            excluded.insert(id);

            // Explicit unions and differences keep their operands.
            let composition = match (&current.rule.dependencies, current.rule.operation) {
                (Some(deps), Some(op)) if op != SetOperation::Intersection => Some(Composition {
                    dependencies: deps.clone(),
                    operation: op,
                }),
                _ => None,
            };
            let compilation = self.compiler.compile(conditions);
            let plan = self.plan(conditions, composition.as_ref(), &excluded, &compilation)?;
            plan.apply(&mut next.rule, &mut next.segment);
            warnings = compilation.warnings;
            if next.rule.active {
                next.rule.next_run_at = Some(now);
            }
        }

        next.rule.updated_at = now;
        Ok((next, warnings))
    }

    fn plan(
        &self,
        conditions: &[Condition],
        composition: Option<&Composition>,
        excluded: &HashSet<RuleId>,
        compilation: &Compilation,
    ) -> AudienceResult<Plan> {
        let residual_query = |residual: &[Condition]| {
            (!residual.is_empty()).then(|| self.compiler.compile(residual).query)
        };

        if let Some(composition) = composition {
            if composition.dependencies.is_empty() {
                return Err(AudienceError::InvalidRule(
                    "a composition needs at least one dependency".into(),
                ));
            }
            let mut inherited = Vec::new();
            for dep in &composition.dependencies {
                if excluded.contains(dep) {
                    return Err(AudienceError::InvalidRule(format!(
                        "depending on rule {dep} would create a cycle"
                    )));
                }
                let entry = self.catalog.get(*dep).ok_or_else(|| {
                    AudienceError::InvalidRule(format!("unknown dependency {dep}"))
                })?;
                inherited.extend(entry.rule.declared_conditions);
            }
            // Only an intersection narrows to the union of its operands' conditions.
            let declared = match composition.operation {
                SetOperation::Intersection => {
                    inherited.extend(conditions.iter().cloned());
                    inherited
                }
                SetOperation::Union | SetOperation::Difference => conditions.to_vec(),
            };
            return Ok(Plan {
                conditions: conditions.to_vec(),
                declared,
                source: SegmentSource::Composite {
                    depends_on: composition.dependencies.clone(),
                    operation: composition.operation,
                    residual: residual_query(conditions),
                },
            });
        }

        let candidates = self.catalog.rules();
        Ok(
            match self
                .resolver
                .resolve_excluding(conditions, &candidates, excluded)
            {
                Some(resolution) => Plan {
                    source: SegmentSource::Composite {
                        depends_on: resolution.dependencies,
                        operation: resolution.operation,
                        residual: residual_query(&resolution.residual),
                    },
                    conditions: resolution.residual,
                    declared: conditions.to_vec(),
                },
                None => Plan {
                    conditions: conditions.to_vec(),
                    declared: conditions.to_vec(),
                    source: SegmentSource::Base {
                        query: compilation.query.clone(),
                    },
                },
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::memory::tests::txn;
    use crate::memory::MemoryEngine;
    use crate::scheduler::SchedulerMode;
    use audience_core::config::SchedulerConfig;
    use audience_core::event_bus::{capture_sink, CaptureSink};
    use audience_segmentation::{MemoryCatalog, RuleBuilder};
    use serde_json::json;

    struct Fixture {
        engine: Arc<MemoryEngine>,
        catalog: Arc<MemoryCatalog>,
        events: Arc<CaptureSink>,
        manager: SegmentManager,
    }

    fn fixture(mode: SchedulerMode) -> Fixture {
        let engine = Arc::new(MemoryEngine::with_transactions(vec![
            txn("u1", 1500.0, 1, "UPI", "2024-01-05"),
            txn("u2", 2500.0, 2, "UPI", "2024-01-06"),
            txn("u3", 100.0, 1, "CREDIT_CARD", "2024-01-07"),
            txn("u4", 300.0, 2, "UPI", "2024-01-08"),
        ]));
        let catalog = Arc::new(MemoryCatalog::new());
        let events = capture_sink();
        let config = SchedulerConfig::default();
        let executor = Arc::new(Executor::new(
            engine.clone(),
            catalog.clone(),
            events.clone(),
            &config,
        ));
        let scheduler = Arc::new(MaterializationScheduler::new(
            executor,
            catalog.clone(),
            events.clone(),
            config,
            mode,
        ));
        let manager = SegmentManager::new(
            catalog.clone(),
            ConditionCompiler::default(),
            scheduler,
            engine.clone(),
            events.clone(),
            CatalogConfig::default(),
        );
        Fixture {
            engine,
            catalog,
            events,
            manager,
        }
    }

    fn amount() -> Condition {
        Condition::new("amount", ">", json!(1000))
    }

    fn tier(t: u8) -> Condition {
        Condition::new("city_tier", "=", json!(t))
    }

    fn draft(name: &str, conditions: Vec<Condition>) -> RuleDraft {
        RuleBuilder::new(name).conditions(conditions).build()
    }

    #[test]
    fn test_superset_rule_is_created_as_composite() {
        let f = fixture(SchedulerMode::Manual);
        let r1 = f.manager.create_rule(draft("r1", vec![amount()])).unwrap().entry;
        assert!(r1.segment.compiled_query().is_some());
        assert!(r1.rule.dependencies.is_none());
        assert_eq!(r1.segment.table_name, "segment_output_1");
        assert_eq!(r1.segment.segment_name, "segment_1");

        let r2 = f
            .manager
            .create_rule(draft("r2", vec![tier(1), amount()]))
            .unwrap()
            .entry;
        assert_eq!(r2.rule.dependencies, Some(vec![r1.id()]));
        assert_eq!(r2.rule.operation, Some(SetOperation::Intersection));
        assert_eq!(r2.rule.conditions, vec![tier(1)]);
        assert_eq!(r2.rule.declared_conditions.len(), 2);
        assert_eq!(r2.segment.depends_on(), Some(&[r1.id()][..]));
        assert!(r2.segment.compiled_query().is_none());

        let graph = f.manager.get_lineage(r2.id()).unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.parents_of(r2.id()), vec![r1.id()]);
        assert_eq!(f.events.count_kind(EventKind::RuleCreated), 2);
    }

    #[test]
    fn test_create_reports_dropped_conditions() {
        let f = fixture(SchedulerMode::Manual);
        let outcome = f
            .manager
            .create_rule(draft(
                "with junk",
                vec![amount(), Condition::new("merchant", "=", json!("x"))],
            ))
            .unwrap();
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].index, 1);
        assert_eq!(outcome.entry.segment.compiled_query().unwrap().filters.len(), 1);
    }

    #[test]
    fn test_duplicate_names_leave_catalog_unchanged() {
        let f = fixture(SchedulerMode::Manual);
        f.manager.create_rule(draft("same", vec![amount()])).unwrap();
        let err = f.manager.create_rule(draft(" same ", vec![tier(2)])).unwrap_err();
        assert!(matches!(err, AudienceError::DuplicateRuleName(_)));
        assert_eq!(f.manager.list_rules().len(), 1);
        assert!(f.manager.create_rule(draft("  ", vec![])).is_err());
    }

    #[test]
    fn test_scheduling_failure_rolls_back_creation() {
        // Background mode without a runtime cannot schedule.
        let f = fixture(SchedulerMode::Background);
        let err = f.manager.create_rule(draft("r1", vec![amount()])).unwrap_err();
        assert!(matches!(err, AudienceError::Scheduler(_)));
        assert!(f.catalog.is_empty());
        assert_eq!(f.events.count_kind(EventKind::RuleCreated), 0);
    }

    #[test]
    fn test_explicit_composition() {
        let f = fixture(SchedulerMode::Manual);
        let a = f.manager.create_rule(draft("a", vec![amount()])).unwrap().entry;
        let b = f.manager.create_rule(draft("b", vec![tier(1)])).unwrap().entry;
        let either = f
            .manager
            .create_rule(
                RuleBuilder::new("either")
                    .combine(SetOperation::Union, [a.id(), b.id()])
                    .build(),
            )
            .unwrap()
            .entry;
        assert_eq!(either.segment.operation(), Some(SetOperation::Union));
        assert!(either.rule.conditions.is_empty());

        let err = f
            .manager
            .create_rule(
                RuleBuilder::new("dangling")
                    .combine(SetOperation::Difference, [RuleId(99)])
                    .build(),
            )
            .unwrap_err();
        assert!(matches!(err, AudienceError::InvalidRule(_)));
    }

    #[tokio::test]
    async fn test_intersection_over_union_is_not_reused() {
        let f = fixture(SchedulerMode::Manual);
        let upi = Condition::new("transaction_type", "=", json!("UPI"));
        let a = f.manager.create_rule(draft("a", vec![amount()])).unwrap().entry;
        let b = f
            .manager
            .create_rule(draft(
                "b",
                vec![Condition::new("transaction_type", "=", json!("CREDIT_CARD"))],
            ))
            .unwrap()
            .entry;
        let either = f
            .manager
            .create_rule(
                RuleBuilder::new("either")
                    .combine(SetOperation::Union, [a.id(), b.id()])
                    .build(),
            )
            .unwrap()
            .entry;
        let narrowed = f
            .manager
            .create_rule(
                RuleBuilder::new("either in tier 2")
                    .conditions(vec![tier(2)])
                    .combine(SetOperation::Intersection, [either.id()])
                    .build(),
            )
            .unwrap()
            .entry;
        assert_eq!(narrowed.rule.declared_conditions, vec![tier(2)]);

        let r = f
            .manager
            .create_rule(draft("tier 2 upi", vec![tier(2), upi]))
            .unwrap()
            .entry;
        assert!(r.rule.dependencies.is_none());

        f.manager.scheduler().run_pass().await;
        assert_eq!(f.engine.user_ids(&narrowed.segment.table_name), vec!["u2"]);
        assert_eq!(f.engine.user_ids(&r.segment.table_name), vec!["u2", "u4"]);
    }

    #[test]
    fn test_update_never_depends_on_itself() {
        let f = fixture(SchedulerMode::Manual);
        let r1 = f.manager.create_rule(draft("r1", vec![amount()])).unwrap().entry;
        let patch = RulePatch {
            conditions: Some(vec![amount(), tier(1)]),
            ..RulePatch::default()
        };
        let updated = f.manager.update_rule(r1.id(), patch).unwrap().entry;
        assert!(updated.rule.dependencies.is_none());
        assert_eq!(updated.segment.compiled_query().unwrap().filters.len(), 2);
        assert_eq!(updated.version, r1.version + 1);
        assert_eq!(f.events.count_kind(EventKind::RuleUpdated), 1);
    }

    #[test]
    fn test_update_rules_with_dependents() {
        let f = fixture(SchedulerMode::Manual);
        let r1 = f.manager.create_rule(draft("r1", vec![amount()])).unwrap().entry;
        let r2 = f
            .manager
            .create_rule(draft("r2", vec![amount(), tier(1)]))
            .unwrap()
            .entry;

        let err = f
            .manager
            .update_rule(
                r1.id(),
                RulePatch {
                    conditions: Some(vec![tier(2)]),
                    ..RulePatch::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, AudienceError::HasDependents { .. }));

        // Renaming and rescheduling are fine.
        let renamed = f
            .manager
            .update_rule(
                r1.id(),
                RulePatch {
                    name: Some("big spenders".into()),
                    schedule: Some(Schedule::Hourly),
                    ..RulePatch::default()
                },
            )
            .unwrap()
            .entry;
        assert_eq!(renamed.rule.name, "big spenders");
        assert_eq!(renamed.rule.schedule, Schedule::Hourly);

        let moved = f
            .manager
            .update_rule(
                r2.id(),
                RulePatch {
                    conditions: Some(vec![amount(), tier(2)]),
                    ..RulePatch::default()
                },
            )
            .unwrap()
            .entry;
        assert_eq!(moved.rule.dependencies, Some(vec![r1.id()]));
        assert_eq!(moved.rule.conditions, vec![tier(2)]);
    }

    #[tokio::test]
    async fn test_delete_respects_dependents() {
        let f = fixture(SchedulerMode::Manual);
        let r1 = f.manager.create_rule(draft("r1", vec![amount()])).unwrap().entry;
        let r2 = f
            .manager
            .create_rule(draft("r2", vec![amount(), tier(1)]))
            .unwrap()
            .entry;
        f.manager.scheduler().run_pass().await;
        assert!(f.engine.has_table("segment_output_2"));

        let err = f.manager.delete_rule(r1.id()).await.unwrap_err();
        assert!(matches!(err, AudienceError::HasDependents { ref dependents, .. } if dependents == &vec![r2.id()]));

        f.manager.delete_rule(r2.id()).await.unwrap();
        assert!(!f.engine.has_table("segment_output_2"));
        f.manager.delete_rule(r1.id()).await.unwrap();
        assert!(f.manager.list_rules().is_empty());
        assert!(matches!(
            f.manager.delete_rule(r1.id()).await,
            Err(AudienceError::RuleNotFound(_))
        ));
        assert_eq!(f.events.count_kind(EventKind::RuleDeleted), 2);
    }

    #[tokio::test]
    async fn test_trigger_and_records() {
        let f = fixture(SchedulerMode::Manual);
        let r1 = f.manager.create_rule(draft("r1", vec![amount()])).unwrap().entry;
        let key = f.manager.trigger_rule(r1.id()).unwrap();
        assert_eq!(key.rule_id(), r1.id());
        assert!(f.manager.trigger_rule(RuleId(77)).is_err());

        for _ in 0..250 {
            if f.manager.get_segment(r1.id()).is_some_and(|s| s.is_materialized()) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let segment = f.manager.get_segment(r1.id()).unwrap();
        assert_eq!(segment.row_count, 2);

        let records = f.manager.segment_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].row_count, 2);
        assert!(records[0].compiled_query.is_some());
    }
}
