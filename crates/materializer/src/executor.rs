//! Materialization executor: computes one segment and writes its output table.
//!
//! Base segments run their compiled query against the raw transaction view.
//! Composite segments load the output tables of their dependencies and combine
//! them with the declared set operation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use audience_core::config::SchedulerConfig;
use audience_core::event_bus::{make_event, EventKind, EventSink};
use audience_core::{AudienceError, AudienceResult, RuleId, SetOperation};
use audience_segmentation::{CatalogEntry, CatalogStore, Refresh, SegmentSource};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::engine::{BatchEngine, EngineError};
use crate::locks::RuleLocks;

/// Combine datasets with a set operation. One operand is returned unchanged.
pub fn combine<E: BatchEngine>(
    engine: &E,
    operands: Vec<E::Dataset>,
    operation: SetOperation,
) -> Result<E::Dataset, EngineError> {
    let mut operands = operands.into_iter();
    let Some(first) = operands.next() else {
        return Err(EngineError::Query("cannot combine zero datasets".to_string()));
    };
    let rest: Vec<E::Dataset> = operands.collect();
    if rest.is_empty() {
        return Ok(first);
    }
    Ok(match operation {
        SetOperation::Union => engine.union(std::iter::once(first).chain(rest).collect()),
        SetOperation::Intersection => rest
            .into_iter()
            .fold(first, |acc, next| engine.intersect(acc, next)),
        SetOperation::Difference => rest
            .into_iter()
            .fold(first, |acc, next| engine.except(acc, next)),
    })
}

/// Per-run bookkeeping for on-demand dependency refreshes.
#[derive(Default)]
struct RunContext {
    in_progress: HashSet<RuleId>,
    refreshed: HashSet<RuleId>,
}

pub struct Executor<E: BatchEngine> {
    engine: Arc<E>,
    catalog: Arc<dyn CatalogStore>,
    events: Arc<dyn EventSink>,
    locks: RuleLocks,
    metadata_update_attempts: u32,
    refresh_stale_dependencies: bool,
}

impl<E: BatchEngine> Executor<E> {
    pub fn new(
        engine: Arc<E>,
        catalog: Arc<dyn CatalogStore>,
        events: Arc<dyn EventSink>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            engine,
            catalog,
            events,
            locks: RuleLocks::new(),
            metadata_update_attempts: config.metadata_update_attempts.max(1),
            refresh_stale_dependencies: config.refresh_stale_dependencies,
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Locks a caller must hold for the rule it executes. Dependencies
    /// refreshed during a run are locked by the executor itself.
    pub fn rule_locks(&self) -> &RuleLocks {
        &self.locks
    }

    /// Materialize `rule_id` and return the number of rows written.
    pub fn execute(&self, rule_id: RuleId) -> AudienceResult<u64> {
        self.run(rule_id, &mut RunContext::default())
    }

    fn run(&self, rule_id: RuleId, ctx: &mut RunContext) -> AudienceResult<u64> {
        if !ctx.in_progress.insert(rule_id) {
            return Err(AudienceError::Execution {
                rule_id,
                reason: "dependency cycle detected".to_string(),
            });
        }
        self.events.emit(make_event(EventKind::RunStarted, rule_id));
        metrics::counter!("materializer.runs_started").increment(1);
        info!(rule_id = %rule_id, "Materialization started");

        let result = self.materialize(rule_id, ctx);
        ctx.in_progress.remove(&rule_id);

        match &result {
            Ok(rows) => {
                ctx.refreshed.insert(rule_id);
                self.events
                    .emit(make_event(EventKind::RunSucceeded, rule_id).with_rows(*rows));
                metrics::counter!("materializer.runs_succeeded").increment(1);
                info!(rule_id = %rule_id, rows = *rows, "Materialization succeeded");
            }
            Err(e @ AudienceError::MetadataUpdate { rows, .. }) => {
                self.events.emit(
                    make_event(EventKind::MetadataUpdateFailed, rule_id)
                        .with_rows(*rows)
                        .with_error(e),
                );
                metrics::counter!("materializer.metadata_update_failures").increment(1);
                error!(rule_id = %rule_id, error = %e, "Output written but catalog not updated");
            }
            Err(e) => {
                self.events
                    .emit(make_event(EventKind::RunFailed, rule_id).with_error(e));
                metrics::counter!("materializer.runs_failed").increment(1);
                error!(rule_id = %rule_id, error = %e, "Materialization failed");
            }
        }
        result
    }

    fn materialize(&self, rule_id: RuleId, ctx: &mut RunContext) -> AudienceResult<u64> {
        let entry = self
            .catalog
            .get(rule_id)
            .ok_or(AudienceError::RuleNotFound(rule_id))?;
        let started = Utc::now();

        let (dataset, data_as_of) = match &entry.segment.source {
            SegmentSource::Base { query } => {
                let dataset = match self.engine.read_query(query) {
                    Ok(ds) => self.engine.drop_null_users(ds),
                    Err(EngineError::Query(reason)) => {
                        warn!(
                            rule_id = %rule_id,
                            reason = %reason,
                            "No data found, writing an empty segment output"
                        );
                        self.engine.empty()
                    }
                    Err(e) => return Err(execution_error(rule_id, e)),
                };
                (dataset, started)
            }
            SegmentSource::Composite {
                depends_on,
                operation,
                residual,
            } => {
                if self.refresh_stale_dependencies {
                    self.refresh_dependencies(rule_id, depends_on, ctx)?;
                }
                let (operands, data_as_of) = self.load_dependencies(rule_id, depends_on)?;
                let mut combined = combine(self.engine.as_ref(), operands, *operation)
                    .map_err(|e| execution_error(rule_id, e))?;
                if let Some(residual) = residual.as_ref().filter(|q| !q.is_unfiltered()) {
                    let narrowed = self
                        .engine
                        .read_query(residual)
                        .map_err(|e| execution_error(rule_id, e))?;
                    combined = self
                        .engine
                        .intersect(combined, self.engine.drop_null_users(narrowed));
                }
                (combined, data_as_of)
            }
        };

        let rows = self
            .engine
            .write_table(dataset, &entry.segment.table_name)
            .map_err(|e| execution_error(rule_id, e))?;

        self.update_metadata(
            rule_id,
            Refresh {
                row_count: rows,
                refreshed_at: Utc::now(),
                data_as_of,
            },
        )?;
        Ok(rows)
    }

    /// Materialize dependencies that were never materialized or are due,
    /// at most once per run. Each refresh holds the dependency's lock, so it
    /// waits for any run of that rule already in flight. Must be called off
    /// the async runtime.
    fn refresh_dependencies(
        &self,
        rule_id: RuleId,
        depends_on: &[RuleId],
        ctx: &mut RunContext,
    ) -> AudienceResult<()> {
        let now = Utc::now();
        for dep in depends_on {
            if ctx.refreshed.contains(dep) {
                continue;
            }
            let Some(entry) = self.catalog.get(*dep) else {
                continue;
            };
            if !needs_refresh(&entry, now) {
                continue;
            }
            // A dependency already on this run's stack is a cycle; `run` reports it.
            let lock = (!ctx.in_progress.contains(dep)).then(|| self.locks.get(*dep));
            let _guard = lock.as_ref().map(|lock| lock.blocking_lock());
            let Some(current) = self.catalog.get(*dep) else {
                continue;
            };
            if current.segment.last_refreshed_at != entry.segment.last_refreshed_at {
                debug!(rule_id = %rule_id, dependency = %dep, "Dependency refreshed by another run");
                continue;
            }
            debug!(rule_id = %rule_id, dependency = %dep, "Refreshing dependency first");
            self.run(*dep, ctx)
                .map_err(|e| AudienceError::DependencyLoad {
                    rule_id,
                    dependency: *dep,
                    reason: format!("refresh failed: {e}"),
                })?;
        }
        Ok(())
    }

    /// Load every dependency output table, failing fast. Returns the datasets
    /// and the oldest freshness among them.
    fn load_dependencies(
        &self,
        rule_id: RuleId,
        depends_on: &[RuleId],
    ) -> AudienceResult<(Vec<E::Dataset>, DateTime<Utc>)> {
        let mut operands = Vec::with_capacity(depends_on.len());
        let mut oldest: Option<DateTime<Utc>> = None;
        for dep in depends_on {
            let load_error = |reason: String| AudienceError::DependencyLoad {
                rule_id,
                dependency: *dep,
                reason,
            };
            let entry = self
                .catalog
                .get(*dep)
                .ok_or_else(|| load_error("not in catalog".to_string()))?;
            let as_of = entry
                .segment
                .data_as_of
                .or(entry.segment.last_refreshed_at)
                .ok_or_else(|| load_error("never materialized".to_string()))?;
            let dataset = self
                .engine
                .read_table(&entry.segment.table_name)
                .map_err(|e| load_error(e.to_string()))?;
            operands.push(dataset);
            oldest = Some(oldest.map_or(as_of, |o| o.min(as_of)));
        }
        let oldest = oldest.ok_or_else(|| AudienceError::Execution {
            rule_id,
            reason: "composite segment has no dependencies".to_string(),
        })?;
        Ok((operands, oldest))
    }

    fn update_metadata(&self, rule_id: RuleId, refresh: Refresh) -> AudienceResult<()> {
        let mut last_error = None;
        for attempt in 1..=self.metadata_update_attempts {
            match self.catalog.record_refresh(rule_id, refresh) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(rule_id = %rule_id, attempt, error = %e, "Segment metadata update failed");
                    last_error = Some(e);
                    if attempt < self.metadata_update_attempts {
                        std::thread::sleep(Duration::from_millis(50 * u64::from(attempt)));
                    }
                }
            }
        }
        Err(AudienceError::MetadataUpdate {
            rule_id,
            rows: refresh.row_count,
            reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}

fn needs_refresh(entry: &CatalogEntry, now: DateTime<Utc>) -> bool {
    !entry.segment.is_materialized()
        || (entry.rule.active && entry.rule.next_run_at.is_some_and(|t| t <= now))
}

fn execution_error(rule_id: RuleId, error: EngineError) -> AudienceError {
    if let EngineError::Process {
        code,
        stdout,
        stderr,
    } = &error
    {
        error!(
            rule_id = %rule_id,
            code = ?code,
            stdout = %stdout,
            stderr = %stderr,
            "Batch process failed"
        );
    }
    AudienceError::Execution {
        rule_id,
        reason: error.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::tests::{row, txn};
    use crate::memory::MemoryEngine;
    use audience_core::event_bus::{capture_sink, CaptureSink};
    use audience_core::Schedule;
    use audience_segmentation::{Condition, ConditionCompiler, MemoryCatalog, Rule, Segment};
    use serde_json::json;

    struct Fixture {
        engine: Arc<MemoryEngine>,
        catalog: Arc<MemoryCatalog>,
        events: Arc<CaptureSink>,
        executor: Executor<MemoryEngine>,
    }

    fn fixture_with(catalog: Arc<MemoryCatalog>, config: SchedulerConfig) -> Fixture {
        let engine = Arc::new(MemoryEngine::with_transactions(vec![
            txn("u1", 1500.0, 1, "UPI", "2024-01-05"),
            txn("u2", 2500.0, 2, "UPI", "2024-01-06"),
            txn("u3", 100.0, 1, "CREDIT_CARD", "2024-01-07"),
        ]));
        let events = capture_sink();
        let executor = Executor::new(engine.clone(), catalog.clone(), events.clone(), &config);
        Fixture {
            engine,
            catalog,
            events,
            executor,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryCatalog::new()), SchedulerConfig::default())
    }

    pub(crate) fn entry(id: u64, source: SegmentSource) -> CatalogEntry {
        let now = Utc::now();
        let (dependencies, operation) = match &source {
            SegmentSource::Base { .. } => (None, None),
            SegmentSource::Composite {
                depends_on,
                operation,
                ..
            } => (Some(depends_on.clone()), Some(*operation)),
        };
        CatalogEntry {
            rule: Rule {
                id: RuleId(id),
                name: format!("rule {id}"),
                description: None,
                conditions: Vec::new(),
                declared_conditions: Vec::new(),
                dependencies,
                operation,
                active: true,
                schedule: Schedule::Daily,
                next_run_at: Some(now + chrono::Duration::days(1)),
                last_run_at: None,
                created_at: now,
                updated_at: now,
            },
            segment: Segment {
                rule_id: RuleId(id),
                segment_name: format!("segment_{id}"),
                table_name: format!("segment_output_{id}"),
                source,
                row_count: 0,
                last_refreshed_at: None,
                data_as_of: None,
                created_at: now,
            },
            version: 0,
        }
    }

    pub(crate) fn base(id: u64, conditions: &[Condition]) -> CatalogEntry {
        let query = ConditionCompiler::default().compile(conditions).query;
        entry(id, SegmentSource::Base { query })
    }

    pub(crate) fn composite(id: u64, deps: &[u64], operation: SetOperation) -> CatalogEntry {
        entry(
            id,
            SegmentSource::Composite {
                depends_on: deps.iter().copied().map(RuleId).collect(),
                operation,
                residual: None,
            },
        )
    }

    #[test]
    fn test_combine_set_semantics() {
        let engine = MemoryEngine::new();
        let ids = |rows: Vec<crate::SegmentRow>| -> Vec<String> {
            rows.into_iter().filter_map(|r| r.user_id).collect()
        };

        let union = combine(
            &engine,
            vec![vec![row("1"), row("2")], vec![row("2"), row("3")]],
            SetOperation::Union,
        )
        .unwrap();
        assert_eq!(ids(union), vec!["1", "2", "3"]);

        let both = combine(
            &engine,
            vec![vec![row("1"), row("2"), row("3")], vec![row("2"), row("3"), row("4")]],
            SetOperation::Intersection,
        )
        .unwrap();
        assert_eq!(ids(both), vec!["2", "3"]);

        let rest = combine(
            &engine,
            vec![vec![row("1"), row("2"), row("3")], vec![row("2")]],
            SetOperation::Difference,
        )
        .unwrap();
        assert_eq!(ids(rest), vec!["1", "3"]);

        let single = combine(&engine, vec![vec![row("9"), row("9")]], SetOperation::Union).unwrap();
        assert_eq!(single.len(), 2);

        assert!(combine(&engine, Vec::new(), SetOperation::Union).is_err());
    }

    #[test]
    fn test_base_segment_is_written_and_recorded() {
        let f = fixture();
        f.catalog
            .insert(base(1, &[Condition::new("amount", ">", json!(1000))]))
            .unwrap();

        let rows = f.executor.execute(RuleId(1)).unwrap();
        assert_eq!(rows, 2);
        assert_eq!(f.engine.user_ids("segment_output_1"), vec!["u1", "u2"]);

        let segment = f.catalog.get(RuleId(1)).unwrap().segment;
        assert_eq!(segment.row_count, 2);
        assert!(segment.last_refreshed_at.is_some());
        assert_eq!(f.events.count_for(RuleId(1), EventKind::RunSucceeded), 1);
    }

    #[test]
    fn test_failed_base_query_still_writes_empty_table() {
        let f = fixture();
        f.catalog.insert(base(1, &[])).unwrap();
        f.engine.put_table("segment_output_1", vec![row("stale")]);
        f.engine.fail_queries(true);

        assert_eq!(f.executor.execute(RuleId(1)).unwrap(), 0);
        assert_eq!(f.engine.table("segment_output_1"), Some(Vec::new()));
        assert!(f.catalog.get(RuleId(1)).unwrap().segment.is_materialized());
    }

    #[test]
    fn test_engine_process_failure_is_an_execution_error() {
        let f = fixture();
        f.catalog.insert(base(1, &[])).unwrap();
        f.engine.crash_queries(true);

        let err = f.executor.execute(RuleId(1)).unwrap_err();
        assert!(matches!(err, AudienceError::Execution { .. }));
        assert!(!f.catalog.get(RuleId(1)).unwrap().segment.is_materialized());
        assert_eq!(f.events.count_kind(EventKind::RunFailed), 1);
    }

    #[test]
    fn test_composite_refreshes_missing_dependencies() {
        let f = fixture();
        f.catalog
            .insert(base(1, &[Condition::new("amount", ">", json!(1000))]))
            .unwrap();
        f.catalog
            .insert(base(2, &[Condition::new("city_tier", "=", json!(1))]))
            .unwrap();
        f.catalog
            .insert(composite(3, &[1, 2], SetOperation::Intersection))
            .unwrap();

        assert_eq!(f.executor.execute(RuleId(3)).unwrap(), 1);
        assert_eq!(f.engine.user_ids("segment_output_3"), vec!["u1"]);

        let dep = f.catalog.get(RuleId(1)).unwrap().segment;
        let dep2 = f.catalog.get(RuleId(2)).unwrap().segment;
        let own = f.catalog.get(RuleId(3)).unwrap().segment;
        let oldest = dep.data_as_of.unwrap().min(dep2.data_as_of.unwrap());
        assert_eq!(own.data_as_of, Some(oldest));
        assert!(own.data_as_of <= own.last_refreshed_at);
        assert_eq!(f.events.count_kind(EventKind::RunSucceeded), 3);
    }

    #[test]
    fn test_composite_without_refresh_fails_on_missing_dependency() {
        let config = SchedulerConfig {
            refresh_stale_dependencies: false,
            ..SchedulerConfig::default()
        };
        let f = fixture_with(Arc::new(MemoryCatalog::new()), config);
        f.catalog.insert(base(1, &[])).unwrap();
        f.catalog
            .insert(composite(2, &[1], SetOperation::Union))
            .unwrap();
        f.engine.put_table("segment_output_2", vec![row("old")]);

        let err = f.executor.execute(RuleId(2)).unwrap_err();
        assert!(matches!(
            err,
            AudienceError::DependencyLoad { dependency: RuleId(1), .. }
        ));
        // Aborted before writing: the previous output is untouched.
        assert_eq!(f.engine.user_ids("segment_output_2"), vec!["old"]);
    }

    #[test]
    fn test_composite_applies_residual() {
        let f = fixture();
        f.catalog
            .insert(base(1, &[Condition::new("amount", ">", json!(1000))]))
            .unwrap();
        let residual = ConditionCompiler::default()
            .compile(&[Condition::new("city_tier", "=", json!(1))])
            .query;
        f.catalog
            .insert(entry(
                2,
                SegmentSource::Composite {
                    depends_on: vec![RuleId(1)],
                    operation: SetOperation::Intersection,
                    residual: Some(residual),
                },
            ))
            .unwrap();

        f.executor.execute(RuleId(1)).unwrap();
        assert_eq!(f.executor.execute(RuleId(2)).unwrap(), 1);
        assert_eq!(f.engine.user_ids("segment_output_2"), vec!["u1"]);
    }

    #[test]
    fn test_dependency_cycle_is_reported() {
        let f = fixture();
        // Row validation does not look across rows, so a cycle can be stored.
        f.catalog
            .insert(composite(1, &[2], SetOperation::Union))
            .unwrap();
        f.catalog
            .insert(composite(2, &[1], SetOperation::Union))
            .unwrap();
        let err = f.executor.execute(RuleId(1)).unwrap_err();
        assert!(matches!(err, AudienceError::DependencyLoad { .. }));
    }

    struct FlakyCatalog {
        inner: MemoryCatalog,
        failures_left: parking_lot::Mutex<u32>,
    }

    impl CatalogStore for FlakyCatalog {
        fn allocate_id(&self) -> RuleId {
            self.inner.allocate_id()
        }
        fn get(&self, id: RuleId) -> Option<CatalogEntry> {
            self.inner.get(id)
        }
        fn list(&self) -> Vec<CatalogEntry> {
            self.inner.list()
        }
        fn insert(&self, entry: CatalogEntry) -> AudienceResult<CatalogEntry> {
            self.inner.insert(entry)
        }
        fn replace(&self, entry: CatalogEntry, expected: u64) -> AudienceResult<CatalogEntry> {
            self.inner.replace(entry, expected)
        }
        fn remove(&self, id: RuleId) -> AudienceResult<CatalogEntry> {
            self.inner.remove(id)
        }
        fn record_refresh(&self, id: RuleId, refresh: Refresh) -> AudienceResult<()> {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(AudienceError::Catalog("connection reset".into()));
            }
            self.inner.record_refresh(id, refresh)
        }
        fn record_run(
            &self,
            id: RuleId,
            last: DateTime<Utc>,
            next: DateTime<Utc>,
        ) -> AudienceResult<()> {
            self.inner.record_run(id, last, next)
        }
    }

    #[allow(clippy::type_complexity)]
    fn flaky(
        failures: u32,
    ) -> (
        Arc<FlakyCatalog>,
        Arc<MemoryEngine>,
        Executor<MemoryEngine>,
        Arc<CaptureSink>,
    ) {
        let catalog = Arc::new(FlakyCatalog {
            inner: MemoryCatalog::new(),
            failures_left: parking_lot::Mutex::new(failures),
        });
        catalog.insert(base(1, &[])).unwrap();
        let engine = Arc::new(MemoryEngine::with_transactions(vec![txn(
            "u1", 10.0, 1, "UPI", "2024-01-01",
        )]));
        let events = capture_sink();
        let executor = Executor::new(
            engine.clone(),
            catalog.clone(),
            events.clone(),
            &SchedulerConfig::default(),
        );
        (catalog, engine, executor, events)
    }

    #[test]
    fn test_metadata_update_is_retried() {
        let (catalog, _engine, executor, _events) = flaky(2);
        assert_eq!(executor.execute(RuleId(1)).unwrap(), 1);
        assert_eq!(catalog.get(RuleId(1)).unwrap().segment.row_count, 1);
    }

    #[test]
    fn test_metadata_update_failure_is_distinct() {
        let (catalog, engine, executor, events) = flaky(3);
        let err = executor.execute(RuleId(1)).unwrap_err();
        assert!(err.is_partial_failure());
        assert!(matches!(err, AudienceError::MetadataUpdate { rows: 1, .. }));
        // The output table already holds the new data.
        assert_eq!(engine.user_ids("segment_output_1"), vec!["u1"]);
        assert!(!catalog.get(RuleId(1)).unwrap().segment.is_materialized());
        assert_eq!(events.count_kind(EventKind::MetadataUpdateFailed), 1);
        assert_eq!(events.count_kind(EventKind::RunFailed), 0);
    }
}
