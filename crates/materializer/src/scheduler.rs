//! Materialization scheduler: one recurring job per rule plus one-off manual
//! runs, with per-rule exclusion and a global cap on concurrent runs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use audience_core::config::SchedulerConfig;
use audience_core::event_bus::{make_event, EventKind, EventSink};
use audience_core::{AudienceError, AudienceResult, RuleId, Schedule};
use audience_segmentation::lineage::execution_order;
use audience_segmentation::{CatalogEntry, CatalogStore, Rule};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::BatchEngine;
use crate::executor::Executor;
use crate::locks::RuleLocks;

/// Something that can materialize a rule. Runs are blocking.
pub trait JobRunner: Send + Sync + 'static {
    fn run(&self, rule_id: RuleId) -> AudienceResult<u64>;

    /// Locks the runner takes itself for nested runs. The scheduler holds the
    /// same lock around every run it starts.
    fn rule_locks(&self) -> RuleLocks;
}

impl<E: BatchEngine> JobRunner for Executor<E> {
    fn run(&self, rule_id: RuleId) -> AudienceResult<u64> {
        self.execute(rule_id)
    }

    fn rule_locks(&self) -> RuleLocks {
        Executor::rule_locks(self).clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobKey {
    Recurring(RuleId),
    Manual { rule_id: RuleId, seq: u64 },
}

impl JobKey {
    pub fn rule_id(&self) -> RuleId {
        match self {
            JobKey::Recurring(id) => *id,
            JobKey::Manual { rule_id, .. } => *rule_id,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKey::Recurring(id) => write!(f, "rule_{id}"),
            JobKey::Manual { rule_id, seq } => write!(f, "manual_run_{rule_id}_{seq}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Unscheduled,
    Scheduled,
    Running,
}

/// Describes a single valid transition of a rule's recurring job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: JobState,
    pub to: JobState,
    pub trigger: String,
}

/// Guards the lifecycle of a recurring job.
#[derive(Debug, Clone)]
pub struct JobStateMachine {
    pub state: JobState,
    pub transitions: Vec<StateTransition>,
}

impl JobStateMachine {
    pub fn new() -> Self {
        let transition = |from, to, trigger: &str| StateTransition {
            from,
            to,
            trigger: trigger.to_string(),
        };
        let transitions = vec![
            transition(JobState::Unscheduled, JobState::Scheduled, "schedule"),
            transition(JobState::Scheduled, JobState::Scheduled, "reschedule"),
            transition(JobState::Scheduled, JobState::Running, "fire"),
            // Success moves next_run_at forward, failure keeps it.
            transition(JobState::Running, JobState::Scheduled, "run_finished"),
            transition(JobState::Scheduled, JobState::Unscheduled, "remove"),
            transition(JobState::Running, JobState::Unscheduled, "remove"),
        ];
        Self {
            state: JobState::Unscheduled,
            transitions,
        }
    }

    pub fn can_transition(&self, from: JobState, to: JobState) -> bool {
        self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    pub fn transition(&mut self, to: JobState) -> AudienceResult<()> {
        if self.can_transition(self.state, to) {
            self.state = to;
            Ok(())
        } else {
            Err(AudienceError::Scheduler(format!(
                "Invalid job state transition from {:?} to {:?}",
                self.state, to
            )))
        }
    }
}

impl Default for JobStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether recurring jobs run on their own or only through [`MaterializationScheduler::run_pass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    Background,
    Manual,
}

/// Outcome of one [`MaterializationScheduler::run_pass`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PassReport {
    pub succeeded: Vec<(RuleId, u64)>,
    pub failed: Vec<(RuleId, String)>,
    /// Due rules caught in a dependency cycle.
    pub skipped: Vec<RuleId>,
}

struct JobSlot {
    generation: u64,
    machine: JobStateMachine,
    next_run_at: DateTime<Utc>,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    runner: Arc<dyn JobRunner>,
    catalog: Arc<dyn CatalogStore>,
    events: Arc<dyn EventSink>,
    config: SchedulerConfig,
    mode: SchedulerMode,
    jobs: DashMap<RuleId, JobSlot>,
    locks: RuleLocks,
    permits: Arc<Semaphore>,
    manual: DashMap<JobKey, JoinHandle<()>>,
    manual_seq: AtomicU64,
    generation: AtomicU64,
}

pub struct MaterializationScheduler {
    inner: Arc<Inner>,
}

impl MaterializationScheduler {
    pub fn new(
        runner: Arc<dyn JobRunner>,
        catalog: Arc<dyn CatalogStore>,
        events: Arc<dyn EventSink>,
        config: SchedulerConfig,
        mode: SchedulerMode,
    ) -> Self {
        info!(
            max_concurrent_runs = config.max_concurrent_runs,
            mode = ?mode,
            "Materialization scheduler initialized"
        );
        let permits = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));
        let locks = runner.rule_locks();
        Self {
            inner: Arc::new(Inner {
                runner,
                catalog,
                events,
                config,
                mode,
                jobs: DashMap::new(),
                locks,
                permits,
                manual: DashMap::new(),
                manual_seq: AtomicU64::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn mode(&self) -> SchedulerMode {
        self.inner.mode
    }

    /// Register or replace the recurring job of `rule`. Inactive rules lose
    /// their job.
    pub fn schedule(&self, rule: &Rule) -> AudienceResult<()> {
        if !rule.active {
            self.remove(rule.id);
            return Ok(());
        }
        let runtime = match self.inner.mode {
            SchedulerMode::Background => Some(Handle::try_current().map_err(|e| {
                AudienceError::Scheduler(format!("no async runtime to schedule on: {e}"))
            })?),
            SchedulerMode::Manual => None,
        };

        let next_run_at = rule.next_run_at.unwrap_or_else(Utc::now);
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut machine = JobStateMachine::new();
        machine.transition(JobState::Scheduled)?;

        let slot = JobSlot {
            generation,
            machine,
            next_run_at,
            handle: None,
        };
        if let Some(old) = self.inner.jobs.insert(rule.id, slot) {
            if let Some(handle) = old.handle {
                handle.abort();
            }
            debug!(rule_id = %rule.id, "Replaced existing job");
        }

        if let Some(runtime) = runtime {
            let handle = runtime.spawn(recurring_job(
                self.inner.clone(),
                rule.id,
                generation,
                next_run_at,
            ));
            match self.inner.jobs.get_mut(&rule.id) {
                Some(mut slot) if slot.generation == generation => slot.handle = Some(handle),
                _ => handle.abort(),
            }
        }

        info!(
            job = %JobKey::Recurring(rule.id),
            schedule = %rule.schedule,
            next_run_at = %next_run_at,
            "Job scheduled"
        );
        Ok(())
    }

    /// Schedule every rule in the catalog. Returns the number of active jobs.
    pub fn schedule_all(&self) -> AudienceResult<usize> {
        for rule in self.inner.catalog.rules() {
            self.schedule(&rule)?;
        }
        Ok(self.inner.jobs.len())
    }

    /// Remove the recurring job of `rule_id` and cancel pending manual runs.
    /// Removing a rule without a job is a no-op.
    pub fn remove(&self, rule_id: RuleId) -> bool {
        self.inner.manual.retain(|key, handle| {
            if key.rule_id() == rule_id {
                handle.abort();
                false
            } else {
                true
            }
        });
        match self.inner.jobs.remove(&rule_id) {
            Some((_, mut slot)) => {
                if let Some(handle) = slot.handle.take() {
                    handle.abort();
                }
                if let Err(e) = slot.machine.transition(JobState::Unscheduled) {
                    debug!(rule_id = %rule_id, error = %e, "Unexpected job state on removal");
                }
                info!(job = %JobKey::Recurring(rule_id), "Job removed");
                true
            }
            None => {
                debug!(rule_id = %rule_id, "No job to remove");
                false
            }
        }
    }

    /// Enqueue a one-off run that does not touch the recurring schedule.
    pub fn trigger(&self, rule_id: RuleId) -> AudienceResult<JobKey> {
        let rule = self
            .inner
            .catalog
            .get(rule_id)
            .ok_or(AudienceError::RuleNotFound(rule_id))?
            .rule;
        let runtime = Handle::try_current().map_err(|e| {
            AudienceError::Scheduler(format!("no async runtime to run on: {e}"))
        })?;

        let seq = self.inner.manual_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let key = JobKey::Manual { rule_id, seq };
        self.inner
            .events
            .emit(make_event(EventKind::RunTriggered, rule_id));
        self.inner.manual.retain(|_, handle| !handle.is_finished());

        let inner = self.inner.clone();
        let handle = runtime.spawn(async move {
            let result = inner.execute(rule_id, None).await;
            if let Ok(rows) = result {
                let now = Utc::now();
                let next_run_at = inner
                    .catalog
                    .get(rule_id)
                    .and_then(|e| e.rule.next_run_at)
                    .unwrap_or_else(|| rule.schedule.next_run(now));
                inner.record_run(rule_id, now, next_run_at);
                info!(job = %key, rows, "Manual run finished");
            }
        });
        self.inner.manual.insert(key, handle);
        info!(job = %key, "Manual run enqueued");
        Ok(key)
    }

    pub fn state(&self, rule_id: RuleId) -> JobState {
        self.inner
            .jobs
            .get(&rule_id)
            .map(|slot| slot.machine.state)
            .unwrap_or(JobState::Unscheduled)
    }

    pub fn next_run_at(&self, rule_id: RuleId) -> Option<DateTime<Utc>> {
        self.inner.jobs.get(&rule_id).map(|slot| slot.next_run_at)
    }

    /// Keys of all registered recurring jobs and unfinished manual runs.
    pub fn job_keys(&self) -> Vec<JobKey> {
        let mut keys: Vec<JobKey> = self
            .inner
            .jobs
            .iter()
            .map(|slot| JobKey::Recurring(*slot.key()))
            .chain(
                self.inner
                    .manual
                    .iter()
                    .filter(|m| !m.value().is_finished())
                    .map(|m| *m.key()),
            )
            .collect();
        keys.sort();
        keys
    }

    /// Wait until no run of `rule_id` is in flight and keep others out while
    /// the guard lives.
    pub async fn lock_rule(&self, rule_id: RuleId) -> OwnedMutexGuard<()> {
        self.inner.rule_lock(rule_id).lock_owned().await
    }

    /// Run every due, active rule once, dependencies first.
    pub async fn run_pass(&self) -> PassReport {
        let now = Utc::now();
        let due: Vec<CatalogEntry> = self
            .inner
            .catalog
            .list()
            .into_iter()
            .filter(|e| e.rule.active && e.rule.next_run_at.map_or(true, |t| t <= now))
            .collect();
        let order = execution_order(&due);
        let mut report = PassReport {
            skipped: order.cyclic,
            ..PassReport::default()
        };
        info!(due = due.len(), skipped = report.skipped.len(), "Scheduling pass started");

        for rule_id in order.ordered {
            let Some(entry) = due.iter().find(|e| e.id() == rule_id) else {
                continue;
            };
            let generation = self.inner.jobs.get(&rule_id).map(|slot| slot.generation);
            let previous = entry.rule.next_run_at.unwrap_or(now);
            let result = self.inner.execute(rule_id, generation).await;
            self.inner
                .complete(rule_id, generation, entry.rule.schedule, previous, &result);
            match result {
                Ok(rows) => report.succeeded.push((rule_id, rows)),
                Err(e) => report.failed.push((rule_id, e.to_string())),
            }
        }

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Scheduling pass finished"
        );
        report
    }

    pub fn shutdown(&self) {
        for mut slot in self.inner.jobs.iter_mut() {
            if let Some(handle) = slot.handle.take() {
                handle.abort();
            }
        }
        self.inner.jobs.clear();
        for job in self.inner.manual.iter() {
            job.value().abort();
        }
        self.inner.manual.clear();
        info!("Materialization scheduler stopped");
    }
}

impl Inner {
    fn rule_lock(&self, rule_id: RuleId) -> Arc<Mutex<()>> {
        self.locks.get(rule_id)
    }

    fn is_current(&self, rule_id: RuleId, generation: u64) -> bool {
        self.jobs
            .get(&rule_id)
            .is_some_and(|slot| slot.generation == generation)
    }

    fn transition(&self, rule_id: RuleId, generation: u64, to: JobState) -> bool {
        match self.jobs.get_mut(&rule_id) {
            Some(mut slot) if slot.generation == generation => {
                if let Err(e) = slot.machine.transition(to) {
                    warn!(rule_id = %rule_id, error = %e, "Rejected job state change");
                }
                true
            }
            _ => false,
        }
    }

    /// Run `rule_id` on a blocking worker. The per-rule lock and the run
    /// permit stay held until the blocking call returns, even if the calling
    /// task is aborted. The permit is taken first: a run waiting for a permit
    /// must not hold a lock that a running composite needs for a dependency.
    async fn execute(&self, rule_id: RuleId, generation: Option<u64>) -> AudienceResult<u64> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AudienceError::Scheduler(e.to_string()))?;
        let guard = self.rule_lock(rule_id).lock_owned().await;
        if let Some(generation) = generation {
            self.transition(rule_id, generation, JobState::Running);
        }

        let runner = self.runner.clone();
        tokio::task::spawn_blocking(move || {
            let _held = (guard, permit);
            runner.run(rule_id)
        })
        .await
        .unwrap_or_else(|e| {
            Err(AudienceError::Scheduler(format!(
                "run of rule {rule_id} did not complete: {e}"
            )))
        })
    }

    /// Book-keeping after a run. Returns the next time the job should fire.
    fn complete(
        &self,
        rule_id: RuleId,
        generation: Option<u64>,
        schedule: Schedule,
        previous: DateTime<Utc>,
        result: &AudienceResult<u64>,
    ) -> DateTime<Utc> {
        let now = Utc::now();
        let next_run_at = match result {
            Ok(_) => {
                let next = schedule.next_run(now);
                self.record_run(rule_id, now, next);
                next
            }
            Err(e) => {
                let retry_at = now + chrono::Duration::seconds(self.config.retry_delay_secs as i64);
                warn!(
                    rule_id = %rule_id,
                    error = %e,
                    retry_at = %retry_at.max(previous),
                    "Run failed, keeping schedule"
                );
                retry_at.max(previous)
            }
        };
        if let Some(generation) = generation {
            if let Some(mut slot) = self.jobs.get_mut(&rule_id) {
                if slot.generation == generation {
                    if slot.machine.state == JobState::Running {
                        let _ = slot.machine.transition(JobState::Scheduled);
                    }
                    slot.next_run_at = next_run_at;
                }
            }
        }
        next_run_at
    }

    fn record_run(&self, rule_id: RuleId, last_run_at: DateTime<Utc>, next_run_at: DateTime<Utc>) {
        if let Err(e) = self.catalog.record_run(rule_id, last_run_at, next_run_at) {
            warn!(rule_id = %rule_id, error = %e, "Failed to record run times");
        }
    }
}

async fn recurring_job(
    inner: Arc<Inner>,
    rule_id: RuleId,
    generation: u64,
    mut next_run_at: DateTime<Utc>,
) {
    let key = JobKey::Recurring(rule_id);
    loop {
        let wait = (next_run_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;
        if !inner.is_current(rule_id, generation) {
            return;
        }

        let Some(rule) = inner.catalog.get(rule_id).map(|e| e.rule) else {
            debug!(job = %key, "Rule no longer in catalog, stopping job");
            inner.jobs.remove_if(&rule_id, |_, slot| slot.generation == generation);
            return;
        };
        // Another pass may already have run this rule and moved it forward.
        if let Some(stored) = rule.next_run_at {
            if stored > Utc::now() && stored > next_run_at {
                next_run_at = stored;
                continue;
            }
        }

        debug!(job = %key, "Job fired");
        let result = inner.execute(rule_id, Some(generation)).await;
        next_run_at = inner.complete(rule_id, Some(generation), rule.schedule, next_run_at, &result);
        if !inner.is_current(rule_id, generation) {
            return;
        }
    }
}
