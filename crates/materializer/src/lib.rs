//! Segment materialization: batch engine boundary, executor, scheduler and
//! the segment manager that ties them to the catalog.

pub mod engine;
pub mod executor;
pub mod locks;
pub mod manager;
pub mod memory;
pub mod scheduler;

pub use engine::{BatchEngine, EngineError, OutputTables, SegmentRow};
pub use executor::{combine, Executor};
pub use locks::RuleLocks;
pub use manager::{RuleOutcome, RulePatch, SegmentManager};
pub use memory::{MemoryEngine, Transaction};
pub use scheduler::{JobKey, JobRunner, JobState, MaterializationScheduler, PassReport, SchedulerMode};
