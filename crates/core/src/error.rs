use thiserror::Error;

use crate::types::RuleId;

pub type AudienceResult<T> = Result<T, AudienceError>;

#[derive(Error, Debug)]
pub enum AudienceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rule {0} not found")]
    RuleNotFound(RuleId),

    #[error("Rule name '{0}' is already taken")]
    DuplicateRuleName(String),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Rule {rule_id} is a dependency of {dependents:?}")]
    HasDependents {
        rule_id: RuleId,
        dependents: Vec<RuleId>,
    },

    #[error("Rule {rule_id} was modified concurrently (expected version {expected}, found {found})")]
    VersionConflict {
        rule_id: RuleId,
        expected: u64,
        found: u64,
    },

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Dependency {dependency} of rule {rule_id} could not be loaded: {reason}")]
    DependencyLoad {
        rule_id: RuleId,
        dependency: RuleId,
        reason: String,
    },

    #[error("Materialization of rule {rule_id} failed: {reason}")]
    Execution { rule_id: RuleId, reason: String },

    #[error("Segment for rule {rule_id} was written ({rows} rows) but its metadata update failed: {reason}")]
    MetadataUpdate {
        rule_id: RuleId,
        rows: u64,
        reason: String,
    },

    #[error("Batch engine error: {0}")]
    Engine(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AudienceError {
    /// True when the output table may already hold fresh data even though the
    /// run is reported as failed.
    pub fn is_partial_failure(&self) -> bool {
        matches!(self, AudienceError::MetadataUpdate { .. })
    }
}
