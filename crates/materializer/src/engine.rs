//! Batch engine boundary: the operations the executor needs from the
//! distributed computation engine that actually reads and writes data.

use audience_segmentation::CompiledQuery;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Columns of every segment output table, in order.
pub const OUTPUT_COLUMNS: [&str; 4] = [
    "user_id",
    "total_transactions",
    "total_spent",
    "transaction_types",
];

/// One row of a segment output table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRow {
    pub user_id: Option<String>,
    pub total_transactions: u64,
    pub total_spent: f64,
    /// Comma-separated distinct source tags.
    pub transaction_types: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("write to {table} failed: {reason}")]
    Write { table: String, reason: String },

    #[error("batch process exited with code {code:?}")]
    Process {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

/// Blocking interface to the batch engine. Calls may take minutes; the
/// scheduler drives them from blocking worker threads.
pub trait BatchEngine: Send + Sync + 'static {
    type Dataset: Send;

    fn read_query(&self, query: &CompiledQuery) -> Result<Self::Dataset, EngineError>;

    fn read_table(&self, name: &str) -> Result<Self::Dataset, EngineError>;

    fn drop_null_users(&self, dataset: Self::Dataset) -> Self::Dataset;

    /// Row union across all operands, de-duplicated by user.
    fn union(&self, operands: Vec<Self::Dataset>) -> Self::Dataset;

    fn intersect(&self, left: Self::Dataset, right: Self::Dataset) -> Self::Dataset;

    fn except(&self, left: Self::Dataset, right: Self::Dataset) -> Self::Dataset;

    /// A zero-row dataset with the output schema.
    fn empty(&self) -> Self::Dataset;

    fn row_count(&self, dataset: &Self::Dataset) -> u64;

    /// Replace `name` with `dataset` (drop, then create). Returns rows written.
    fn write_table(&self, dataset: Self::Dataset, name: &str) -> Result<u64, EngineError>;

    /// Drop `name` if it exists.
    fn drop_table(&self, name: &str) -> Result<(), EngineError>;
}

/// Table maintenance needed outside of a materialization run.
pub trait OutputTables: Send + Sync {
    fn drop_output(&self, table: &str) -> Result<(), EngineError>;
}

impl<E: BatchEngine> OutputTables for E {
    fn drop_output(&self, table: &str) -> Result<(), EngineError> {
        self.drop_table(table)
    }
}
