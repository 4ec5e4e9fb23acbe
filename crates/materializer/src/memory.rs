//! In-memory batch engine. Evaluates the typed plan of a compiled query over
//! transaction records held in memory and keeps output tables in a DashMap.
//!
//! Production: an adapter around the real distributed engine implements the
//! same `BatchEngine` trait.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use audience_segmentation::compiler::{Literal, Operand, Predicate};
use audience_segmentation::{CompiledQuery, Field, Operator};
use chrono::NaiveDate;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::{BatchEngine, EngineError, SegmentRow};

/// One raw transaction as found in any of the source tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub user_id: Option<String>,
    pub amount: f64,
    pub transaction_date: NaiveDate,
    pub city_tier: i64,
    /// Source tag of the table the record came from, e.g. `UPI`.
    pub transaction_type: String,
    #[serde(default)]
    pub category: Option<String>,
}

impl Transaction {
    fn value_of(&self, field: Field) -> Option<Literal> {
        match field {
            Field::Amount => Some(Literal::Number(self.amount)),
            Field::CityTier => Some(Literal::Number(self.city_tier as f64)),
            Field::TransactionDate => Some(Literal::Date(self.transaction_date)),
            Field::TransactionType => Some(Literal::Text(self.transaction_type.clone())),
            Field::TotalSpend | Field::TransactionCount => None,
        }
    }
}

#[derive(Default)]
struct Group {
    count: u64,
    spent: f64,
    types: BTreeSet<String>,
}

impl Group {
    fn value_of(&self, field: Field) -> Option<Literal> {
        match field {
            Field::TotalSpend => Some(Literal::Number(self.spent)),
            Field::TransactionCount => Some(Literal::Number(self.count as f64)),
            _ => None,
        }
    }
}

pub struct MemoryEngine {
    transactions: RwLock<Vec<Transaction>>,
    tables: DashMap<String, Vec<SegmentRow>>,
    fail_queries: AtomicBool,
    crash_queries: AtomicBool,
    failing_writes: DashSet<String>,
    query_delay_ms: AtomicU64,
    active_queries: AtomicUsize,
    peak_queries: AtomicUsize,
    writes: AtomicU64,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_transactions(Vec::new())
    }

    pub fn with_transactions(transactions: Vec<Transaction>) -> Self {
        info!(transactions = transactions.len(), "In-memory batch engine initialized");
        Self {
            transactions: RwLock::new(transactions),
            tables: DashMap::new(),
            fail_queries: AtomicBool::new(false),
            crash_queries: AtomicBool::new(false),
            failing_writes: DashSet::new(),
            query_delay_ms: AtomicU64::new(0),
            active_queries: AtomicUsize::new(0),
            peak_queries: AtomicUsize::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn add_transactions(&self, transactions: impl IntoIterator<Item = Transaction>) {
        self.transactions.write().extend(transactions);
    }

    /// Make `read_query` fail as if the query returned nothing usable.
    pub fn fail_queries(&self, on: bool) {
        self.fail_queries.store(on, Ordering::SeqCst);
    }

    /// Make `read_query` fail as if the engine process died.
    pub fn crash_queries(&self, on: bool) {
        self.crash_queries.store(on, Ordering::SeqCst);
    }

    pub fn fail_writes_to(&self, table: impl Into<String>) {
        self.failing_writes.insert(table.into());
    }

    pub fn set_query_delay(&self, delay: Duration) {
        self.query_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Highest number of queries observed running at the same time.
    pub fn peak_concurrent_queries(&self) -> usize {
        self.peak_queries.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn table(&self, name: &str) -> Option<Vec<SegmentRow>> {
        self.tables.get(name).map(|t| t.value().clone())
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Sorted user ids of an output table, empty when the table is missing.
    pub fn user_ids(&self, name: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .table(name)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|r| r.user_id)
            .collect();
        ids.sort();
        ids
    }

    pub fn put_table(&self, name: impl Into<String>, rows: Vec<SegmentRow>) {
        self.tables.insert(name.into(), rows);
    }

    fn evaluate(&self, query: &CompiledQuery) -> Vec<SegmentRow> {
        let transactions = self.transactions.read();
        let mut groups: BTreeMap<Option<String>, Group> = BTreeMap::new();
        for txn in transactions.iter() {
            let keep = query
                .filters
                .iter()
                .all(|p| txn.value_of(p.field).is_some_and(|v| holds(p, &v)));
            if !keep {
                continue;
            }
            let group = groups.entry(txn.user_id.clone()).or_default();
            group.count += 1;
            group.spent += txn.amount;
            group.types.insert(txn.transaction_type.clone());
        }

        groups
            .into_iter()
            .filter(|(_, g)| {
                query
                    .having
                    .iter()
                    .all(|p| g.value_of(p.field).is_some_and(|v| holds(p, &v)))
            })
            .map(|(user_id, g)| SegmentRow {
                user_id,
                total_transactions: g.count,
                total_spent: g.spent,
                transaction_types: g.types.into_iter().collect::<Vec<_>>().join(","),
            })
            .collect()
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

struct QueryGuard<'a>(&'a AtomicUsize);

impl Drop for QueryGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl BatchEngine for MemoryEngine {
    type Dataset = Vec<SegmentRow>;

    fn read_query(&self, query: &CompiledQuery) -> Result<Self::Dataset, EngineError> {
        let running = self.active_queries.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = QueryGuard(&self.active_queries);
        self.peak_queries.fetch_max(running, Ordering::SeqCst);

        let delay = self.query_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.crash_queries.load(Ordering::SeqCst) {
            return Err(EngineError::Process {
                code: Some(1),
                stdout: String::new(),
                stderr: "executor lost: out of memory".to_string(),
            });
        }
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(EngineError::Query("source returned no result".to_string()));
        }

        let rows = self.evaluate(query);
        debug!(rows = rows.len(), "Query evaluated");
        Ok(rows)
    }

    fn read_table(&self, name: &str) -> Result<Self::Dataset, EngineError> {
        self.table(name)
            .ok_or_else(|| EngineError::TableNotFound(name.to_string()))
    }

    fn drop_null_users(&self, dataset: Self::Dataset) -> Self::Dataset {
        dataset.into_iter().filter(|r| r.user_id.is_some()).collect()
    }

    fn union(&self, operands: Vec<Self::Dataset>) -> Self::Dataset {
        let mut seen = HashSet::new();
        operands
            .into_iter()
            .flatten()
            .filter(|r| seen.insert(r.user_id.clone()))
            .collect()
    }

    fn intersect(&self, left: Self::Dataset, right: Self::Dataset) -> Self::Dataset {
        let keep: HashSet<Option<String>> = right.into_iter().map(|r| r.user_id).collect();
        let mut seen = HashSet::new();
        left.into_iter()
            .filter(|r| keep.contains(&r.user_id) && seen.insert(r.user_id.clone()))
            .collect()
    }

    fn except(&self, left: Self::Dataset, right: Self::Dataset) -> Self::Dataset {
        let drop: HashSet<Option<String>> = right.into_iter().map(|r| r.user_id).collect();
        let mut seen = HashSet::new();
        left.into_iter()
            .filter(|r| !drop.contains(&r.user_id) && seen.insert(r.user_id.clone()))
            .collect()
    }

    fn empty(&self) -> Self::Dataset {
        Vec::new()
    }

    fn row_count(&self, dataset: &Self::Dataset) -> u64 {
        dataset.len() as u64
    }

    fn write_table(&self, dataset: Self::Dataset, name: &str) -> Result<u64, EngineError> {
        if self.failing_writes.contains(name) {
            return Err(EngineError::Write {
                table: name.to_string(),
                reason: "storage unavailable".to_string(),
            });
        }
        let rows = dataset.len() as u64;
        self.tables.remove(name);
        self.tables.insert(name.to_string(), dataset);
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(table = %name, rows, "Output table replaced");
        Ok(rows)
    }

    fn drop_table(&self, name: &str) -> Result<(), EngineError> {
        self.tables.remove(name);
        Ok(())
    }
}

/// Whether `actual` satisfies `predicate`.
fn holds(predicate: &Predicate, actual: &Literal) -> bool {
    match (&predicate.operand, predicate.operator) {
        (Operand::Scalar(expected), op) => {
            let Some(ord) = compare(actual, expected) else {
                return false;
            };
            match op {
                Operator::Gt => ord == CmpOrdering::Greater,
                Operator::Lt => ord == CmpOrdering::Less,
                Operator::Eq => ord == CmpOrdering::Equal,
                Operator::Ge => ord != CmpOrdering::Less,
                Operator::Le => ord != CmpOrdering::Greater,
                Operator::Ne => ord != CmpOrdering::Equal,
                Operator::In | Operator::NotIn | Operator::Between => false,
            }
        }
        (Operand::List(items), Operator::In) => items
            .iter()
            .any(|item| compare(actual, item) == Some(CmpOrdering::Equal)),
        (Operand::List(items), Operator::NotIn) => items
            .iter()
            .all(|item| compare(actual, item).is_some_and(|o| o != CmpOrdering::Equal)),
        (Operand::Range(low, high), Operator::Between) => {
            compare(actual, low).is_some_and(|o| o != CmpOrdering::Less)
                && compare(actual, high).is_some_and(|o| o != CmpOrdering::Greater)
        }
        _ => false,
    }
}

fn compare(left: &Literal, right: &Literal) -> Option<CmpOrdering> {
    match (left, right) {
        (Literal::Number(a), Literal::Number(b)) => a.partial_cmp(b),
        (Literal::Date(a), Literal::Date(b)) => Some(a.cmp(b)),
        (Literal::Text(a), Literal::Text(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use audience_segmentation::{Condition, ConditionCompiler};
    use serde_json::json;

    pub(crate) fn txn(user: &str, amount: f64, tier: i64, kind: &str, date: &str) -> Transaction {
        Transaction {
            user_id: Some(user.to_string()),
            amount,
            transaction_date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            city_tier: tier,
            transaction_type: kind.to_string(),
            category: None,
        }
    }

    pub(crate) fn row(user: &str) -> SegmentRow {
        SegmentRow {
            user_id: Some(user.to_string()),
            total_transactions: 1,
            total_spent: 1.0,
            transaction_types: "UPI".to_string(),
        }
    }

    fn engine() -> MemoryEngine {
        MemoryEngine::with_transactions(vec![
            txn("u1", 1500.0, 1, "UPI", "2024-01-05"),
            txn("u1", 200.0, 1, "CREDIT_CARD", "2024-02-10"),
            txn("u2", 5000.0, 2, "CREDIT_CARD", "2024-03-01"),
            txn("u3", 50.0, 1, "UPI", "2024-03-15"),
            Transaction {
                user_id: None,
                ..txn("x", 9000.0, 1, "UPI", "2024-01-01")
            },
        ])
    }

    fn query(conditions: &[Condition]) -> CompiledQuery {
        ConditionCompiler::default().compile(conditions).query
    }

    #[test]
    fn test_where_filters_then_groups() {
        let engine = engine();
        let rows = engine
            .read_query(&query(&[Condition::new("amount", ">", json!(1000))]))
            .unwrap();
        assert_eq!(rows.len(), 3);
        let rows = engine.drop_null_users(rows);
        let users: Vec<_> = rows.iter().filter_map(|r| r.user_id.clone()).collect();
        assert_eq!(users, vec!["u1".to_string(), "u2".to_string()]);
        assert_eq!(rows[0].total_transactions, 1);
    }

    #[test]
    fn test_having_applies_to_aggregates() {
        let engine = engine();
        let rows = engine
            .read_query(&query(&[
                Condition::new("city_tier", "=", json!(1)),
                Condition::new("transaction_count", ">=", json!(2)),
            ]))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id.as_deref(), Some("u1"));
        assert_eq!(rows[0].total_spent, 1700.0);
        assert_eq!(rows[0].transaction_types, "CREDIT_CARD,UPI");
    }

    #[test]
    fn test_list_range_and_text_predicates() {
        let engine = engine();
        let rows = engine
            .read_query(&query(&[
                Condition::between("transaction_date", json!("2024-02-01"), json!("2024-03-10")),
                Condition::new("transaction_type", "IN", json!(["CREDIT_CARD"])),
                Condition::new("city_tier", "NOT IN", json!([3])),
            ]))
            .unwrap();
        let users: Vec<_> = rows.iter().filter_map(|r| r.user_id.clone()).collect();
        assert_eq!(users, vec!["u1".to_string(), "u2".to_string()]);
    }

    #[test]
    fn test_set_operations_are_keyed_on_user() {
        let engine = MemoryEngine::new();
        let union = engine.union(vec![vec![row("1"), row("2")], vec![row("2"), row("3")]]);
        assert_eq!(union.len(), 3);
        let both = engine.intersect(vec![row("1"), row("2"), row("3")], vec![row("2"), row("3"), row("4")]);
        assert_eq!(both, vec![row("2"), row("3")]);
        let rest = engine.except(vec![row("1"), row("2"), row("3")], vec![row("2")]);
        assert_eq!(rest, vec![row("1"), row("3")]);
    }

    #[test]
    fn test_write_replaces_and_failures_are_injectable() {
        let engine = MemoryEngine::new();
        engine.write_table(vec![row("1"), row("2")], "t").unwrap();
        engine.write_table(vec![row("3")], "t").unwrap();
        assert_eq!(engine.user_ids("t"), vec!["3".to_string()]);
        assert_eq!(engine.write_count(), 2);

        engine.fail_writes_to("t");
        assert!(engine.write_table(vec![], "t").is_err());
        assert!(matches!(engine.read_table("missing"), Err(EngineError::TableNotFound(_))));

        engine.crash_queries(true);
        assert!(matches!(
            engine.read_query(&query(&[])),
            Err(EngineError::Process { code: Some(1), .. })
        ));
        engine.crash_queries(false);
        engine.fail_queries(true);
        assert!(matches!(engine.read_query(&query(&[])), Err(EngineError::Query(_))));
        assert_eq!(engine.peak_concurrent_queries(), 1);
    }
}
