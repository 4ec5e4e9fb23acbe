//! Per-rule run locks shared by the scheduler and the executor.

use std::sync::Arc;

use audience_core::RuleId;
use dashmap::DashMap;
use tokio::sync::Mutex;

/// Registry of one mutex per rule. Clones share the same registry.
///
/// Whoever holds a rule's lock is the only one materializing it. Locks are
/// taken along dependency edges (a composite before its dependencies), which
/// the acyclic lineage graph keeps deadlock-free.
#[derive(Debug, Clone, Default)]
pub struct RuleLocks {
    locks: Arc<DashMap<RuleId, Arc<Mutex<()>>>>,
}

impl RuleLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, rule_id: RuleId) -> Arc<Mutex<()>> {
        self.locks
            .entry(rule_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
