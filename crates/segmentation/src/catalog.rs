//! Segment catalog: one durable row per rule holding the rule definition, its
//! segment (own query or dependency list + operation) and refresh metadata.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use audience_core::{AudienceError, AudienceResult, RuleId, Schedule, SetOperation};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::compiler::CompiledQuery;
use crate::condition::Condition;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Own predicates of a base rule, or the residual predicates of a composite.
    pub conditions: Vec<Condition>,
    /// The full condition list as declared, used for subset-cover matching.
    pub declared_conditions: Vec<Condition>,
    pub dependencies: Option<Vec<RuleId>>,
    pub operation: Option<SetOperation>,
    pub active: bool,
    pub schedule: Schedule,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    pub fn is_composite(&self) -> bool {
        self.dependencies.is_some()
    }
}

/// How a segment is computed. The two shapes are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SegmentSource {
    Base {
        query: CompiledQuery,
    },
    Composite {
        depends_on: Vec<RuleId>,
        operation: SetOperation,
        /// Residual predicates applied on top of the combined dependencies.
        residual: Option<CompiledQuery>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub rule_id: RuleId,
    pub segment_name: String,
    pub table_name: String,
    pub source: SegmentSource,
    pub row_count: u64,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    /// Freshness of the underlying data: the refresh time for a base segment,
    /// the oldest dependency freshness for a composite.
    pub data_as_of: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Segment {
    pub fn compiled_query(&self) -> Option<&CompiledQuery> {
        match &self.source {
            SegmentSource::Base { query } => Some(query),
            SegmentSource::Composite { .. } => None,
        }
    }

    pub fn depends_on(&self) -> Option<&[RuleId]> {
        match &self.source {
            SegmentSource::Base { .. } => None,
            SegmentSource::Composite { depends_on, .. } => Some(depends_on),
        }
    }

    pub fn operation(&self) -> Option<SetOperation> {
        match &self.source {
            SegmentSource::Base { .. } => None,
            SegmentSource::Composite { operation, .. } => Some(*operation),
        }
    }

    pub fn is_materialized(&self) -> bool {
        self.last_refreshed_at.is_some()
    }
}

/// Flat persisted row of a segment: `depends_on` as a JSON list of rule ids,
/// `operation` as an upper-case string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub rule_id: RuleId,
    pub segment_name: String,
    pub table_name: String,
    pub compiled_query: Option<String>,
    pub depends_on: Option<String>,
    pub operation: Option<String>,
    /// JSON of the typed plan: the base query, or the residual of a composite.
    pub query_plan: Option<String>,
    pub row_count: u64,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub data_as_of: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<&Segment> for SegmentRecord {
    type Error = AudienceError;

    fn try_from(segment: &Segment) -> AudienceResult<Self> {
        let (compiled_query, depends_on, operation, query_plan) = match &segment.source {
            SegmentSource::Base { query } => (
                Some(query.sql.clone()),
                None,
                None,
                Some(serde_json::to_string(query)?),
            ),
            SegmentSource::Composite {
                depends_on,
                operation,
                residual,
            } => (
                None,
                Some(serde_json::to_string(depends_on)?),
                Some(operation.to_string()),
                residual.as_ref().map(serde_json::to_string).transpose()?,
            ),
        };
        Ok(Self {
            rule_id: segment.rule_id,
            segment_name: segment.segment_name.clone(),
            table_name: segment.table_name.clone(),
            compiled_query,
            depends_on,
            operation,
            query_plan,
            row_count: segment.row_count,
            last_refreshed_at: segment.last_refreshed_at,
            data_as_of: segment.data_as_of,
            created_at: segment.created_at,
        })
    }
}

impl TryFrom<SegmentRecord> for Segment {
    type Error = AudienceError;

    fn try_from(record: SegmentRecord) -> AudienceResult<Self> {
        let plan: Option<CompiledQuery> = record
            .query_plan
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        let source = match (&record.compiled_query, &record.depends_on) {
            (Some(_), None) => SegmentSource::Base {
                query: plan.ok_or_else(|| {
                    AudienceError::Catalog(format!(
                        "segment {} has a compiled query but no plan",
                        record.rule_id
                    ))
                })?,
            },
            (None, Some(raw)) => {
                let depends_on: Vec<RuleId> = serde_json::from_str(raw)?;
                let operation = record
                    .operation
                    .as_deref()
                    .ok_or_else(|| {
                        AudienceError::Catalog(format!(
                            "segment {} has dependencies but no operation",
                            record.rule_id
                        ))
                    })?
                    .parse::<SetOperation>()
                    .map_err(AudienceError::Catalog)?;
                SegmentSource::Composite {
                    depends_on,
                    operation,
                    residual: plan,
                }
            }
            _ => {
                return Err(AudienceError::Catalog(format!(
                    "segment {} must have exactly one of compiled_query and depends_on",
                    record.rule_id
                )))
            }
        };

        Ok(Segment {
            rule_id: record.rule_id,
            segment_name: record.segment_name,
            table_name: record.table_name,
            source,
            row_count: record.row_count,
            last_refreshed_at: record.last_refreshed_at,
            data_as_of: record.data_as_of,
            created_at: record.created_at,
        })
    }
}

/// A rule and its segment, versioned as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub rule: Rule,
    pub segment: Segment,
    pub version: u64,
}

impl CatalogEntry {
    pub fn id(&self) -> RuleId {
        self.rule.id
    }

    /// Checks the structural invariants a row must satisfy before it is
    /// committed.
    pub fn validate(&self) -> AudienceResult<()> {
        let rule = &self.rule;
        if rule.name.trim().is_empty() {
            return Err(AudienceError::InvalidRule("rule name must not be empty".into()));
        }
        if rule.id != self.segment.rule_id {
            return Err(AudienceError::InvalidRule(format!(
                "segment belongs to rule {}, not {}",
                self.segment.rule_id, rule.id
            )));
        }
        if rule.dependencies.is_some() != rule.operation.is_some() {
            return Err(AudienceError::InvalidRule(
                "dependencies and operation must be set together".into(),
            ));
        }
        match (&self.segment.source, &rule.dependencies) {
            (SegmentSource::Base { .. }, None) => {}
            (
                SegmentSource::Composite {
                    depends_on,
                    operation,
                    ..
                },
                Some(deps),
            ) => {
                if depends_on != deps || Some(*operation) != rule.operation {
                    return Err(AudienceError::InvalidRule(
                        "segment dependencies disagree with the rule".into(),
                    ));
                }
                if deps.is_empty() {
                    return Err(AudienceError::InvalidRule(
                        "a composite rule needs at least one dependency".into(),
                    ));
                }
                if deps.contains(&rule.id) {
                    return Err(AudienceError::InvalidRule(format!(
                        "rule {} cannot depend on itself",
                        rule.id
                    )));
                }
                let unique: HashSet<_> = deps.iter().collect();
                if unique.len() != deps.len() {
                    return Err(AudienceError::InvalidRule("duplicate dependency".into()));
                }
            }
            _ => {
                return Err(AudienceError::InvalidRule(
                    "segment source disagrees with the rule".into(),
                ))
            }
        }
        Ok(())
    }
}

/// Metadata written after a successful materialization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Refresh {
    pub row_count: u64,
    pub refreshed_at: DateTime<Utc>,
    pub data_as_of: DateTime<Utc>,
}

/// Transactional store behind the catalog. Every method changes at most one
/// row and does so atomically.
pub trait CatalogStore: Send + Sync {
    fn allocate_id(&self) -> RuleId;

    fn get(&self, id: RuleId) -> Option<CatalogEntry>;

    /// All rows ordered by rule id.
    fn list(&self) -> Vec<CatalogEntry>;

    /// Insert a new row. Fails when the id or rule name is already taken.
    fn insert(&self, entry: CatalogEntry) -> AudienceResult<CatalogEntry>;

    /// Swap a whole row, provided nobody changed it since `expected_version`.
    fn replace(&self, entry: CatalogEntry, expected_version: u64) -> AudienceResult<CatalogEntry>;

    fn remove(&self, id: RuleId) -> AudienceResult<CatalogEntry>;

    fn record_refresh(&self, id: RuleId, refresh: Refresh) -> AudienceResult<()>;

    fn record_run(
        &self,
        id: RuleId,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> AudienceResult<()>;

    fn rules(&self) -> Vec<Rule> {
        self.list().into_iter().map(|e| e.rule).collect()
    }
}

/// In-memory catalog backed by DashMap.
///
/// Production: back the same trait with a SQL store and row-level locking.
pub struct MemoryCatalog {
    entries: DashMap<RuleId, CatalogEntry>,
    names: DashMap<String, RuleId>,
    next_id: AtomicU64,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        info!("Segment catalog initialized (in-memory)");
        Self {
            entries: DashMap::new(),
            names: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogStore for MemoryCatalog {
    fn allocate_id(&self) -> RuleId {
        RuleId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn get(&self, id: RuleId) -> Option<CatalogEntry> {
        self.entries.get(&id).map(|e| e.value().clone())
    }

    fn list(&self) -> Vec<CatalogEntry> {
        let mut entries: Vec<CatalogEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.id());
        entries
    }

    fn insert(&self, mut entry: CatalogEntry) -> AudienceResult<CatalogEntry> {
        entry.validate()?;
        let id = entry.id();
        match self.names.entry(entry.rule.name.clone()) {
            Entry::Occupied(_) => return Err(AudienceError::DuplicateRuleName(entry.rule.name)),
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }
        match self.entries.entry(id) {
            Entry::Occupied(_) => {
                self.names.remove(&entry.rule.name);
                Err(AudienceError::Catalog(format!("rule {id} already exists")))
            }
            Entry::Vacant(slot) => {
                entry.version = 1;
                slot.insert(entry.clone());
                debug!(rule_id = %id, "Catalog row inserted");
                Ok(entry)
            }
        }
    }

    fn replace(&self, mut entry: CatalogEntry, expected_version: u64) -> AudienceResult<CatalogEntry> {
        entry.validate()?;
        let id = entry.id();
        let mut current = self.entries.get_mut(&id).ok_or(AudienceError::RuleNotFound(id))?;
        if current.version != expected_version {
            return Err(AudienceError::VersionConflict {
                rule_id: id,
                expected: expected_version,
                found: current.version,
            });
        }

        let old_name = current.rule.name.clone();
        if old_name != entry.rule.name {
            match self.names.entry(entry.rule.name.clone()) {
                Entry::Occupied(_) => return Err(AudienceError::DuplicateRuleName(entry.rule.name)),
                Entry::Vacant(slot) => {
                    slot.insert(id);
                }
            }
            self.names.remove(&old_name);
        }

        entry.version = expected_version + 1;
        *current = entry.clone();
        debug!(rule_id = %id, version = entry.version, "Catalog row replaced");
        Ok(entry)
    }

    fn remove(&self, id: RuleId) -> AudienceResult<CatalogEntry> {
        let (_, entry) = self.entries.remove(&id).ok_or(AudienceError::RuleNotFound(id))?;
        self.names.remove(&entry.rule.name);
        debug!(rule_id = %id, "Catalog row removed");
        Ok(entry)
    }

    fn record_refresh(&self, id: RuleId, refresh: Refresh) -> AudienceResult<()> {
        let mut entry = self.entries.get_mut(&id).ok_or(AudienceError::RuleNotFound(id))?;
        entry.segment.row_count = refresh.row_count;
        entry.segment.last_refreshed_at = Some(refresh.refreshed_at);
        entry.segment.data_as_of = Some(refresh.data_as_of);
        entry.version += 1;
        Ok(())
    }

    fn record_run(
        &self,
        id: RuleId,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> AudienceResult<()> {
        let mut entry = self.entries.get_mut(&id).ok_or(AudienceError::RuleNotFound(id))?;
        entry.rule.last_run_at = Some(last_run_at);
        entry.rule.next_run_at = Some(next_run_at);
        entry.version += 1;
        Ok(())
    }
}
