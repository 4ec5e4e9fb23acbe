//! Rule builder: fluent API for constructing rule drafts and their
//! condition lists.

use audience_core::{RuleId, Schedule, SetOperation};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::condition::{Condition, Field, Operator};

/// Explicitly declared combination of existing segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Composition {
    pub dependencies: Vec<RuleId>,
    pub operation: SetOperation,
}

/// A rule as submitted for creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default = "default_active")]
    pub active: bool,
    /// When set, the rule combines these segments and `conditions` become
    /// its residual predicates. Otherwise the resolver decides.
    #[serde(default)]
    pub composition: Option<Composition>,
}

fn default_active() -> bool {
    true
}

pub struct RuleBuilder {
    name: String,
    description: Option<String>,
    conditions: Vec<Condition>,
    schedule: Schedule,
    active: bool,
    composition: Option<Composition>,
}

impl RuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            conditions: Vec::new(),
            schedule: Schedule::default(),
            active: true,
            composition: None,
        }
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn conditions(mut self, conditions: impl IntoIterator<Item = Condition>) -> Self {
        self.conditions.extend(conditions);
        self
    }

    fn push(self, field: Field, operator: Operator, value: Value) -> Self {
        self.condition(Condition::new(field.name(), operator.symbol(), value))
    }

    pub fn amount_gt(self, amount: f64) -> Self {
        self.push(Field::Amount, Operator::Gt, json!(amount))
    }

    pub fn amount_lt(self, amount: f64) -> Self {
        self.push(Field::Amount, Operator::Lt, json!(amount))
    }

    pub fn city_tier(self, tier: u8) -> Self {
        self.push(Field::CityTier, Operator::Eq, json!(tier))
    }

    pub fn city_tier_in(self, tiers: &[u8]) -> Self {
        self.push(Field::CityTier, Operator::In, json!(tiers))
    }

    pub fn transaction_type(self, kind: impl Into<String>) -> Self {
        self.push(Field::TransactionType, Operator::Eq, Value::String(kind.into()))
    }

    pub fn between_dates(self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.condition(Condition::between(
            Field::TransactionDate.name(),
            Value::String(start.into()),
            Value::String(end.into()),
        ))
    }

    pub fn total_spend_gt(self, amount: f64) -> Self {
        self.push(Field::TotalSpend, Operator::Gt, json!(amount))
    }

    pub fn min_transactions(self, count: u64) -> Self {
        self.push(Field::TransactionCount, Operator::Ge, json!(count))
    }

    pub fn combine(mut self, operation: SetOperation, dependencies: impl IntoIterator<Item = RuleId>) -> Self {
        self.composition = Some(Composition {
            dependencies: dependencies.into_iter().collect(),
            operation,
        });
        self
    }

    pub fn build(self) -> RuleDraft {
        RuleDraft {
            name: self.name,
            description: self.description,
            conditions: self.conditions,
            schedule: self.schedule,
            active: self.active,
            composition: self.composition,
        }
    }
}
