//! Condition model: the canonical filter predicates of a rule and the
//! order-independent `ConditionSet` used for subset-cover comparisons.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fields a condition may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Amount,
    CityTier,
    TransactionDate,
    TransactionType,
    TotalSpend,
    TransactionCount,
}

/// Where a field is evaluated: per transaction (WHERE) or per user after
/// aggregation (HAVING).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Raw,
    Aggregate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Numeric,
    Date,
    Text,
}

impl Field {
    pub const ALL: [Field; 6] = [
        Field::Amount,
        Field::CityTier,
        Field::TransactionDate,
        Field::TransactionType,
        Field::TotalSpend,
        Field::TransactionCount,
    ];

    pub fn parse(name: &str) -> Option<Field> {
        let name = name.trim().to_ascii_lowercase();
        Field::ALL.into_iter().find(|f| f.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Field::Amount => "amount",
            Field::CityTier => "city_tier",
            Field::TransactionDate => "transaction_date",
            Field::TransactionType => "transaction_type",
            Field::TotalSpend => "total_spend",
            Field::TransactionCount => "transaction_count",
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            Field::TotalSpend | Field::TransactionCount => FieldKind::Aggregate,
            _ => FieldKind::Raw,
        }
    }

    pub fn value_kind(&self) -> ValueKind {
        match self {
            Field::TransactionDate => ValueKind::Date,
            Field::TransactionType => ValueKind::Text,
            _ => ValueKind::Numeric,
        }
    }

    /// SQL expression the field renders to inside the compiled query.
    pub fn expression(&self) -> &'static str {
        match self {
            Field::TotalSpend => "SUM(amount)",
            Field::TransactionCount => "COUNT(*)",
            other => other.name(),
        }
    }

    pub fn allows(&self, operator: Operator) -> bool {
        match self {
            Field::Amount | Field::CityTier => true,
            Field::TransactionType => matches!(
                operator,
                Operator::Eq | Operator::Ne | Operator::In | Operator::NotIn
            ),
            Field::TransactionDate | Field::TotalSpend | Field::TransactionCount => {
                !operator.takes_list()
            }
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "NOT IN")]
    NotIn,
    #[serde(rename = "BETWEEN")]
    Between,
}

impl Operator {
    pub fn parse(raw: &str) -> Option<Operator> {
        let normalized = raw
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_uppercase();
        match normalized.as_str() {
            ">" => Some(Operator::Gt),
            "<" => Some(Operator::Lt),
            "=" | "==" => Some(Operator::Eq),
            ">=" => Some(Operator::Ge),
            "<=" => Some(Operator::Le),
            "!=" | "<>" => Some(Operator::Ne),
            "IN" => Some(Operator::In),
            "NOT IN" => Some(Operator::NotIn),
            "BETWEEN" => Some(Operator::Between),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Eq => "=",
            Operator::Ge => ">=",
            Operator::Le => "<=",
            Operator::Ne => "!=",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::Between => "BETWEEN",
        }
    }

    pub fn takes_list(&self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A single filter condition as ingested. Every member is optional so that
/// malformed input survives deserialization and can be reported by the
/// compiler instead of failing the whole rule.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value2: Option<Value>,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: impl Into<String>, value: Value) -> Self {
        Self {
            field: Some(field.into()),
            operator: Some(operator.into()),
            value: Some(value),
            value2: None,
        }
    }

    pub fn between(field: impl Into<String>, low: Value, high: Value) -> Self {
        Self {
            field: Some(field.into()),
            operator: Some(Operator::Between.symbol().to_string()),
            value: Some(low),
            value2: Some(high),
        }
    }

    pub fn parsed_field(&self) -> Option<Field> {
        self.field.as_deref().and_then(Field::parse)
    }

    pub fn parsed_operator(&self) -> Option<Operator> {
        self.operator.as_deref().and_then(Operator::parse)
    }

    /// Canonical tuple of this condition: sorted `(attribute, value)` pairs.
    pub fn key(&self) -> ConditionKey {
        let operator = self.parsed_operator();
        let mut pairs = Vec::with_capacity(4);
        if let Some(field) = &self.field {
            pairs.push(("field".to_string(), field.trim().to_ascii_lowercase()));
        }
        if let Some(raw) = &self.operator {
            let canonical = operator
                .map(|op| op.symbol().to_string())
                .unwrap_or_else(|| raw.trim().to_string());
            pairs.push(("operator".to_string(), canonical));
        }
        if let Some(value) = &self.value {
            pairs.push(("value".to_string(), canonical_value(value, operator)));
        }
        if let Some(value2) = &self.value2 {
            pairs.push(("value2".to_string(), canonical_value(value2, None)));
        }
        ConditionKey(pairs)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<Value>| v.as_ref().map(|v| v.to_string()).unwrap_or_default();
        write!(
            f,
            "{} {} {}",
            self.field.as_deref().unwrap_or("?"),
            self.operator.as_deref().unwrap_or("?"),
            show(&self.value)
        )?;
        if self.value2.is_some() {
            write!(f, " AND {}", show(&self.value2))?;
        }
        Ok(())
    }
}

fn canonical_value(value: &Value, operator: Option<Operator>) -> String {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::Array(items) if operator.is_some_and(|op| op.takes_list()) => {
            let mut rendered: Vec<String> = items.iter().map(|v| canonical_value(v, None)).collect();
            rendered.sort();
            rendered.dedup();
            format!("[{}]", rendered.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(|v| canonical_value(v, None)).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

/// Canonical, hashable form of one condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConditionKey(Vec<(String, String)>);

impl ConditionKey {
    pub fn pairs(&self) -> &[(String, String)] {
        &self.0
    }
}

/// Order-independent, duplicate-free set of condition keys.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConditionSet(BTreeSet<ConditionKey>);

impl ConditionSet {
    pub fn from_conditions(conditions: &[Condition]) -> Self {
        Self(conditions.iter().map(Condition::key).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, key: &ConditionKey) -> bool {
        self.0.contains(key)
    }

    pub fn is_subset(&self, other: &ConditionSet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn difference(&self, other: &ConditionSet) -> ConditionSet {
        Self(self.0.difference(&other.0).cloned().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConditionKey> {
        self.0.iter()
    }
}

impl FromIterator<ConditionKey> for ConditionSet {
    fn from_iter<T: IntoIterator<Item = ConditionKey>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
