//! Condition compiler: turns a rule's condition list into a read-only
//! aggregation query over the unified transaction view.
//!
//! Compilation is best-effort: a malformed condition is dropped and reported as
//! a [`CompileWarning`] while the remaining conditions still compile. The output
//! carries both the SQL text and the typed predicate plan so engines that do
//! not speak SQL can evaluate it directly.

use audience_core::config::{CompilerConfig, TransactionSourceConfig};
use audience_core::{AudienceError, AudienceResult};
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::condition::{Condition, Field, FieldKind, Operator, ValueKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Literal {
    Number(f64),
    Date(NaiveDate),
    Text(String),
}

impl Literal {
    pub fn render(&self) -> String {
        match self {
            Literal::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => format!("{}", *n as i64),
            Literal::Number(n) => format!("{n}"),
            Literal::Date(d) => quote(&d.format("%Y-%m-%d").to_string()),
            Literal::Text(s) => quote(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Scalar(Literal),
    List(Vec<Literal>),
    Range(Literal, Literal),
}

/// A validated, typed condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub field: Field,
    pub operator: Operator,
    pub operand: Operand,
}

impl Predicate {
    pub fn render(&self) -> String {
        let lhs = self.field.expression();
        match &self.operand {
            Operand::Scalar(v) => format!("{lhs} {} {}", self.operator.symbol(), v.render()),
            Operand::List(items) => {
                let rendered: Vec<String> = items.iter().map(Literal::render).collect();
                format!("{lhs} {} ({})", self.operator.symbol(), rendered.join(", "))
            }
            Operand::Range(low, high) => {
                format!("{lhs} BETWEEN {} AND {}", low.render(), high.render())
            }
        }
    }
}

/// Output of the compiler: SQL text plus the typed plan it was rendered from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledQuery {
    pub sql: String,
    /// Pre-aggregation predicates (WHERE), sorted and de-duplicated.
    pub filters: Vec<Predicate>,
    /// Post-aggregation predicates (HAVING), sorted and de-duplicated.
    pub having: Vec<Predicate>,
}

impl CompiledQuery {
    pub fn is_unfiltered(&self) -> bool {
        self.filters.is_empty() && self.having.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum WarningReason {
    #[error("condition has no field")]
    MissingField,
    #[error("condition has no operator")]
    MissingOperator,
    #[error("condition has no value")]
    MissingValue,
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),
    #[error("operator {operator} is not allowed on field {field}")]
    OperatorNotAllowed { field: String, operator: String },
    #[error("{0} requires a non-empty list")]
    EmptyList(String),
    #[error("BETWEEN requires value2")]
    MissingUpperBound,
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// A condition dropped during compilation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompileWarning {
    /// Position of the condition in the input list.
    pub index: usize,
    pub condition: Condition,
    pub reason: WarningReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Compilation {
    pub query: CompiledQuery,
    pub warnings: Vec<CompileWarning>,
}

/// The logical union of all raw transaction sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionView {
    sources: Vec<TransactionSourceConfig>,
}

impl TransactionView {
    pub fn new(sources: Vec<TransactionSourceConfig>) -> AudienceResult<Self> {
        if sources.is_empty() {
            return Err(AudienceError::Config(
                "the transaction view needs at least one source table".into(),
            ));
        }
        Ok(Self { sources })
    }

    pub fn sources(&self) -> &[TransactionSourceConfig] {
        &self.sources
    }

    fn render(&self) -> String {
        self.sources
            .iter()
            .map(|s| {
                format!(
                    "SELECT user_id, amount, transaction_date, category, city_tier, {} AS transaction_type FROM {}",
                    quote(&s.source_type),
                    s.table
                )
            })
            .collect::<Vec<_>>()
            .join(" UNION ALL ")
    }
}

impl Default for TransactionView {
    fn default() -> Self {
        Self {
            sources: CompilerConfig::default().sources,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConditionCompiler {
    view: TransactionView,
}

impl ConditionCompiler {
    pub fn new(view: TransactionView) -> Self {
        Self { view }
    }

    pub fn from_config(config: &CompilerConfig) -> AudienceResult<Self> {
        Ok(Self::new(TransactionView::new(config.sources.clone())?))
    }

    pub fn view(&self) -> &TransactionView {
        &self.view
    }

    pub fn compile(&self, conditions: &[Condition]) -> Compilation {
        let mut filters = Vec::new();
        let mut having = Vec::new();
        let mut warnings = Vec::new();

        for (index, condition) in conditions.iter().enumerate() {
            match validate(condition) {
                Ok(predicate) => match predicate.field.kind() {
                    FieldKind::Raw => filters.push(predicate),
                    FieldKind::Aggregate => having.push(predicate),
                },
                Err(reason) => {
                    warn!(index, condition = %condition, reason = %reason, "Dropping condition");
                    metrics::counter!("compiler.conditions_dropped").increment(1);
                    warnings.push(CompileWarning {
                        index,
                        condition: condition.clone(),
                        reason,
                    });
                }
            }
        }

        let (filters, where_parts) = canonicalize(filters);
        let (having, having_parts) = canonicalize(having);

        let where_clause = if where_parts.is_empty() {
            "1=1".to_string()
        } else {
            where_parts.join(" AND ")
        };
        let mut sql = format!(
            "WITH all_transactions AS ({}), \
             filtered_transactions AS (SELECT * FROM all_transactions WHERE {}) \
             SELECT user_id, COUNT(*) AS total_transactions, SUM(amount) AS total_spent, \
             GROUP_CONCAT(DISTINCT transaction_type) AS transaction_types \
             FROM filtered_transactions GROUP BY user_id",
            self.view.render(),
            where_clause
        );
        if !having_parts.is_empty() {
            sql.push_str(" HAVING ");
            sql.push_str(&having_parts.join(" AND "));
        }
        debug!(sql = %sql, dropped = warnings.len(), "Compiled condition list");

        Compilation {
            query: CompiledQuery {
                sql,
                filters,
                having,
            },
            warnings,
        }
    }
}

/// Sorts predicates by their rendered text and removes duplicates so that
/// reordered input compiles to identical output.
fn canonicalize(predicates: Vec<Predicate>) -> (Vec<Predicate>, Vec<String>) {
    let mut rendered: Vec<(String, Predicate)> =
        predicates.into_iter().map(|p| (p.render(), p)).collect();
    rendered.sort_by(|a, b| a.0.cmp(&b.0));
    rendered.dedup_by(|a, b| a.0 == b.0);
    rendered.into_iter().map(|(text, p)| (p, text)).unzip()
}

fn validate(condition: &Condition) -> Result<Predicate, WarningReason> {
    let raw_field = condition
        .field
        .as_deref()
        .filter(|f| !f.trim().is_empty())
        .ok_or(WarningReason::MissingField)?;
    let raw_operator = condition
        .operator
        .as_deref()
        .filter(|o| !o.trim().is_empty())
        .ok_or(WarningReason::MissingOperator)?;
    let value = condition.value.as_ref().ok_or(WarningReason::MissingValue)?;

    let field =
        Field::parse(raw_field).ok_or_else(|| WarningReason::UnknownField(raw_field.to_string()))?;
    let operator = Operator::parse(raw_operator)
        .ok_or_else(|| WarningReason::UnknownOperator(raw_operator.to_string()))?;
    if !field.allows(operator) {
        return Err(WarningReason::OperatorNotAllowed {
            field: field.name().to_string(),
            operator: operator.symbol().to_string(),
        });
    }

    let kind = field.value_kind();
    let operand = match operator {
        Operator::In | Operator::NotIn => {
            let items = value.as_array().ok_or_else(|| {
                WarningReason::InvalidValue(format!("{} expects a list", operator.symbol()))
            })?;
            if items.is_empty() {
                return Err(WarningReason::EmptyList(operator.symbol().to_string()));
            }
            Operand::List(
                items
                    .iter()
                    .map(|item| literal(item, kind))
                    .collect::<Result<_, _>>()?,
            )
        }
        Operator::Between => {
            let high = condition
                .value2
                .as_ref()
                .ok_or(WarningReason::MissingUpperBound)?;
            Operand::Range(literal(value, kind)?, literal(high, kind)?)
        }
        _ => Operand::Scalar(literal(value, kind)?),
    };

    Ok(Predicate {
        field,
        operator,
        operand,
    })
}

fn literal(value: &Value, kind: ValueKind) -> Result<Literal, WarningReason> {
    let invalid = || WarningReason::InvalidValue(value.to_string());
    match kind {
        ValueKind::Numeric => match value {
            Value::Number(n) => n.as_f64().map(Literal::Number).ok_or_else(invalid),
            Value::String(s) => s.trim().parse::<f64>().map(Literal::Number).map_err(|_| invalid()),
            _ => Err(invalid()),
        },
        ValueKind::Date => value
            .as_str()
            .and_then(parse_date)
            .map(Literal::Date)
            .ok_or_else(invalid),
        ValueKind::Text => value
            .as_str()
            .map(|s| Literal::Text(s.to_string()))
            .ok_or_else(invalid),
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}
