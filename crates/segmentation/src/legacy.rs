//! Ingestion adapter: accepts either the list-of-conditions shape or the older
//! flat-map shape and normalizes both into canonical [`Condition`]s.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::condition::{Condition, Field, Operator};

/// Raw condition payload as submitted by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionInput {
    List(Vec<Condition>),
    Legacy(Map<String, Value>),
}

/// Result of normalizing a payload.
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub conditions: Vec<Condition>,
    /// Legacy keys that have no canonical equivalent.
    pub ignored_keys: Vec<String>,
}

pub fn normalize(input: ConditionInput) -> Normalized {
    match input {
        ConditionInput::List(conditions) => Normalized {
            conditions,
            ignored_keys: Vec::new(),
        },
        ConditionInput::Legacy(map) => normalize_legacy(&map),
    }
}

fn normalize_legacy(map: &Map<String, Value>) -> Normalized {
    let mut out = Normalized::default();
    let push = |out: &mut Normalized, field: Field, op: Operator, value: &Value| {
        out.conditions
            .push(Condition::new(field.name(), op.symbol(), value.clone()));
    };

    // BTreeMap-backed `Map` iterates in key order, so output is deterministic.
    for (key, value) in map {
        if value.is_null() {
            continue;
        }
        match key.as_str() {
            "start_date" => push(&mut out, Field::TransactionDate, Operator::Ge, value),
            "end_date" => push(&mut out, Field::TransactionDate, Operator::Le, value),
            "amount" => {
                let op = map
                    .get("amount_operator")
                    .and_then(Value::as_str)
                    .unwrap_or("=");
                out.conditions
                    .push(Condition::new(Field::Amount.name(), op, value.clone()));
            }
            "amount_operator" => {}
            "city_tier" => push(&mut out, Field::CityTier, Operator::Eq, value),
            "city_tier_in" => {
                if value.as_array().is_some_and(|tiers| !tiers.is_empty()) {
                    push(&mut out, Field::CityTier, Operator::In, value);
                }
            }
            "transaction_type" => {
                if let Some(kind) = value.as_str() {
                    if !kind.eq_ignore_ascii_case("all") {
                        push(
                            &mut out,
                            Field::TransactionType,
                            Operator::Eq,
                            &Value::String(kind.to_ascii_uppercase()),
                        );
                    }
                }
            }
            "min_transactions" => push(&mut out, Field::TransactionCount, Operator::Ge, value),
            "total_spend_gt" => push(&mut out, Field::TotalSpend, Operator::Gt, value),
            "total_spend_lt" => push(&mut out, Field::TotalSpend, Operator::Lt, value),
            "transaction_count_gt" => push(&mut out, Field::TransactionCount, Operator::Gt, value),
            "transaction_count_lt" => push(&mut out, Field::TransactionCount, Operator::Lt, value),
            other => {
                warn!(key = %other, "Ignoring unsupported legacy condition key");
                out.ignored_keys.push(other.to_string());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Normalized {
        normalize(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn test_list_passes_through() {
        let normalized = parse(json!([
            {"field": "amount", "operator": ">", "value": 1000},
            {"field": "city_tier", "operator": "=", "value": 1}
        ]));
        assert_eq!(normalized.conditions.len(), 2);
        assert_eq!(normalized.conditions[0].field.as_deref(), Some("amount"));
    }

    #[test]
    fn test_legacy_map_is_translated() {
        let normalized = parse(json!({
            "start_date": "2024-01-01",
            "end_date": "2024-03-31",
            "amount": 500,
            "amount_operator": ">=",
            "city_tier": 2,
            "transaction_type": "upi",
            "min_transactions": 3
        }));
        let rendered: Vec<String> = normalized.conditions.iter().map(|c| c.to_string()).collect();
        assert!(rendered.contains(&"amount >= 500".to_string()));
        assert!(rendered.contains(&"city_tier = 2".to_string()));
        assert!(rendered.contains(&"transaction_date >= \"2024-01-01\"".to_string()));
        assert!(rendered.contains(&"transaction_date <= \"2024-03-31\"".to_string()));
        assert!(rendered.contains(&"transaction_type = \"UPI\"".to_string()));
        assert!(rendered.contains(&"transaction_count >= 3".to_string()));
        assert_eq!(normalized.conditions.len(), 6);
        assert!(normalized.ignored_keys.is_empty());
    }

    #[test]
    fn test_legacy_all_transaction_type_and_unknown_keys() {
        let normalized = parse(json!({
            "transaction_type": "all",
            "timeframe_days": 30,
            "city_tier_in": []
        }));
        assert!(normalized.conditions.is_empty());
        assert_eq!(normalized.ignored_keys, vec!["timeframe_days".to_string()]);
    }

    #[test]
    fn test_legacy_aggregate_thresholds() {
        let normalized = parse(json!({"total_spend_gt": 10000, "transaction_count_lt": 5}));
        let fields: Vec<Option<Field>> = normalized.conditions.iter().map(|c| c.parsed_field()).collect();
        assert_eq!(fields, vec![Some(Field::TotalSpend), Some(Field::TransactionCount)]);
    }
}
