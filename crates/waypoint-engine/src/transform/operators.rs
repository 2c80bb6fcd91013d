//! Typed dataflow operators for transform-pipeline tasks
//!
//! A transform task is a declared sequence of [`Operator`]s applied to a
//! JSON array. Internally every operator consumes and produces `Vec<Value>`;
//! `aggregate` always yields exactly one element (so it composes like any
//! other stage) and is unwrapped to a bare scalar only when it is the final
//! stage of the pipeline.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorCode, HasErrorCode};
use crate::model::ExecutionContext;
use crate::template::TemplateResolver;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransformError {
    #[error("transform pipeline expected a JSON array as input")]
    ExpectedArray,
    #[error("field '{0}' not found on row")]
    MissingField(String),
    #[error("field '{field}' is not numeric")]
    NotNumeric { field: String },
    #[error("template error in map/enrich expression: {0}")]
    Template(#[from] crate::template::TemplateError),
}

impl HasErrorCode for TransformError {
    fn code(&self) -> ErrorCode {
        ErrorCode::TaskFailed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggOp {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

/// One stage of a transform pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Operator {
    Filter {
        field: String,
        compare: CompareOp,
        value: Value,
    },
    /// Sets `field` to the result of resolving `template` against a context
    /// whose `input` is the row itself.
    Map {
        field: String,
        template: String,
    },
    Select {
        fields: Vec<String>,
    },
    GroupBy {
        field: String,
    },
    Aggregate {
        #[serde(default)]
        field: Option<String>,
        op: AggOp,
    },
    Join {
        on: String,
        other: Vec<Value>,
        other_on: String,
    },
    SortBy {
        field: String,
        #[serde(default)]
        descending: bool,
    },
    Limit {
        n: usize,
    },
    Skip {
        n: usize,
    },
    FlatMap {
        field: String,
    },
    Enrich {
        field: String,
        value: Value,
    },
    Reverse,
    Unique {
        #[serde(default)]
        field: Option<String>,
    },
    First,
    Scale {
        field: String,
        factor: f64,
    },
    Round {
        field: String,
        decimals: u32,
    },
    Trim {
        field: String,
    },
    Uppercase {
        field: String,
    },
    RandomOne {
        seed: u64,
    },
}

fn get_field<'a>(row: &'a Value, field: &str) -> Option<&'a Value> {
    row.as_object().and_then(|obj| obj.get(field))
}

fn as_f64(value: &Value, field: &str) -> Result<f64, TransformError> {
    value.as_f64().ok_or_else(|| TransformError::NotNumeric { field: field.to_string() })
}

fn compare(op: CompareOp, lhs: &Value, rhs: &Value) -> bool {
    match op {
        CompareOp::Eq => lhs == rhs,
        CompareOp::Ne => lhs != rhs,
        CompareOp::Gt => lhs.as_f64().zip(rhs.as_f64()).map_or(false, |(a, b)| a > b),
        CompareOp::Gte => lhs.as_f64().zip(rhs.as_f64()).map_or(false, |(a, b)| a >= b),
        CompareOp::Lt => lhs.as_f64().zip(rhs.as_f64()).map_or(false, |(a, b)| a < b),
        CompareOp::Lte => lhs.as_f64().zip(rhs.as_f64()).map_or(false, |(a, b)| a <= b),
        CompareOp::Contains => match (lhs.as_str(), rhs.as_str()) {
            (Some(l), Some(r)) => l.contains(r),
            _ => lhs.as_array().map_or(false, |arr| arr.contains(rhs)),
        },
    }
}

fn set_field(row: &mut Value, field: &str, value: Value) {
    if let Value::Object(obj) = row {
        obj.insert(field.to_string(), value);
    }
}

fn apply_one(rows: Vec<Value>, op: &Operator, resolver: &TemplateResolver) -> Result<Vec<Value>, TransformError> {
    match op {
        Operator::Filter { field, compare: cmp, value } => Ok(rows
            .into_iter()
            .filter(|row| get_field(row, field).map_or(false, |v| compare(*cmp, v, value)))
            .collect()),

        Operator::Map { field, template } => rows
            .into_iter()
            .map(|row| {
                let ctx = ExecutionContext::new(row.clone(), Value::Null);
                let resolved = resolver.resolve(template, &ctx)?.into_value();
                let mut row = row;
                set_field(&mut row, field, resolved);
                Ok(row)
            })
            .collect(),

        Operator::Select { fields } => Ok(rows
            .into_iter()
            .map(|row| {
                let mut out = Map::new();
                if let Value::Object(obj) = &row {
                    for field in fields {
                        if let Some(v) = obj.get(field) {
                            out.insert(field.clone(), v.clone());
                        }
                    }
                }
                Value::Object(out)
            })
            .collect()),

        Operator::GroupBy { field } => {
            let mut order: Vec<String> = Vec::new();
            let mut groups: std::collections::HashMap<String, Vec<Value>> = std::collections::HashMap::new();
            for row in rows {
                let key = get_field(&row, field).map(value_to_group_key).unwrap_or_else(|| "null".to_string());
                if !groups.contains_key(&key) {
                    order.push(key.clone());
                }
                groups.entry(key).or_default().push(row);
            }
            Ok(order
                .into_iter()
                .map(|key| {
                    let items = groups.remove(&key).unwrap_or_default();
                    let mut entry = Map::new();
                    entry.insert("key".to_string(), Value::String(key));
                    entry.insert("items".to_string(), Value::Array(items));
                    Value::Object(entry)
                })
                .collect())
        }

        Operator::Aggregate { field, op } => {
            let result = match op {
                AggOp::Count => Value::from(rows.len() as u64),
                AggOp::Sum => {
                    if rows.is_empty() {
                        Value::from(0)
                    } else {
                        let field = field.as_deref().ok_or(TransformError::MissingField("<aggregate field>".into()))?;
                        let mut sum = 0.0;
                        for row in &rows {
                            sum += as_f64(get_field(row, field).ok_or_else(|| TransformError::MissingField(field.to_string()))?, field)?;
                        }
                        Value::from(sum)
                    }
                }
                AggOp::Min | AggOp::Max => {
                    if rows.is_empty() {
                        Value::Null
                    } else {
                        let field = field.as_deref().ok_or(TransformError::MissingField("<aggregate field>".into()))?;
                        let mut values = Vec::with_capacity(rows.len());
                        for row in &rows {
                            values.push(as_f64(get_field(row, field).ok_or_else(|| TransformError::MissingField(field.to_string()))?, field)?);
                        }
                        let picked = if matches!(op, AggOp::Min) {
                            values.into_iter().fold(f64::INFINITY, f64::min)
                        } else {
                            values.into_iter().fold(f64::NEG_INFINITY, f64::max)
                        };
                        Value::from(picked)
                    }
                }
                AggOp::Avg => {
                    if rows.is_empty() {
                        Value::Null
                    } else {
                        let field = field.as_deref().ok_or(TransformError::MissingField("<aggregate field>".into()))?;
                        let mut sum = 0.0;
                        for row in &rows {
                            sum += as_f64(get_field(row, field).ok_or_else(|| TransformError::MissingField(field.to_string()))?, field)?;
                        }
                        Value::from(sum / rows.len() as f64)
                    }
                }
            };
            Ok(vec![result])
        }

        Operator::Join { on, other, other_on } => Ok(rows
            .into_iter()
            .filter_map(|row| {
                let key = get_field(&row, on)?.clone();
                let matched = other.iter().find(|o| get_field(o, other_on) == Some(&key))?;
                let mut merged = row.as_object().cloned().unwrap_or_default();
                if let Some(other_obj) = matched.as_object() {
                    merged.extend(other_obj.clone());
                }
                Some(Value::Object(merged))
            })
            .collect()),

        Operator::SortBy { field, descending } => {
            let mut rows = rows;
            rows.sort_by(|a, b| {
                let ordering = get_field(a, field)
                    .and_then(|v| v.as_f64())
                    .zip(get_field(b, field).and_then(|v| v.as_f64()))
                    .map(|(x, y)| x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal))
                    .unwrap_or_else(|| {
                        let sa = get_field(a, field).and_then(|v| v.as_str()).unwrap_or("");
                        let sb = get_field(b, field).and_then(|v| v.as_str()).unwrap_or("");
                        sa.cmp(sb)
                    });
                if *descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
            Ok(rows)
        }

        Operator::Limit { n } => Ok(rows.into_iter().take(*n).collect()),
        Operator::Skip { n } => Ok(rows.into_iter().skip(*n).collect()),

        Operator::FlatMap { field } => Ok(rows
            .into_iter()
            .flat_map(|row| get_field(&row, field).and_then(Value::as_array).cloned().unwrap_or_default())
            .collect()),

        Operator::Enrich { field, value } => Ok(rows
            .into_iter()
            .map(|mut row| {
                set_field(&mut row, field, value.clone());
                row
            })
            .collect()),

        Operator::Reverse => {
            let mut rows = rows;
            rows.reverse();
            Ok(rows)
        }

        Operator::Unique { field } => {
            let mut seen = std::collections::HashSet::new();
            Ok(rows
                .into_iter()
                .filter(|row| {
                    let key = match field {
                        Some(f) => get_field(row, f).map(value_to_group_key).unwrap_or_else(|| "null".to_string()),
                        None => row.to_string(),
                    };
                    seen.insert(key)
                })
                .collect())
        }

        Operator::First => Ok(rows.into_iter().take(1).collect()),

        Operator::Scale { field, factor } => rows
            .into_iter()
            .map(|mut row| {
                let current = as_f64(get_field(&row, field).ok_or_else(|| TransformError::MissingField(field.to_string()))?, field)?;
                set_field(&mut row, field, Value::from(current * factor));
                Ok(row)
            })
            .collect(),

        Operator::Round { field, decimals } => rows
            .into_iter()
            .map(|mut row| {
                let current = as_f64(get_field(&row, field).ok_or_else(|| TransformError::MissingField(field.to_string()))?, field)?;
                let factor = 10f64.powi(*decimals as i32);
                set_field(&mut row, field, Value::from((current * factor).round() / factor));
                Ok(row)
            })
            .collect(),

        Operator::Trim { field } => Ok(rows
            .into_iter()
            .map(|mut row| {
                if let Some(s) = get_field(&row, field).and_then(Value::as_str) {
                    let trimmed = s.trim().to_string();
                    set_field(&mut row, field, Value::String(trimmed));
                }
                row
            })
            .collect()),

        Operator::Uppercase { field } => Ok(rows
            .into_iter()
            .map(|mut row| {
                if let Some(s) = get_field(&row, field).and_then(Value::as_str) {
                    let upper = s.to_uppercase();
                    set_field(&mut row, field, Value::String(upper));
                }
                row
            })
            .collect()),

        Operator::RandomOne { seed } => {
            let mut rng = StdRng::seed_from_u64(*seed);
            Ok(rows.choose(&mut rng).cloned().into_iter().collect())
        }
    }
}

fn value_to_group_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Run a full pipeline against a JSON array input. `aggregate` is unwrapped
/// to a bare scalar when it is the final stage; every other terminal shape
/// is returned as a JSON array.
pub fn execute_pipeline(operators: &[Operator], input: Value) -> Result<Value, TransformError> {
    let mut rows = match input {
        Value::Array(rows) => rows,
        _ => return Err(TransformError::ExpectedArray),
    };

    let resolver = TemplateResolver::new();
    let mut last_was_aggregate = false;

    for op in operators {
        last_was_aggregate = matches!(op, Operator::Aggregate { .. });
        rows = apply_one(rows, op, &resolver)?;
    }

    if last_was_aggregate {
        Ok(rows.into_iter().next().unwrap_or(Value::Null))
    } else {
        Ok(Value::Array(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_then_select() {
        let input = json!([{"id": 1, "active": true}, {"id": 2, "active": false}]);
        let ops = vec![
            Operator::Filter {
                field: "active".to_string(),
                compare: CompareOp::Eq,
                value: json!(true),
            },
            Operator::Select { fields: vec!["id".to_string()] },
        ];
        let result = execute_pipeline(&ops, input).unwrap();
        assert_eq!(result, json!([{"id": 1}]));
    }

    #[test]
    fn aggregate_count_over_empty_is_zero() {
        let result = execute_pipeline(&[Operator::Aggregate { field: None, op: AggOp::Count }], json!([])).unwrap();
        assert_eq!(result, json!(0));
    }

    #[test]
    fn aggregate_min_over_empty_is_null() {
        let result = execute_pipeline(
            &[Operator::Aggregate {
                field: Some("x".to_string()),
                op: AggOp::Min,
            }],
            json!([]),
        )
        .unwrap();
        assert_eq!(result, Value::Null);
    }

    #[test]
    fn aggregate_sum() {
        let input = json!([{"x": 1}, {"x": 2}, {"x": 3}]);
        let result = execute_pipeline(
            &[Operator::Aggregate {
                field: Some("x".to_string()),
                op: AggOp::Sum,
            }],
            input,
        )
        .unwrap();
        assert_eq!(result, json!(6.0));
    }

    #[test]
    fn group_by_preserves_first_seen_order() {
        let input = json!([{"t": "b"}, {"t": "a"}, {"t": "b"}]);
        let result = execute_pipeline(&[Operator::GroupBy { field: "t".to_string() }], input).unwrap();
        let groups = result.as_array().unwrap();
        assert_eq!(groups[0]["key"], json!("b"));
        assert_eq!(groups[1]["key"], json!("a"));
        assert_eq!(groups[0]["items"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn sort_by_is_stable() {
        let input = json!([{"n": "a", "k": 1}, {"n": "b", "k": 1}, {"n": "c", "k": 0}]);
        let result = execute_pipeline(&[Operator::SortBy { field: "k".to_string(), descending: false }], input).unwrap();
        let rows = result.as_array().unwrap();
        assert_eq!(rows[0]["n"], json!("c"));
        assert_eq!(rows[1]["n"], json!("a"));
        assert_eq!(rows[2]["n"], json!("b"));
    }

    #[test]
    fn limit_and_skip_operate_on_stable_order() {
        let input = json!([{"i": 0}, {"i": 1}, {"i": 2}, {"i": 3}]);
        let result = execute_pipeline(&[Operator::Skip { n: 1 }, Operator::Limit { n: 2 }], input).unwrap();
        assert_eq!(result, json!([{"i": 1}, {"i": 2}]));
    }

    #[test]
    fn random_one_is_reproducible_for_same_seed() {
        let input = json!([{"i": 0}, {"i": 1}, {"i": 2}]);
        let a = execute_pipeline(&[Operator::RandomOne { seed: 42 }], input.clone()).unwrap();
        let b = execute_pipeline(&[Operator::RandomOne { seed: 42 }], input).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn map_applies_template_against_the_row() {
        let input = json!([{"name": "ada"}]);
        let ops = vec![Operator::Map {
            field: "greeting".to_string(),
            template: "hello {{input.name}}".to_string(),
        }];
        let result = execute_pipeline(&ops, input).unwrap();
        assert_eq!(result[0]["greeting"], json!("hello ada"));
    }

    #[test]
    fn scale_and_round_compose() {
        let input = json!([{"x": 1.005}]);
        let ops = vec![Operator::Scale { field: "x".to_string(), factor: 2.0 }, Operator::Round { field: "x".to_string(), decimals: 2 }];
        let result = execute_pipeline(&ops, input).unwrap();
        assert_eq!(result[0]["x"], json!(2.01));
    }

    #[test]
    fn empty_input_array_stays_empty() {
        let result = execute_pipeline(&[Operator::Filter { field: "x".to_string(), compare: CompareOp::Eq, value: json!(1) }], json!([])).unwrap();
        assert_eq!(result, json!([]));
    }
}
