//! Algebraic equivalence checker used by an optimizer
//!
//! Pure and separate from pipeline execution: given two adjacent pipeline
//! stages, decide whether they may be fused or reordered without changing
//! the result.

use super::operators::Operator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Safety {
    Safe,
    Conditional,
    Unsafe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EquivalenceCheck {
    pub equivalent: bool,
    pub safety: Safety,
    pub proof: String,
    pub warning: Option<String>,
}

impl EquivalenceCheck {
    fn safe(proof: impl Into<String>) -> Self {
        Self {
            equivalent: true,
            safety: Safety::Safe,
            proof: proof.into(),
            warning: None,
        }
    }

    fn unsafe_(proof: impl Into<String>, warning: impl Into<String>) -> Self {
        Self {
            equivalent: false,
            safety: Safety::Unsafe,
            proof: proof.into(),
            warning: Some(warning.into()),
        }
    }

    fn conditional(equivalent: bool, proof: impl Into<String>, warning: impl Into<String>) -> Self {
        Self {
            equivalent,
            safety: Safety::Conditional,
            proof: proof.into(),
            warning: Some(warning.into()),
        }
    }
}

/// Check whether `first` followed by `second` may be fused or reordered.
/// Unrecognized pairs are reported `Unsafe` with no equivalence claimed:
/// the optimizer should leave them in their original order.
pub fn check_pair(first: &Operator, second: &Operator) -> EquivalenceCheck {
    match (first, second) {
        (Operator::Filter { .. }, Operator::Filter { .. }) => {
            EquivalenceCheck::safe("filter(A); filter(B) ≡ filter(A ∧ B): both predicates independently drop rows, so applying them in sequence or as one conjunction visits the same surviving set")
        }

        (Operator::Map { field: f1, .. }, Operator::Map { field: f2, .. }) if f1 == f2 => {
            EquivalenceCheck::safe("map(f); map(g) ≡ map(g ∘ f) on the same field: the second map's input is exactly the first map's output")
        }
        (Operator::Map { .. }, Operator::Map { .. }) => {
            EquivalenceCheck::safe("map(f); map(g) on disjoint fields ≡ map(g ∘ f) applied independently per field: the writes do not interact")
        }

        (Operator::Select { fields: f1 }, Operator::Select { fields: f2 }) => {
            let intersection: Vec<String> = f1.iter().filter(|f| f2.contains(f)).cloned().collect();
            EquivalenceCheck::safe(format!(
                "select(F1); select(F2) ≡ select(F1 ∩ F2): narrows to the intersection {intersection:?}"
            ))
        }

        (Operator::Filter { field: filter_field, .. }, Operator::Map { field: map_field, .. }) | (Operator::Map { field: map_field, .. }, Operator::Filter { field: filter_field, .. }) => {
            if filter_field != map_field {
                EquivalenceCheck::safe(format!(
                    "filter on '{filter_field}' and map writing '{map_field}' touch disjoint fields, so they commute"
                ))
            } else {
                EquivalenceCheck::conditional(
                    false,
                    format!("filter reads the same field '{filter_field}' that map writes"),
                    "reordering would change which rows the filter sees; only safe if map is idempotent with respect to the filter predicate",
                )
            }
        }

        (Operator::Limit { .. }, Operator::Filter { .. }) | (Operator::Filter { .. }, Operator::Limit { .. }) => {
            EquivalenceCheck::unsafe_(
                "limit and filter do not commute",
                "filtering after limiting can drop rows a post-filter-then-limit pipeline would have kept, and vice versa; row count is order-sensitive",
            )
        }

        (Operator::Limit { .. }, Operator::Map { .. }) | (Operator::Map { .. }, Operator::Limit { .. }) => {
            EquivalenceCheck::safe("map does not change row count or order, so it commutes freely with limit")
        }

        _ => EquivalenceCheck {
            equivalent: false,
            safety: Safety::Unsafe,
            proof: "no known equivalence rule for this operator pair".to_string(),
            warning: Some("treat as order-sensitive until a rule is added".to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::operators::CompareOp;
    use serde_json::json;

    fn filter(field: &str) -> Operator {
        Operator::Filter {
            field: field.to_string(),
            compare: CompareOp::Eq,
            value: json!(true),
        }
    }

    fn map(field: &str) -> Operator {
        Operator::Map {
            field: field.to_string(),
            template: "{{input.x}}".to_string(),
        }
    }

    #[test]
    fn filter_fusion_is_always_safe() {
        let check = check_pair(&filter("a"), &filter("b"));
        assert!(check.equivalent);
        assert_eq!(check.safety, Safety::Safe);
    }

    #[test]
    fn map_composition_is_safe() {
        let check = check_pair(&map("a"), &map("a"));
        assert!(check.equivalent);
        assert_eq!(check.safety, Safety::Safe);
    }

    #[test]
    fn filter_map_commute_when_disjoint() {
        let check = check_pair(&filter("a"), &map("b"));
        assert!(check.equivalent);
    }

    #[test]
    fn filter_map_conditional_when_same_field() {
        let check = check_pair(&filter("a"), &map("a"));
        assert!(!check.equivalent);
        assert_eq!(check.safety, Safety::Conditional);
    }

    #[test]
    fn limit_filter_is_unsafe() {
        let check = check_pair(&Operator::Limit { n: 5 }, &filter("a"));
        assert!(!check.equivalent);
        assert_eq!(check.safety, Safety::Unsafe);
    }

    #[test]
    fn limit_map_commutes() {
        let check = check_pair(&Operator::Limit { n: 5 }, &map("a"));
        assert!(check.equivalent);
        assert_eq!(check.safety, Safety::Safe);
    }
}
