/// Filter evaluation against attribute values
///
/// Both the full-scan path and the index walk go through `compare`, so the
/// two access paths agree by construction.

use crate::query::{Filter, FilterValue, Operator};
use crate::{Item, Value};
use std::cmp::Ordering;

/// Natural ordering of two values of the same orderable type.
///
/// Returns `None` for mismatched types, non-orderable types, and NaN.
pub fn natural_cmp(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.partial_cmp(r),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

/// Evaluate `actual <op> expected`.
///
/// `actual` is `None` when the record lacks the attribute. An absent value
/// only satisfies `!=`.
pub fn compare(actual: Option<&Value>, op: Operator, expected: &FilterValue) -> bool {
    match (op, expected) {
        (Operator::Eq, FilterValue::Single(v)) => actual.is_some_and(|a| a == v),
        (Operator::Ne, FilterValue::Single(v)) => !actual.is_some_and(|a| a == v),
        (Operator::In, FilterValue::Set(values)) => {
            actual.is_some_and(|a| values.iter().any(|v| a == v))
        }
        (op, FilterValue::Single(v)) if op.is_range() => {
            let Some(ordering) = actual.and_then(|a| natural_cmp(a, v)) else {
                return false;
            };
            match op {
                Operator::Gt => ordering == Ordering::Greater,
                Operator::Gte => ordering != Ordering::Less,
                Operator::Lt => ordering == Ordering::Less,
                Operator::Lte => ordering != Ordering::Greater,
                _ => false,
            }
        }
        // Operator/value shape mismatches are rejected when the query is built
        _ => false,
    }
}

/// True if the item satisfies the filter
pub fn matches_filter(item: &Item, filter: &Filter) -> bool {
    compare(item.get(&filter.field), filter.operator, &filter.value)
}

/// True if the item satisfies every filter
pub fn matches_all<'a>(item: &Item, filters: impl IntoIterator<Item = &'a Filter>) -> bool {
    filters.into_iter().all(|f| matches_filter(item, f))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(v: impl Into<Value>) -> FilterValue {
        FilterValue::Single(v.into())
    }

    #[test]
    fn test_equality_is_strict() {
        assert!(compare(Some(&Value::from(1)), Operator::Eq, &single(1)));
        assert!(!compare(Some(&Value::from(1)), Operator::Eq, &single("1")));
        assert!(!compare(Some(&Value::from("1")), Operator::Eq, &single(1)));
        assert!(compare(Some(&Value::from("1")), Operator::Eq, &single("1")));
        assert!(compare(Some(&Value::Bool(true)), Operator::Eq, &single(true)));
        assert!(!compare(Some(&Value::Bool(true)), Operator::Eq, &single(false)));
        assert!(compare(Some(&Value::Null), Operator::Eq, &single(Value::Null)));
        assert!(!compare(Some(&Value::Number(f64::NAN)), Operator::Eq, &single(f64::NAN)));
    }

    #[test]
    fn test_absent_is_not_null() {
        assert!(!compare(None, Operator::Eq, &single(Value::Null)));
        assert!(compare(None, Operator::Ne, &single(Value::Null)));
    }

    #[test]
    fn test_inequality_is_strict() {
        assert!(!compare(Some(&Value::from(1)), Operator::Ne, &single(1)));
        assert!(compare(Some(&Value::from(1)), Operator::Ne, &single("1")));
        assert!(!compare(Some(&Value::Null), Operator::Ne, &single(Value::Null)));
        assert!(compare(Some(&Value::Number(f64::NAN)), Operator::Ne, &single(f64::NAN)));
    }

    #[test]
    fn test_ordering_operators() {
        let one = Value::from(1);
        assert!(compare(Some(&one), Operator::Gt, &single(0)));
        assert!(!compare(Some(&one), Operator::Gt, &single(1)));
        assert!(compare(Some(&one), Operator::Gte, &single(1)));
        assert!(!compare(Some(&one), Operator::Gte, &single(2)));
        assert!(compare(Some(&one), Operator::Lt, &single(2)));
        assert!(!compare(Some(&one), Operator::Lt, &single(1)));
        assert!(compare(Some(&one), Operator::Lte, &single(1)));
        assert!(!compare(Some(&one), Operator::Lte, &single(0)));

        assert!(compare(Some(&Value::from("b")), Operator::Gt, &single("a")));
    }

    #[test]
    fn test_ordering_never_crosses_types() {
        assert!(!compare(Some(&Value::from("5")), Operator::Gt, &single(1)));
        assert!(!compare(Some(&Value::from(5)), Operator::Lt, &single("z")));
        assert!(!compare(None, Operator::Lt, &single(100)));
        assert!(!compare(Some(&Value::Number(f64::NAN)), Operator::Gte, &single(0)));
        assert!(!compare(Some(&Value::Number(f64::NAN)), Operator::Lte, &single(0)));
    }

    #[test]
    fn test_in_operator() {
        let set = FilterValue::Set(vec![Value::from(20), Value::from(25)]);
        assert!(compare(Some(&Value::from(25)), Operator::In, &set));
        assert!(!compare(Some(&Value::from(30)), Operator::In, &set));
        assert!(!compare(None, Operator::In, &set));
    }
}
