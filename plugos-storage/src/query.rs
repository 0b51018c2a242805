//! In-memory evaluation of [`QuerySpec`]s over key/value records.
//!
//! Values are compared by their JSON type: numbers numerically, strings
//! lexicographically, booleans with `false < true`. Values of different
//! types never compare equal or ordered, so a filter across types simply
//! does not match. Arrays and objects only support equality.

use crate::error::QueryError;
use plugos_types::{Filter, FilterOp, KvPair, QuerySpec};
use serde_json::{Number, Value};
use std::cmp::Ordering;

/// Tunables for [`QueryEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// Whether `!=` and `not-in` match records that lack the property.
    pub missing_satisfies_negation: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            missing_satisfies_negation: true,
        }
    }
}

/// Evaluates query specifications against a sequence of records.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryEngine {
    options: QueryOptions,
}

impl QueryEngine {
    pub fn new(options: QueryOptions) -> Self {
        Self { options }
    }

    /// Checks a spec for clauses that can never be evaluated.
    pub fn validate(&self, spec: &QuerySpec) -> Result<(), QueryError> {
        for filter in &spec.filter {
            if filter.op.is_set_operator() && !filter.value.is_array() {
                return Err(QueryError::InvalidFilter {
                    prop: filter.prop.clone(),
                    op: filter.op.to_string(),
                    reason: "expected an array of candidate values".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Filters, orders and truncates `records` according to `spec`.
    ///
    /// Records keep their input order unless `orderBy` is set, and the sort
    /// is stable, so repeated evaluation over the same input yields the same
    /// output.
    pub fn evaluate<I>(&self, spec: &QuerySpec, records: I) -> Result<Vec<KvPair>, QueryError>
    where
        I: IntoIterator<Item = KvPair>,
    {
        self.validate(spec)?;

        if spec.limit == Some(0) {
            return Ok(Vec::new());
        }

        let mut matches: Vec<KvPair> = records
            .into_iter()
            .filter(|record| self.matches_all(&spec.filter, record))
            .collect();

        if let Some(prop) = spec.order_by.as_deref() {
            let desc = spec.order_desc;
            matches.sort_by(|a, b| match (a.property(prop), b.property(prop)) {
                (Some(x), Some(y)) => {
                    let ord = sort_order(x, y);
                    if desc { ord.reverse() } else { ord }
                }
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            });
        }

        if let Some(limit) = spec.limit {
            matches.truncate(limit);
        }

        Ok(matches)
    }

    /// Returns true if `record` satisfies every clause.
    pub fn matches_all(&self, filters: &[Filter], record: &KvPair) -> bool {
        filters.iter().all(|filter| self.matches(filter, record))
    }

    /// Returns true if `record` satisfies a single clause.
    pub fn matches(&self, filter: &Filter, record: &KvPair) -> bool {
        let Some(actual) = record.property(&filter.prop) else {
            return filter.op.is_negated() && self.options.missing_satisfies_negation;
        };

        let ord = compare(actual, &filter.value);
        match filter.op {
            FilterOp::Eq => ord == Some(Ordering::Equal),
            FilterOp::Ne => ord != Some(Ordering::Equal),
            FilterOp::Gt => ord == Some(Ordering::Greater),
            FilterOp::Gte => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
            FilterOp::Lt => ord == Some(Ordering::Less),
            FilterOp::Lte => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
            FilterOp::In => contains(&filter.value, actual),
            FilterOp::NotIn => !contains(&filter.value, actual),
        }
    }
}

/// Evaluates `spec` with default options.
pub fn evaluate<I>(spec: &QuerySpec, records: I) -> Result<Vec<KvPair>, QueryError>
where
    I: IntoIterator<Item = KvPair>,
{
    QueryEngine::default().evaluate(spec, records)
}

/// Natural ordering of two JSON values of the same type.
///
/// Returns `None` for values of different types and for unequal arrays or
/// objects, which have no ordering.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            (a == b).then_some(Ordering::Equal)
        }
        _ => None,
    }
}

/// Exact numeric comparison. Integers never round through `f64`, so mixed
/// integer and float operands stay transitive.
fn compare_numbers(x: &Number, y: &Number) -> Option<Ordering> {
    match (integer(x), integer(y)) {
        (Some(x), Some(y)) => Some(x.cmp(&y)),
        (Some(x), None) => compare_int_float(x, y.as_f64()?),
        (None, Some(y)) => compare_int_float(y, x.as_f64()?).map(Ordering::reverse),
        (None, None) => x.as_f64()?.partial_cmp(&y.as_f64()?),
    }
}

fn integer(n: &Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

// JSON integers fit in [-2^63, 2^64), well inside these bounds.
const FLOAT_INT_BOUND: f64 = i128::MAX as f64;

fn compare_int_float(i: i128, f: f64) -> Option<Ordering> {
    if f.is_nan() {
        return None;
    }
    if f >= FLOAT_INT_BOUND {
        return Some(Ordering::Less);
    }
    if f < -FLOAT_INT_BOUND {
        return Some(Ordering::Greater);
    }
    let whole = f.trunc();
    // `whole` is integral and in range, so the cast is exact.
    match i.cmp(&(whole as i128)) {
        Ordering::Equal => 0.0_f64.partial_cmp(&(f - whole)),
        ord => Some(ord),
    }
}

fn contains(candidates: &Value, actual: &Value) -> bool {
    candidates
        .as_array()
        .is_some_and(|items| items.iter().any(|c| compare(actual, c) == Some(Ordering::Equal)))
}

/// Total order used for `orderBy`: natural order within a type, then by
/// type rank. Unordered values of the same type tie, keeping scan order.
fn sort_order(a: &Value, b: &Value) -> Ordering {
    match compare(a, b) {
        Some(ord) => ord,
        None => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}
