//! Query specification wire types.
//!
//! Mirrors the JSON accepted by `store.query` / `store.deleteQuery`:
//!
//! ```json
//! { "filter": [{ "op": ">", "prop": "age", "value": 10 }],
//!   "orderBy": "age", "orderDesc": true, "limit": 5 }
//! ```
//!
//! Every field is optional; `{}` matches all records.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Comparison operator of a filter clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not-in")]
    NotIn,
}

impl FilterOp {
    /// Returns the wire symbol of this operator.
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::In => "in",
            Self::NotIn => "not-in",
        }
    }

    /// Negated operators are satisfied by records that lack the property.
    pub fn is_negated(&self) -> bool {
        matches!(self, Self::Ne | Self::NotIn)
    }

    /// Set operators compare against an array of candidates.
    pub fn is_set_operator(&self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for FilterOp {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "=" => Ok(Self::Eq),
            "!=" => Ok(Self::Ne),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Gte),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Lte),
            "in" => Ok(Self::In),
            "not-in" => Ok(Self::NotIn),
            other => Err(crate::Error::InvalidOperator(other.to_string())),
        }
    }
}

/// One property/operator/value comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub op: FilterOp,
    pub prop: String,
    pub value: Value,
}

impl Filter {
    pub fn new(op: FilterOp, prop: impl Into<String>, value: Value) -> Self {
        Self {
            op,
            prop: prop.into(),
            value,
        }
    }
}

/// Filter, ordering and limit applied to the records of a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    /// AND-combined clauses; empty matches everything.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    #[serde(default)]
    pub order_desc: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl QuerySpec {
    /// A spec matching every record.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filter(mut self, op: FilterOp, prop: impl Into<String>, value: Value) -> Self {
        self.filter.push(Filter::new(op, prop, value));
        self
    }

    pub fn order_by(mut self, prop: impl Into<String>) -> Self {
        self.order_by = Some(prop.into());
        self
    }

    pub fn descending(mut self) -> Self {
        self.order_desc = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
