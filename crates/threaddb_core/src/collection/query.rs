//! Mongo-style filter queries.
//!
//! A query is a JSON document such as
//!
//! ```json
//! {"$and": [{"age": {"$gt": 5, "$lt": 56}}, {"name": {"$ne": "Micheal"}}]}
//! ```
//!
//! Field names may be dotted paths (`address.city`, `tags.0`). A bare value
//! means `$eq`; several operators on one field must all hold.

use crate::error::{CoreError, CoreResult};
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone)]
enum Cond {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(Regex),
    Not(Vec<Cond>),
}

#[derive(Debug, Clone)]
enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Nor(Vec<Expr>),
    Not(Box<Expr>),
    Field { path: Vec<String>, conds: Vec<Cond> },
}

/// A compiled filter over instance values.
#[derive(Debug, Clone)]
pub struct Query {
    expr: Expr,
}

impl Query {
    /// A query that matches everything.
    #[must_use]
    pub fn all() -> Self {
        Self {
            expr: Expr::And(Vec::new()),
        }
    }

    /// Compiles a query document.
    pub fn parse(document: &Value) -> CoreResult<Self> {
        Ok(Self {
            expr: parse_expr(document)?,
        })
    }

    /// Returns true if `value` satisfies the query.
    #[must_use]
    pub fn matches(&self, value: &Value) -> bool {
        eval(&self.expr, value)
    }
}

impl Default for Query {
    fn default() -> Self {
        Self::all()
    }
}

impl TryFrom<Value> for Query {
    type Error = CoreError;

    fn try_from(document: Value) -> CoreResult<Self> {
        Self::parse(&document)
    }
}

fn parse_expr(document: &Value) -> CoreResult<Expr> {
    let map = document
        .as_object()
        .ok_or_else(|| CoreError::invalid_query("query must be an object"))?;

    let mut clauses = Vec::with_capacity(map.len());
    for (key, value) in map {
        let clause = match key.as_str() {
            "$and" => Expr::And(parse_list(key, value)?),
            "$or" => Expr::Or(parse_list(key, value)?),
            "$nor" => Expr::Nor(parse_list(key, value)?),
            "$not" => Expr::Not(Box::new(parse_expr(value)?)),
            op if op.starts_with('$') => {
                return Err(CoreError::invalid_query(format!("unknown operator {op}")))
            }
            field => Expr::Field {
                path: field.split('.').map(str::to_owned).collect(),
                conds: parse_conds(value)?,
            },
        };
        clauses.push(clause);
    }

    Ok(match clauses.len() {
        1 => clauses.remove(0),
        _ => Expr::And(clauses),
    })
}

fn parse_list(op: &str, value: &Value) -> CoreResult<Vec<Expr>> {
    value
        .as_array()
        .ok_or_else(|| CoreError::invalid_query(format!("{op} expects an array")))?
        .iter()
        .map(parse_expr)
        .collect()
}

fn is_operator_object(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|m| !m.is_empty() && m.keys().all(|k| k.starts_with('$')))
}

fn parse_conds(value: &Value) -> CoreResult<Vec<Cond>> {
    let Some(map) = value.as_object().filter(|_| is_operator_object(value)) else {
        return Ok(vec![Cond::Eq(value.clone())]);
    };

    let options = map.get("$options").and_then(Value::as_str).unwrap_or("");
    let mut conds = Vec::with_capacity(map.len());
    for (op, arg) in map {
        let cond = match op.as_str() {
            "$eq" => Cond::Eq(arg.clone()),
            "$ne" => Cond::Ne(arg.clone()),
            "$gt" => Cond::Gt(arg.clone()),
            "$gte" => Cond::Gte(arg.clone()),
            "$lt" => Cond::Lt(arg.clone()),
            "$lte" => Cond::Lte(arg.clone()),
            "$in" => Cond::In(array_arg(op, arg)?),
            "$nin" => Cond::Nin(array_arg(op, arg)?),
            "$exists" => Cond::Exists(
                arg.as_bool()
                    .ok_or_else(|| CoreError::invalid_query("$exists expects a boolean"))?,
            ),
            "$regex" => Cond::Regex(compile_regex(arg, options)?),
            "$options" => continue,
            "$not" => match arg {
                Value::String(_) => Cond::Not(vec![Cond::Regex(compile_regex(arg, options)?)]),
                _ if is_operator_object(arg) => Cond::Not(parse_conds(arg)?),
                _ => return Err(CoreError::invalid_query("$not expects operators or a regex")),
            },
            other => return Err(CoreError::invalid_query(format!("unknown operator {other}"))),
        };
        conds.push(cond);
    }
    Ok(conds)
}

fn array_arg(op: &str, arg: &Value) -> CoreResult<Vec<Value>> {
    arg.as_array()
        .cloned()
        .ok_or_else(|| CoreError::invalid_query(format!("{op} expects an array")))
}

fn compile_regex(arg: &Value, options: &str) -> CoreResult<Regex> {
    let pattern = arg
        .as_str()
        .ok_or_else(|| CoreError::invalid_query("$regex expects a string"))?;
    RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .build()
        .map_err(|e| CoreError::invalid_query(format!("invalid regex {pattern:?}: {e}")))
}

/// Resolves a dotted path. Numeric segments index into arrays.
pub(crate) fn resolve<'a, S: AsRef<str>>(value: &'a Value, path: &[S]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, segment| {
        let segment = segment.as_ref();
        match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    })
}

fn eval(expr: &Expr, value: &Value) -> bool {
    match expr {
        Expr::And(exprs) => exprs.iter().all(|e| eval(e, value)),
        Expr::Or(exprs) => exprs.iter().any(|e| eval(e, value)),
        Expr::Nor(exprs) => !exprs.iter().any(|e| eval(e, value)),
        Expr::Not(inner) => !eval(inner, value),
        Expr::Field { path, conds } => {
            let field = resolve(value, path);
            conds.iter().all(|c| test(c, field))
        }
    }
}

fn test(cond: &Cond, field: Option<&Value>) -> bool {
    match cond {
        Cond::Exists(expected) => field.is_some() == *expected,
        Cond::Ne(target) => !test(&Cond::Eq(target.clone()), field),
        Cond::Nin(targets) => !test(&Cond::In(targets.clone()), field),
        Cond::Not(conds) => !conds.iter().all(|c| test(c, field)),
        _ => {
            let Some(field) = field else {
                // A missing field equals null.
                return matches!(cond, Cond::Eq(Value::Null))
                    || matches!(cond, Cond::In(t) if t.contains(&Value::Null));
            };
            // Array fields match if the array itself or any element does.
            test_value(cond, field)
                || matches!(field, Value::Array(items) if items.iter().any(|i| test_value(cond, i)))
        }
    }
}

fn test_value(cond: &Cond, value: &Value) -> bool {
    match cond {
        Cond::Eq(target) => json_eq(value, target),
        Cond::In(targets) => targets.iter().any(|t| json_eq(value, t)),
        Cond::Gt(target) => compare_same_type(value, target) == Some(Ordering::Greater),
        Cond::Gte(target) => matches!(
            compare_same_type(value, target),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Cond::Lt(target) => compare_same_type(value, target) == Some(Ordering::Less),
        Cond::Lte(target) => matches!(
            compare_same_type(value, target),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Cond::Regex(re) => value.as_str().is_some_and(|s| re.is_match(s)),
        Cond::Ne(_) | Cond::Nin(_) | Cond::Exists(_) | Cond::Not(_) => false,
    }
}

/// Equality that treats `1` and `1.0` as equal.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_eq(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| json_eq(v, w)))
        }
        _ => a == b,
    }
}

/// Orders values of the same JSON type. Mixed types are incomparable.
fn compare_same_type(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

/// Total order used for sorting: values of different types order by type,
/// missing fields sort with null.
pub(crate) fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Array(x)), Some(Value::Array(y))) => x
            .iter()
            .zip(y)
            .map(|(a, b)| compare_values(Some(a), Some(b)))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Some(Value::Object(x)), Some(Value::Object(y))) => x
            .iter()
            .zip(y)
            .map(|((ka, va), (kb, vb))| ka.cmp(kb).then_with(|| compare_values(Some(va), Some(vb))))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Some(x), Some(y)) => compare_same_type(x, y)
            .unwrap_or_else(|| type_rank(Some(x)).cmp(&type_rank(Some(y)))),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// One sort criterion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// Dotted field path.
    pub path: String,
    /// Sort descending instead of ascending.
    pub descending: bool,
}

impl SortKey {
    /// Ascending order on `path`.
    pub fn asc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            descending: false,
        }
    }

    /// Descending order on `path`.
    pub fn desc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            descending: true,
        }
    }
}

/// Ordering and paging for [`Collection::find`](super::Collection::find).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindOptions {
    /// Sort criteria, most significant first. Empty keeps id order.
    pub sort: Vec<SortKey>,
    /// Number of matches to skip.
    pub offset: usize,
    /// Maximum number of matches to return.
    pub limit: Option<usize>,
}

impl FindOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sort criterion.
    #[must_use]
    pub fn sort(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    /// Sets the offset.
    #[must_use]
    pub const fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Sets the limit.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Compares two instances by the sort criteria.
    pub(crate) fn compare(&self, a: &Value, b: &Value) -> Ordering {
        for key in &self.sort {
            let path: Vec<&str> = key.path.split('.').collect();
            let ordering = compare_values(resolve(a, &path), resolve(b, &path));
            let ordering = if key.descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering.is_ne() {
                return ordering;
            }
        }
        Ordering::Equal
    }
}
