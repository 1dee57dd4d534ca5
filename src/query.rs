//! # Query Planner
//!
//! A builder that fuses key-prefix/regex filtering, value-field predicates,
//! sort, offset, and limit over a streaming scan of the store.
//!
//! ## Execution Strategy
//!
//! The planner picks one of two paths:
//!
//! - **Push-down**: when the backend is the table variant, a prefix filter is
//!   set, and there is no regex filter and no value predicate, the whole
//!   thing becomes a single ranged SQL query. Key-ordered sort plus
//!   limit/offset ride along when sorting by `key` (or not sorting at all);
//!   sorting by a document field still fetches the prefix range and sorts in
//!   the planner.
//! - **Fused streaming scan**: otherwise, entries stream in key order and
//!   each passes prefix → regex → value predicates. Two scan optimizations
//!   apply: with a sort and a small limit (`limit + offset < 1000`) a
//!   bounded top-k buffer is kept sorted and truncated as it grows; with a
//!   limit and no sort, the scan exits early once enough entries accepted.
//!
//! A prefix filter is REQUIRED for push-down: a key-ordered sort alone does
//! not qualify.
//!
//! ## Result Shape
//!
//! A document object flattens into `{key, …document}`; arrays and primitives
//! wrap as `{key, value}`. Projection (`select`) keeps the named fields plus
//! `key`.

use std::cmp::Ordering;
use std::str::FromStr;

use futures::StreamExt;
use regex::Regex;

use crate::api::ShaleDb;
use crate::codec;
use crate::error::{Error, Result};
use crate::value::Value;

/// Below this many retained rows, sort+limit scans keep a bounded top-k
/// buffer instead of materializing every match.
const TOP_K_THRESHOLD: usize = 1000;

// =============================================================================
// Operators
// =============================================================================

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// A value-field predicate operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// `=` / `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// Substring on the field's string coercion.
    Contains,
    /// Prefix on the field's string coercion.
    StartsWith,
    /// Suffix on the field's string coercion.
    EndsWith,
    /// Membership in an array right-hand side.
    In,
    /// Non-membership in an array right-hand side.
    NotIn,
}

impl FromStr for FilterOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "=" | "==" => Ok(FilterOp::Eq),
            "!=" => Ok(FilterOp::Ne),
            "<" => Ok(FilterOp::Lt),
            "<=" => Ok(FilterOp::Le),
            ">" => Ok(FilterOp::Gt),
            ">=" => Ok(FilterOp::Ge),
            "contains" => Ok(FilterOp::Contains),
            "startsWith" => Ok(FilterOp::StartsWith),
            "endsWith" => Ok(FilterOp::EndsWith),
            "in" => Ok(FilterOp::In),
            "notIn" => Ok(FilterOp::NotIn),
            other => Err(Error::Config(format!("unknown filter operator '{}'", other))),
        }
    }
}

// =============================================================================
// Comparison Semantics
// =============================================================================

/// Orders two values of comparable types. `None` for incomparable pairs
/// (mixed types, NaN).
fn value_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.partial_cmp(y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Date(x), Value::Date(y)) => Some(x.cmp(y)),
        (Value::BigInt(x), Value::BigInt(y)) => bigint_cmp(x, y),
        _ => None,
    }
}

/// Compares canonical decimal strings numerically, without parsing into a
/// bounded integer type.
fn bigint_cmp(a: &str, b: &str) -> Option<Ordering> {
    let a_neg = a.starts_with('-');
    let b_neg = b.starts_with('-');
    match (a_neg, b_neg) {
        (true, false) => return Some(Ordering::Less),
        (false, true) => return Some(Ordering::Greater),
        _ => {}
    }
    let (a_digits, b_digits) = (a.trim_start_matches('-'), b.trim_start_matches('-'));
    let magnitude = a_digits
        .len()
        .cmp(&b_digits.len())
        .then_with(|| a_digits.cmp(b_digits));
    Some(if a_neg { magnitude.reverse() } else { magnitude })
}

/// String coercion used by `contains` / `startsWith` / `endsWith`.
fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::BigInt(digits) => digits.clone(),
        Value::Null => "null".to_string(),
        Value::Undefined => "undefined".to_string(),
        other => codec::encode(other).unwrap_or_default(),
    }
}

/// Evaluates one predicate against a resolved field (`None` = undefined).
fn matches_op(field: Option<&Value>, op: FilterOp, rhs: &Value) -> bool {
    match op {
        FilterOp::Eq => field == Some(rhs),
        FilterOp::Ne => field != Some(rhs),
        FilterOp::Lt => cmp_matches(field, rhs, |o| o == Ordering::Less),
        FilterOp::Le => cmp_matches(field, rhs, |o| o != Ordering::Greater),
        FilterOp::Gt => cmp_matches(field, rhs, |o| o == Ordering::Greater),
        FilterOp::Ge => cmp_matches(field, rhs, |o| o != Ordering::Less),
        FilterOp::Contains => string_matches(field, rhs, |f, r| f.contains(r)),
        FilterOp::StartsWith => string_matches(field, rhs, |f, r| f.starts_with(r)),
        FilterOp::EndsWith => string_matches(field, rhs, |f, r| f.ends_with(r)),
        FilterOp::In => membership(field, rhs),
        FilterOp::NotIn => !membership(field, rhs),
    }
}

fn cmp_matches(field: Option<&Value>, rhs: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    field
        .and_then(|f| value_cmp(f, rhs))
        .is_some_and(accept)
}

fn string_matches(
    field: Option<&Value>,
    rhs: &Value,
    accept: impl Fn(&str, &str) -> bool,
) -> bool {
    let Some(field) = field else { return false };
    accept(&coerce_to_string(field), &coerce_to_string(rhs))
}

fn membership(field: Option<&Value>, rhs: &Value) -> bool {
    let Value::Array(candidates) = rhs else {
        return false;
    };
    let field = field.cloned().unwrap_or(Value::Undefined);
    candidates.contains(&field)
}

// =============================================================================
// Query Builder
// =============================================================================

/// A fluent query over the store. Terminal calls execute it.
pub struct Query<'a> {
    db: &'a ShaleDb,
    prefix: Option<String>,
    key_regex: Option<Regex>,
    filters: Vec<(String, FilterOp, Value)>,
    sort_field: Option<String>,
    sort_order: SortOrder,
    limit: Option<usize>,
    offset: usize,
    select: Option<Vec<String>>,
}

impl<'a> Query<'a> {
    pub(crate) fn new(db: &'a ShaleDb) -> Self {
        Self {
            db,
            prefix: None,
            key_regex: None,
            filters: Vec::new(),
            sort_field: None,
            sort_order: SortOrder::Asc,
            limit: None,
            offset: 0,
            select: None,
        }
    }

    /// Keeps only keys with this prefix. Also enables backend push-down.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Keeps only keys matching this regex.
    pub fn match_keys(mut self, regex: Regex) -> Self {
        self.key_regex = Some(regex);
        self
    }

    /// Adds a value-field predicate on a dotted path like `"profile.age"`.
    pub fn where_field(
        mut self,
        path: impl Into<String>,
        op: FilterOp,
        value: impl Into<Value>,
    ) -> Self {
        self.filters.push((path.into(), op, value.into()));
        self
    }

    /// Sorts by a field (`"key"` sorts by the entry key). Null and undefined
    /// fields sort to the end in either order.
    pub fn sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort_field = Some(field.into());
        self.sort_order = order;
        self
    }

    /// Caps the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips the first `offset` results.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Projects result items down to these fields (plus `key`).
    pub fn select(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.select = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    // =========================================================================
    // Terminals
    // =========================================================================

    /// Executes and returns the shaped result list.
    pub async fn get(self) -> Result<Vec<Value>> {
        let select = self.select.clone();
        let rows = self.collect().await?;
        Ok(rows
            .into_iter()
            .map(|(key, doc)| shape_result(key, doc, select.as_deref()))
            .collect())
    }

    /// Executes the filters only and returns the match count. Sort, limit,
    /// and offset do not affect the count.
    pub async fn count(mut self) -> Result<usize> {
        self.sort_field = None;
        self.limit = None;
        self.offset = 0;
        Ok(self.collect().await?.len())
    }

    /// Executes with limit 1 and returns the first result, if any.
    pub async fn first(mut self) -> Result<Option<Value>> {
        self.limit = Some(1);
        Ok(self.get().await?.into_iter().next())
    }

    /// True when at least one entry matches.
    pub async fn exists(self) -> Result<bool> {
        Ok(self.first().await?.is_some())
    }

    /// Returns the named field of every result, skipping absent ones.
    pub async fn pluck(self, field: &str) -> Result<Vec<Value>> {
        let rows = self.get().await?;
        Ok(rows
            .iter()
            .filter_map(|item| item.get_path(field).cloned())
            .filter(|v| !v.is_undefined())
            .collect())
    }

    // =========================================================================
    // Execution
    // =========================================================================

    fn matches(&self, key: &str, doc: &Value) -> bool {
        if let Some(prefix) = &self.prefix {
            if !key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(regex) = &self.key_regex {
            if !regex.is_match(key) {
                return false;
            }
        }
        self.filters
            .iter()
            .all(|(path, op, rhs)| matches_op(doc.get_path(path), *op, rhs))
    }

    fn sort_rows(&self, rows: &mut [(String, Value)]) {
        let Some(field) = self.sort_field.as_deref() else {
            return;
        };
        let order = self.sort_order;
        rows.sort_by(|(key_a, doc_a), (key_b, doc_b)| {
            let a = sort_key(field, key_a, doc_a);
            let b = sort_key(field, key_b, doc_b);
            compare_for_sort(a, b, order)
        });
    }

    /// Filters, sorts, and pages, returning `(key, document)` rows.
    async fn collect(&self) -> Result<Vec<(String, Value)>> {
        // Push-down: prefix set, no regex, no value predicates, table backend.
        if let (Some(prefix), None, true) =
            (&self.prefix, &self.key_regex, self.filters.is_empty())
        {
            let key_sorted = match self.sort_field.as_deref() {
                None | Some("key") => true,
                Some(_) => false,
            };
            let descending = key_sorted && self.sort_order == SortOrder::Desc;
            let (limit, offset) = if key_sorted {
                (self.limit, self.offset)
            } else {
                (None, 0) // planner sorts, so it needs the full range
            };

            if let Some(mut rows) = self
                .db
                .backend_ref()
                .query_prefix(prefix, descending, limit, offset)
                .await?
            {
                if !key_sorted {
                    self.sort_rows(&mut rows);
                    rows = page(rows, self.offset, self.limit);
                }
                return Ok(rows);
            }
        }

        // Fused streaming scan.
        let retain_bound = self
            .limit
            .map(|limit| limit.saturating_add(self.offset));
        let top_k = self.sort_field.is_some()
            && retain_bound.is_some_and(|bound| bound < TOP_K_THRESHOLD);
        let early_exit = self.sort_field.is_none() && retain_bound.is_some();

        let mut rows: Vec<(String, Value)> = Vec::new();
        let mut stream = self.db.backend_ref().stream_entries().await?;

        while let Some(entry) = stream.next().await {
            let (key, doc) = entry?;
            if !self.matches(&key, &doc) {
                continue;
            }
            rows.push((key, doc));

            if top_k {
                let bound = retain_bound.expect("bound set");
                if rows.len() > bound {
                    self.sort_rows(&mut rows);
                    rows.truncate(bound);
                }
            } else if early_exit && rows.len() >= retain_bound.expect("bound set") {
                break;
            }
        }

        self.sort_rows(&mut rows);
        Ok(page(rows, self.offset, self.limit))
    }
}

/// Resolves the sort key for a row: `"key"` is the entry key itself.
fn sort_key<'v>(field: &str, key: &'v str, doc: &'v Value) -> Option<SortKeyRef<'v>> {
    if field == "key" {
        Some(SortKeyRef::Key(key))
    } else {
        doc.get_path(field).map(SortKeyRef::Field)
    }
}

enum SortKeyRef<'v> {
    Key(&'v str),
    Field(&'v Value),
}

/// Null and undefined sort to the end regardless of direction; comparable
/// pairs follow the requested order; incomparable pairs keep scan order.
fn compare_for_sort(a: Option<SortKeyRef>, b: Option<SortKeyRef>, order: SortOrder) -> Ordering {
    let defined = |k: &Option<SortKeyRef>| match k {
        None => false,
        Some(SortKeyRef::Field(Value::Null | Value::Undefined)) => false,
        Some(_) => true,
    };

    match (defined(&a), defined(&b)) {
        (false, false) => Ordering::Equal,
        (false, true) => Ordering::Greater,
        (true, false) => Ordering::Less,
        (true, true) => {
            let ordering = match (a.expect("defined"), b.expect("defined")) {
                (SortKeyRef::Key(x), SortKeyRef::Key(y)) => x.cmp(y),
                (SortKeyRef::Field(x), SortKeyRef::Field(y)) => {
                    value_cmp(x, y).unwrap_or(Ordering::Equal)
                }
                _ => Ordering::Equal,
            };
            match order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        }
    }
}

fn page(rows: Vec<(String, Value)>, offset: usize, limit: Option<usize>) -> Vec<(String, Value)> {
    let mut iter = rows.into_iter().skip(offset);
    match limit {
        Some(limit) => iter.by_ref().take(limit).collect(),
        None => iter.collect(),
    }
}

/// Builds the result item: `{key, …document}` for objects, `{key, value}`
/// otherwise; projection keeps `key` plus the selected fields.
fn shape_result(key: String, doc: Value, select: Option<&[String]>) -> Value {
    let mut fields: Vec<(String, Value)> = vec![("key".to_string(), Value::String(key))];
    match doc {
        Value::Object(doc_fields) => {
            for (name, value) in doc_fields {
                if name != "key" {
                    fields.push((name, value));
                }
            }
        }
        other => fields.push(("value".to_string(), other)),
    }

    if let Some(select) = select {
        fields.retain(|(name, _)| name == "key" || select.iter().any(|s| s == name));
    }
    Value::Object(fields)
}

// =============================================================================
// Tests
// =============================================================================
