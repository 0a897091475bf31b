//! Fetch filters and the small WHERE-clause builder the accessors share.

use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

/// Field name → expected value. Keys an accessor does not recognize are
/// ignored.
pub type Filter = serde_json::Map<String, Value>;

/// Read a string-valued filter key.
pub(crate) fn string(filter: Option<&Filter>, key: &str) -> StoreResult<Option<String>> {
    match filter.and_then(|f| f.get(key)) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(StoreError::InvalidFilter(format!(
            "{key} must be a string, got {other}"
        ))),
    }
}

/// Read an array-of-strings filter key.
pub(crate) fn strings(filter: Option<&Filter>, key: &str) -> StoreResult<Option<Vec<String>>> {
    match filter.and_then(|f| f.get(key)) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(StoreError::InvalidFilter(format!(
                    "{key} must contain strings, got {other}"
                ))),
            })
            .collect::<StoreResult<Vec<_>>>()
            .map(Some),
        Some(other) => Err(StoreError::InvalidFilter(format!(
            "{key} must be an array of strings, got {other}"
        ))),
    }
}

/// Optional `limit` / `offset`, applied after ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Page {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Page {
    pub fn from_filter(filter: Option<&Filter>) -> StoreResult<Self> {
        Ok(Self {
            limit: count(filter, "limit")?,
            offset: count(filter, "offset")?,
        })
    }

    /// `LIMIT`/`OFFSET` suffix; SQLite needs a LIMIT for OFFSET, and -1
    /// means unbounded.
    fn sql(&self) -> String {
        match (self.limit, self.offset) {
            (None, None) => String::new(),
            (limit, offset) => format!(
                " LIMIT {} OFFSET {}",
                limit.unwrap_or(-1),
                offset.unwrap_or(0)
            ),
        }
    }
}

fn count(filter: Option<&Filter>, key: &str) -> StoreResult<Option<i64>> {
    match filter.and_then(|f| f.get(key)) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(v) if v >= 0 => Ok(Some(v)),
            _ => Err(StoreError::InvalidFilter(format!(
                "{key} must be a non-negative integer, got {n}"
            ))),
        },
        Some(other) => Err(StoreError::InvalidFilter(format!(
            "{key} must be a number, got {other}"
        ))),
    }
}

/// Accumulates WHERE conditions with positional parameters.
#[derive(Debug, Default)]
pub(crate) struct Query {
    conditions: Vec<String>,
    params: Vec<SqlValue>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// `column = ?`
    pub fn eq(&mut self, column: &str, value: impl Into<String>) -> &mut Self {
        self.params.push(SqlValue::Text(value.into()));
        self.conditions
            .push(format!("{column} = ?{}", self.params.len()));
        self
    }

    /// `column IN (?, ?, ...)`. An empty set matches nothing.
    pub fn one_of(&mut self, column: &str, values: Vec<String>) -> &mut Self {
        if values.is_empty() {
            self.conditions.push("0".to_string());
            return self;
        }
        let mut slots = Vec::with_capacity(values.len());
        for value in values {
            self.params.push(SqlValue::Text(value));
            slots.push(format!("?{}", self.params.len()));
        }
        self.conditions
            .push(format!("{column} IN ({})", slots.join(", ")));
        self
    }

    /// A raw condition with one `{}` placeholder for a single parameter.
    pub fn raw(&mut self, template: &str, value: impl Into<String>) -> &mut Self {
        self.params.push(SqlValue::Text(value.into()));
        let slot = format!("?{}", self.params.len());
        self.conditions.push(template.replace("{}", &slot));
        self
    }

    /// Assemble `base` + WHERE + `order` + paging.
    pub fn build(&self, base: &str, order: &str, page: Page) -> String {
        let mut sql = base.to_string();
        if !self.conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(order);
        sql.push_str(&page.sql());
        sql
    }

    pub fn params(&self) -> rusqlite::ParamsFromIter<std::slice::Iter<'_, SqlValue>> {
        rusqlite::params_from_iter(self.params.iter())
    }
}
