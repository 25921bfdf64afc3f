//! Pagination strategies: how a stream turns its last position into the
//! next request and when it stops asking.

use crate::model::{Bookmark, Record};
use extractor_core::{Error, Result};
use serde_json::{json, Value};

/// Rows requested per page (`first: 1000` in every query).
pub const PAGE_SIZE: usize = 1000;

/// Lowest possible key; every `0x…` id sorts after it.
pub const KEY_SENTINEL: &str = "0x";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    /// High-water mark over `replication_key`. The query must order results
    /// ascending by that key and filter with an inclusive `_gte`.
    Timestamp { replication_key: &'static str },
    /// Fixed-size offset walk; not persisted between runs.
    Offset,
    /// Strictly increasing key walk (`_gt`) starting from [`KEY_SENTINEL`]
    /// on every run.
    Key { key_field: &'static str },
}

/// Value bound to the query's single pagination variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorParam {
    Timestamp(Option<i64>),
    Offset(u64),
    Key(String),
}

impl CursorParam {
    pub fn variables(&self) -> Value {
        match self {
            // `$timestamp: Int!` cannot be null; no start position means everything.
            CursorParam::Timestamp(ts) => json!({ "timestamp": ts.unwrap_or(0) }),
            CursorParam::Offset(offset) => json!({ "offset": offset }),
            CursorParam::Key(key) => json!({ "key": key }),
        }
    }
}

impl std::fmt::Display for CursorParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CursorParam::Timestamp(Some(ts)) => write!(f, "timestamp={ts}"),
            CursorParam::Timestamp(None) => write!(f, "timestamp=<start>"),
            CursorParam::Offset(offset) => write!(f, "offset={offset}"),
            CursorParam::Key(key) => write!(f, "key={key}"),
        }
    }
}

/// What the cursor needs to know about a page once its records are
/// transformed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSummary {
    pub count: usize,
    pub max_replication_value: Option<i64>,
    pub last_key: Option<String>,
}

impl Pagination {
    pub fn replication_key(&self) -> Option<&'static str> {
        match self {
            Pagination::Timestamp { replication_key } => Some(*replication_key),
            _ => None,
        }
    }

    pub fn is_incremental(&self) -> bool {
        self.replication_key().is_some()
    }

    pub fn initial_param(&self, bookmark: Option<&Bookmark>, start_default: Option<i64>) -> CursorParam {
        match self {
            Pagination::Timestamp { replication_key } => {
                let persisted = bookmark
                    .filter(|b| b.replication_key == *replication_key)
                    .map(|b| b.replication_key_value);
                CursorParam::Timestamp(persisted.or(start_default))
            }
            Pagination::Offset => CursorParam::Offset(0),
            Pagination::Key { .. } => CursorParam::Key(KEY_SENTINEL.to_string()),
        }
    }

    /// Fold one transformed record into the page summary.
    pub fn observe(&self, summary: &mut PageSummary, record: &Record) -> Result<()> {
        summary.count += 1;

        match self {
            Pagination::Timestamp { replication_key } => {
                let value = replication_value(record, replication_key)?;
                summary.max_replication_value = Some(
                    summary
                        .max_replication_value
                        .map_or(value, |current| current.max(value)),
                );
            }
            Pagination::Offset => {}
            Pagination::Key { key_field } => {
                let key = record
                    .get(*key_field)
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        Error::Validation(format!("record is missing string key field `{key_field}`"))
                    })?;
                summary.last_key = Some(key.to_string());
            }
        }

        Ok(())
    }

    /// Next pagination value, or `None` once the walk is exhausted.
    pub fn next_param(&self, previous: &CursorParam, page: &PageSummary) -> Result<Option<CursorParam>> {
        let next = match (self, previous) {
            (Pagination::Timestamp { .. }, CursorParam::Timestamp(prev)) => {
                if page.count == 0 {
                    return Ok(None);
                }
                let latest = match (*prev, page.max_replication_value) {
                    (Some(prev), Some(max)) => prev.max(max),
                    (prev, max) => match prev.or(max) {
                        Some(value) => value,
                        None => return Ok(None),
                    },
                };
                // No forward progress: the endpoint keeps serving the same tail.
                if Some(latest) == *prev {
                    None
                } else {
                    Some(CursorParam::Timestamp(Some(latest)))
                }
            }
            (Pagination::Offset, CursorParam::Offset(prev)) => {
                if page.count == 0 || page.count < PAGE_SIZE {
                    None
                } else {
                    Some(CursorParam::Offset(prev + PAGE_SIZE as u64))
                }
            }
            (Pagination::Key { .. }, CursorParam::Key(prev)) => match &page.last_key {
                Some(last) if last.as_str() > prev.as_str() => Some(CursorParam::Key(last.clone())),
                _ => None,
            },
            (pagination, param) => {
                return Err(Error::Internal(format!(
                    "cursor {param} does not belong to {pagination:?} pagination"
                )))
            }
        };

        Ok(next)
    }
}

/// Replication values arrive as JSON numbers or numeric strings (subgraph
/// `BigInt`).
pub fn replication_value(record: &Record, key: &str) -> Result<i64> {
    let value = record
        .get(key)
        .ok_or_else(|| Error::Validation(format!("record is missing replication key `{key}`")))?;

    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| Error::Validation(format!("replication key `{key}` is not an integer: {value}")))
}
