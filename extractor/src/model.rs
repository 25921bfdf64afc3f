use bigdecimal::BigDecimal;
use extractor_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// One decoded row: field name to JSON value.
pub type Record = Map<String, Value>;

/// Records returned by a single paginated request, in server order.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<Record>,
}

impl Page {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub replication_key: String,
    pub replication_key_value: i64,
}

/// Resumption state, in the Singer `{"bookmarks": {...}}` layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapState {
    #[serde(default)]
    pub bookmarks: BTreeMap<String, Bookmark>,
}

impl TapState {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn bookmark(&self, stream: &str) -> Option<&Bookmark> {
        self.bookmarks.get(stream)
    }

    /// Record a new watermark for `stream`. A value behind the stored one is
    /// rejected so persisted progress never moves backwards.
    pub fn advance(&mut self, stream: &str, bookmark: Bookmark) -> Result<()> {
        if let Some(current) = self.bookmarks.get(stream) {
            if current.replication_key == bookmark.replication_key
                && bookmark.replication_key_value < current.replication_key_value
            {
                return Err(Error::Internal(format!(
                    "bookmark for {stream} would move backwards: {} -> {}",
                    current.replication_key_value, bookmark.replication_key_value
                )));
            }
        }
        self.bookmarks.insert(stream.to_string(), bookmark);
        Ok(())
    }
}

/// Payment found in a transaction's receipt logs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Revenue {
    pub amount: BigDecimal,
    pub token_address: Option<String>,
}

impl Revenue {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.amount == BigDecimal::default() && self.token_address.is_none()
    }

    /// Amount as a plain decimal string without exponent or trailing zeros.
    pub fn amount_string(&self) -> String {
        self.amount.normalized().to_plain_string()
    }
}
