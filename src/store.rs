use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{ReportError, Result};

/// ストアの1行（キー・値のマップ）
pub type Row = serde_json::Map<String, Value>;

pub const USERS: &str = "users";
pub const ATTENDANCE: &str = "attendance";

/// 述語の比較値
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
    Text(String),
    Timestamp(NaiveDateTime),
}

impl StoreValue {
    /// 行の値とこの値を比較（行の値 ⋚ self）
    fn compare(&self, value: &Value) -> Option<Ordering> {
        match (self, value) {
            (StoreValue::Text(s), Value::String(v)) => Some(v.as_str().cmp(s.as_str())),
            (StoreValue::Timestamp(t), Value::String(v)) => {
                v.parse::<NaiveDateTime>().ok().map(|v| v.cmp(t))
            }
            _ => None,
        }
    }
}

/// クエリ条件（複数指定時はAND）
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// lower <= field <= upper
    Range {
        field: String,
        lower: StoreValue,
        upper: StoreValue,
    },
    /// field == value
    Equals { field: String, value: StoreValue },
}

impl Predicate {
    pub fn range(field: &str, lower: StoreValue, upper: StoreValue) -> Self {
        Predicate::Range { field: field.to_string(), lower, upper }
    }

    pub fn equals(field: &str, value: StoreValue) -> Self {
        Predicate::Equals { field: field.to_string(), value }
    }

    pub fn field(&self) -> &str {
        match self {
            Predicate::Range { field, .. } | Predicate::Equals { field, .. } => field,
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        let Some(value) = row.get(self.field()) else {
            return false;
        };
        match self {
            Predicate::Range { lower, upper, .. } => {
                matches!(lower.compare(value), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(upper.compare(value), Some(Ordering::Less | Ordering::Equal))
            }
            Predicate::Equals { value: expected, .. } => {
                expected.compare(value) == Some(Ordering::Equal)
            }
        }
    }
}

/// レコードストア（外部のドキュメントDB）クライアント
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// 条件に一致する行を取得
    async fn query(&self, collection: &str, predicates: &[Predicate]) -> Result<Vec<Row>>;

    /// コレクションの全行を取得
    async fn get_all(&self, collection: &str) -> Result<Vec<Row>>;
}

/// メモリ上のストア（開発・テスト用）
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    collections: HashMap<String, Vec<Row>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// JSONファイルから読み込む
    /// 形式: { "users": [ {...}, ... ], "attendance": [ {...}, ... ] }
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json_str = std::fs::read_to_string(path)?;
        let collections: HashMap<String, Vec<Row>> = serde_json::from_str(&json_str)
            .map_err(|e| ReportError::Config(format!("{}: {}", path.display(), e)))?;

        for (name, rows) in &collections {
            info!(collection = %name, rows = rows.len(), "loaded collection");
        }

        Ok(Self { collections })
    }

    pub fn with_rows(mut self, collection: &str, rows: Vec<Row>) -> Self {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .extend(rows);
        self
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn query(&self, collection: &str, predicates: &[Predicate]) -> Result<Vec<Row>> {
        let rows: Vec<Row> = self
            .collections
            .get(collection)
            .map(|rows| {
                rows.iter()
                    .filter(|row| predicates.iter().all(|p| p.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        debug!(collection, predicates = predicates.len(), rows = rows.len(), "memory query");
        Ok(rows)
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<Row>> {
        Ok(self.collections.get(collection).cloned().unwrap_or_default())
    }
}
