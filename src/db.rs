use async_trait::async_trait;
use mysql::prelude::*;
use mysql::{Opts, Params, Pool};
use serde_json::{Number, Value};
use std::env;
use tracing::debug;

use crate::error::{ReportError, Result};
use crate::store::{Predicate, RecordStore, Row, StoreValue, ATTENDANCE, USERS};

/// データベース接続設定
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl DbConfig {
    /// 環境変数から設定を読み込み（プレフィックス付き）
    /// 例: STORE_DB_HOST, STORE_DB_PORT
    pub fn from_env_with_prefix(prefix: &str) -> Self {
        Self {
            host: env::var(format!("{}_DB_HOST", prefix)).unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var(format!("{}_DB_PORT", prefix))
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3306),
            user: env::var(format!("{}_DB_USER", prefix)).unwrap_or_else(|_| "root".to_string()),
            password: env::var(format!("{}_DB_PASSWORD", prefix)).unwrap_or_default(),
            database: env::var(format!("{}_DB_NAME", prefix)).unwrap_or_else(|_| "attendance".to_string()),
        }
    }

    /// 接続URLを生成
    fn connection_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

/// コレクション名 → (テーブル名, 参照可能なカラム)
/// カラム名はドキュメントのフィールド名と同じ。想定するテーブル:
///
/// ```sql
/// CREATE TABLE users (
///     id      INT PRIMARY KEY,          -- VARCHARでも可
///     name    VARCHAR(255) NULL,
///     email   VARCHAR(255) NOT NULL
/// );
/// CREATE TABLE attendance (
///     id       INT PRIMARY KEY,         -- VARCHARでも可
///     userId   INT NOT NULL,            -- users.id と同じ型
///     date     DATETIME(3) NOT NULL,    -- その日の 00:00:00
///     inTime   DATETIME(3) NOT NULL,
///     outTime  DATETIME(3) NULL,
///     status   VARCHAR(16) NULL,        -- PRESENT / LATE / ABSENT
///     overtime DECIMAL(5,2) NULL,       -- 時間単位
///     INDEX (date), INDEX (userId, date)
/// );
/// ```
fn table_for(collection: &str) -> Result<(&'static str, &'static [&'static str])> {
    match collection {
        USERS => Ok(("users", &["id", "name", "email"])),
        ATTENDANCE => Ok((
            "attendance",
            &["id", "userId", "date", "inTime", "outTime", "status", "overtime"],
        )),
        other => Err(ReportError::Store(format!("unknown collection: {}", other))),
    }
}

/// MySQLをバックエンドにしたレコードストア
#[derive(Clone)]
pub struct MySqlStore {
    pool: Pool,
}

impl MySqlStore {
    /// データベースに接続
    pub fn connect(config: &DbConfig) -> Result<Self> {
        let opts = Opts::from_url(&config.connection_url())
            .map_err(|e| ReportError::Config(e.to_string()))?;
        let pool = Pool::new(opts)?;
        Ok(Self { pool })
    }

    fn run_select(pool: &Pool, collection: &str, predicates: &[Predicate]) -> Result<Vec<Row>> {
        let (sql, params) = build_select(collection, predicates)?;
        debug!(%sql, "mysql query");

        let mut conn = pool.get_conn()?;
        let rows: Vec<mysql::Row> = conn.exec(sql, params)?;

        Ok(rows.into_iter().map(row_to_json).collect())
    }

    async fn select(&self, collection: &str, predicates: &[Predicate]) -> Result<Vec<Row>> {
        let pool = self.pool.clone();
        let collection = collection.to_string();
        let predicates = predicates.to_vec();

        // mysqlクレートは同期APIなのでブロッキングスレッドで実行
        tokio::task::spawn_blocking(move || Self::run_select(&pool, &collection, &predicates))
            .await
            .map_err(|e| ReportError::Store(e.to_string()))?
    }
}

#[async_trait]
impl RecordStore for MySqlStore {
    async fn query(&self, collection: &str, predicates: &[Predicate]) -> Result<Vec<Row>> {
        self.select(collection, predicates).await
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<Row>> {
        self.select(collection, &[]).await
    }
}

/// 述語からSELECT文とパラメータを組み立てる
fn build_select(collection: &str, predicates: &[Predicate]) -> Result<(String, Params)> {
    let (table, columns) = table_for(collection)?;

    let column_list = columns
        .iter()
        .map(|c| format!("`{}`", c))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!("SELECT {} FROM `{}`", column_list, table);

    let mut clauses = Vec::new();
    let mut params: Vec<mysql::Value> = Vec::new();

    for predicate in predicates {
        let field = predicate.field();
        // 識別子はホワイトリストでのみ受け付ける
        if !columns.contains(&field) {
            return Err(ReportError::Store(format!(
                "unknown field {} in collection {}",
                field, collection
            )));
        }

        match predicate {
            Predicate::Range { lower, upper, .. } => {
                clauses.push(format!("`{}` BETWEEN ? AND ?", field));
                params.push(to_sql_value(lower));
                params.push(to_sql_value(upper));
            }
            Predicate::Equals { value, .. } => {
                clauses.push(format!("`{}` = ?", field));
                params.push(to_sql_value(value));
            }
        }
    }

    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    let params = if params.is_empty() {
        Params::Empty
    } else {
        Params::Positional(params)
    };

    Ok((sql, params))
}

fn to_sql_value(value: &StoreValue) -> mysql::Value {
    match value {
        StoreValue::Text(s) => mysql::Value::Bytes(s.as_bytes().to_vec()),
        StoreValue::Timestamp(t) => {
            mysql::Value::Bytes(t.format("%Y-%m-%d %H:%M:%S%.3f").to_string().into_bytes())
        }
    }
}

/// mysql::Row → JSONの行に変換（日時は "YYYY-MM-DDTHH:MM:SS.ffffff"）
fn row_to_json(row: mysql::Row) -> Row {
    let columns = row.columns();
    let values = row.unwrap();

    columns
        .iter()
        .zip(values)
        .map(|(col, value)| (col.name_str().to_string(), sql_to_json(value)))
        .collect()
}

fn sql_to_json(value: mysql::Value) -> Value {
    match value {
        mysql::Value::NULL => Value::Null,
        mysql::Value::Bytes(bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        mysql::Value::Int(i) => Value::Number(i.into()),
        mysql::Value::UInt(u) => Value::Number(u.into()),
        mysql::Value::Float(f) => Number::from_f64(f as f64).map(Value::Number).unwrap_or(Value::Null),
        mysql::Value::Double(d) => Number::from_f64(d).map(Value::Number).unwrap_or(Value::Null),
        mysql::Value::Date(y, mo, d, h, mi, s, us) => Value::String(format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}",
            y, mo, d, h, mi, s, us
        )),
        mysql::Value::Time(neg, days, h, mi, s, us) => Value::String(format!(
            "{}{}:{:02}:{:02}.{:06}",
            if neg { "-" } else { "" },
            days * 24 + h as u32,
            mi,
            s,
            us
        )),
    }
}
