use chrono::NaiveDateTime;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{ReportError, Result};
use crate::store::Row;

/// 退勤打刻がない場合の表示
pub const IN_PROGRESS: &str = "In Progress";

/// 勤怠ステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
}

impl AttendanceStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PRESENT" => Some(Self::Present),
            "LATE" => Some(Self::Late),
            "ABSENT" => Some(Self::Absent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "PRESENT",
            Self::Late => "LATE",
            Self::Absent => "ABSENT",
        }
    }
}

/// 1件分の勤怠記録（attendanceコレクションの1行）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub user_id: String,
    pub date: NaiveDateTime,
    pub in_time: NaiveDateTime,
    #[serde(default)]
    pub out_time: Option<NaiveDateTime>,
    /// 未知の値や欠損は None（集計ではtotalのみに数える）
    #[serde(default, deserialize_with = "lenient_status")]
    pub status: Option<AttendanceStatus>,
    #[serde(default, deserialize_with = "overtime_or_zero")]
    pub overtime: f64,
}

fn lenient_status<'de, D>(deserializer: D) -> std::result::Result<Option<AttendanceStatus>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(Value::as_str)
        .and_then(AttendanceStatus::parse))
}

/// 数値または数値文字列（MySQLのDECIMALは文字列で返る）。欠損・負数は0
fn overtime_or_zero<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let hours = match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => 0.0,
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) if s.trim().is_empty() => 0.0,
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| de::Error::custom(format!("invalid overtime: {:?}", s)))?,
        Some(other) => return Err(de::Error::custom(format!("invalid overtime: {}", other))),
    };
    Ok(if hours > 0.0 { hours } else { 0.0 })
}

/// 文字列または整数のID（MySQLのINT主キーは数値で返る）
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("expected a string or integer id, got {}", other))),
    }
}

impl AttendanceRecord {
    /// ストアの行からレコードへ変換（ストア採番のidを保持）
    pub fn from_row(row: &Row) -> Result<Self> {
        serde_json::from_value(Value::Object(row.clone())).map_err(|e| ReportError::Projection {
            id: row_id(row),
            reason: e.to_string(),
        })
    }

    /// 勤務時間の表示（片方の打刻がなければ "-"）
    pub fn duration_str(&self) -> String {
        match self.out_time {
            Some(out) => calculate_duration(self.in_time, Some(out)),
            None => "-".to_string(),
        }
    }

    /// 残業時間を "1.50h" 形式で取得（0なら "-"）
    pub fn overtime_str(&self) -> String {
        if self.overtime > 0.0 {
            format!("{:.2}h", self.overtime)
        } else {
            "-".to_string()
        }
    }

    pub fn status_str(&self) -> &'static str {
        self.status.map(|s| s.as_str()).unwrap_or("Unknown")
    }
}

/// 従業員情報（usersコレクションの1行）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserData {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub email: String,
}

impl UserData {
    pub fn from_row(row: &Row) -> Result<Self> {
        serde_json::from_value(Value::Object(row.clone())).map_err(|e| ReportError::Projection {
            id: row_id(row),
            reason: e.to_string(),
        })
    }

    /// 表示名（名前が空ならメールアドレス）
    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.email,
        }
    }
}

fn row_id(row: &Row) -> String {
    match row.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "<no id>".to_string(),
    }
}

/// 集計データ
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SummaryStats {
    pub total: usize,
    pub present: usize,
    pub late: usize,
    pub absent: usize,
}

impl SummaryStats {
    /// レコード一覧からステータス別件数を計算
    pub fn from_records(records: &[AttendanceRecord]) -> Self {
        let mut stats = SummaryStats {
            total: records.len(),
            ..Default::default()
        };

        for record in records {
            match record.status {
                Some(AttendanceStatus::Present) => stats.present += 1,
                Some(AttendanceStatus::Late) => stats.late += 1,
                Some(AttendanceStatus::Absent) => stats.absent += 1,
                None => {}
            }
        }

        stats
    }
}

/// 出勤〜退勤の経過時間を "8h 30m" 形式で取得
///
/// 退勤がなければ "In Progress"。退勤が出勤より前のデータは0分として扱う。
pub fn calculate_duration(start: NaiveDateTime, end: Option<NaiveDateTime>) -> String {
    let Some(end) = end else {
        return IN_PROGRESS.to_string();
    };

    let mut minutes = end.signed_duration_since(start).num_minutes();
    if minutes < 0 {
        warn!(%start, %end, "check-out precedes check-in, clamping duration to zero");
        minutes = 0;
    }

    format!("{}h {}m", minutes / 60, minutes % 60)
}
