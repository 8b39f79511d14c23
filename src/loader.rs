use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::attendance::{AttendanceRecord, SummaryStats, UserData};
use crate::busy::InFlight;
use crate::error::Result;
use crate::store::{Predicate, RecordStore, StoreValue, ATTENDANCE, USERS};

/// 全従業員を表すセンチネル値
pub const ALL_USERS: &str = "all";

/// 取得失敗時に画面へ出すメッセージ
pub const FETCH_ERROR_MESSAGE: &str = "Error fetching records. Please try again.";

/// 従業員の選択状態
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserSelection {
    All,
    User(String),
}

impl UserSelection {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw == ALL_USERS {
            UserSelection::All
        } else {
            UserSelection::User(raw.to_string())
        }
    }

    /// クエリ文字列用の値
    pub fn as_param(&self) -> &str {
        match self {
            UserSelection::All => ALL_USERS,
            UserSelection::User(id) => id,
        }
    }
}

impl Serialize for UserSelection {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_param())
    }
}

/// 絞り込み条件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportFilter {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub selected_user: UserSelection,
}

impl ReportFilter {
    /// 初期表示（今日1日分・全従業員）
    pub fn for_day(day: NaiveDate) -> Self {
        Self {
            start_date: day,
            end_date: day,
            selected_user: UserSelection::All,
        }
    }

    /// 開始日の 00:00:00.000 〜 終了日の 23:59:59.999（両端含む）
    pub fn date_bounds(&self) -> (NaiveDateTime, NaiveDateTime) {
        let end_of_day = NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or_default();
        (
            self.start_date.and_time(NaiveTime::default()),
            self.end_date.and_time(end_of_day),
        )
    }
}

/// 絞り込み条件からストアへのクエリ条件を組み立てる
pub fn build_query(filter: &ReportFilter) -> Vec<Predicate> {
    let (start, end) = filter.date_bounds();
    let mut predicates = Vec::with_capacity(2);

    if let UserSelection::User(id) = &filter.selected_user {
        predicates.push(Predicate::equals("userId", StoreValue::Text(id.clone())));
    }
    predicates.push(Predicate::range(
        "date",
        StoreValue::Timestamp(start),
        StoreValue::Timestamp(end),
    ));

    predicates
}

/// 日付の新しい順に並べる（同日は元の順序を保持）
pub fn sort_by_date_desc(records: &mut [AttendanceRecord]) {
    records.sort_by(|a, b| b.date.cmp(&a.date));
}

/// refresh の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Applied,
    /// より新しいリクエストの結果が既に反映されているため破棄
    Superseded,
}

/// 画面に出す現在の状態
#[derive(Debug, Clone, Serialize)]
pub struct ReportSnapshot {
    pub filter: Option<ReportFilter>,
    pub records: Vec<AttendanceRecord>,
    pub summary: SummaryStats,
    pub loading: bool,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct LoaderState {
    filter: Option<ReportFilter>,
    records: Vec<AttendanceRecord>,
    summary: SummaryStats,
    applied_generation: u64,
    error: Option<String>,
    users: Option<Vec<UserData>>,
    user_names: HashMap<String, String>,
}

/// 勤怠レコードの読み込みと集計
pub struct ReportLoader {
    store: Arc<dyn RecordStore>,
    state: Mutex<LoaderState>,
    generation: AtomicU64,
    loading: InFlight,
}

impl ReportLoader {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            state: Mutex::new(LoaderState::default()),
            generation: AtomicU64::new(0),
            loading: InFlight::default(),
        }
    }

    /// 従業員一覧を読み込む（成功済みなら何もしない）
    ///
    /// 失敗してもログのみ。レコード取得は妨げない。
    pub async fn load_users(&self) {
        if self.state.lock().await.users.is_some() {
            return;
        }

        let rows = match self.store.get_all(USERS).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "failed to fetch users");
                return;
            }
        };

        let users: Vec<UserData> = rows
            .iter()
            .filter_map(|row| match UserData::from_row(row) {
                Ok(user) => Some(user),
                Err(e) => {
                    warn!(error = %e, "skipping user row");
                    None
                }
            })
            .collect();

        let user_names = users
            .iter()
            .map(|u| (u.id.clone(), u.display_name().to_string()))
            .collect();

        info!(users = users.len(), "loaded users");

        let mut state = self.state.lock().await;
        state.users = Some(users);
        state.user_names = user_names;
    }

    /// 条件に合うレコードを取得して並べ替え、集計する（画面の状態は変えない）
    pub async fn fetch(&self, filter: &ReportFilter) -> Result<(Vec<AttendanceRecord>, SummaryStats)> {
        let predicates = build_query(filter);
        let rows = self.store.query(ATTENDANCE, &predicates).await?;

        let mut records: Vec<AttendanceRecord> = rows
            .iter()
            .filter_map(|row| match AttendanceRecord::from_row(row) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "skipping attendance row");
                    None
                }
            })
            .collect();
        sort_by_date_desc(&mut records);
        let summary = SummaryStats::from_records(&records);

        Ok((records, summary))
    }

    /// 条件に合うレコードを取得し、画面の状態に反映する
    ///
    /// 失敗時は前回のレコードを残したままエラーを返す。
    /// 失敗したリクエストも世代を進めるので、それより古い応答は後から届いても破棄される。
    pub async fn refresh(&self, filter: &ReportFilter) -> Result<RefreshOutcome> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let _loading = self.loading.enter();

        let fetched = self.fetch(filter).await;
        if let Err(e) = &fetched {
            error!(error = %e, generation, "failed to fetch attendance records");
        }

        let mut state = self.state.lock().await;
        if generation < state.applied_generation {
            debug!(generation, applied = state.applied_generation, "discarding stale response");
            return fetched.map(|_| RefreshOutcome::Superseded);
        }
        state.applied_generation = generation;

        let (records, summary) = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                state.error = Some(FETCH_ERROR_MESSAGE.to_string());
                return Err(e);
            }
        };

        debug!(generation, records = records.len(), "applied attendance records");
        state.filter = Some(filter.clone());
        state.records = records;
        state.summary = summary;
        state.error = None;

        Ok(RefreshOutcome::Applied)
    }

    pub fn is_loading(&self) -> bool {
        self.loading.is_active()
    }

    pub async fn snapshot(&self) -> ReportSnapshot {
        let state = self.state.lock().await;
        ReportSnapshot {
            filter: state.filter.clone(),
            records: state.records.clone(),
            summary: state.summary,
            loading: self.is_loading(),
            error: state.error.clone(),
        }
    }

    pub async fn users(&self) -> Vec<UserData> {
        self.state.lock().await.users.clone().unwrap_or_default()
    }

    /// ユーザーID → 表示名
    pub async fn user_names(&self) -> HashMap<String, String> {
        self.state.lock().await.user_names.clone()
    }
}
