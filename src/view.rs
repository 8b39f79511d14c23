use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::attendance::{AttendanceRecord, AttendanceStatus, UserData};
use crate::config::Branding;
use crate::error::Result;
use crate::export::{EngineSlot, ExportContext, ExportOutcome, Exporter, ALL_EMPLOYEES};
use crate::html::escape;
use crate::loader::{ReportFilter, ReportLoader, ReportSnapshot, UserSelection, ALL_USERS};
use crate::navigation::{NavigationShell, PERMISSION_DENIED};
use crate::store::RecordStore;

/// セッションごとの画面状態（ナビゲーション＋レポート）
pub struct SessionView {
    pub shell: NavigationShell,
    pub report: ReportView,
}

impl SessionView {
    pub fn new(store: Arc<dyn RecordStore>, engine: Arc<EngineSlot>) -> Self {
        Self {
            shell: NavigationShell::new(),
            report: ReportView::new(store, engine),
        }
    }
}

/// レポート画面
pub struct ReportView {
    pub loader: ReportLoader,
    pub exporter: Exporter,
}

impl ReportView {
    pub fn new(store: Arc<dyn RecordStore>, engine: Arc<EngineSlot>) -> Self {
        Self {
            loader: ReportLoader::new(store),
            exporter: Exporter::new(engine),
        }
    }

    /// 表示：従業員一覧（初回のみ）とレコードを読み込む
    ///
    /// 取得失敗はスナップショットの error に載る。
    pub async fn show(&self, filter: &ReportFilter) -> ReportSnapshot {
        self.loader.load_users().await;
        // 失敗時はログとerror欄のみ、前回の表示を残す
        let _ = self.loader.refresh(filter).await;
        self.loader.snapshot().await
    }

    /// 指定条件のPDFを作る
    ///
    /// 枠は読み込みから描画まで保持する。表示中の条件と同じなら表示中のレコードを使い、
    /// 違えば画面の状態を変えずに自分で取得したレコードを使う。
    pub async fn export(
        &self,
        filter: &ReportFilter,
        branding: &Branding,
        now: NaiveDateTime,
    ) -> Result<ExportOutcome> {
        let Some(guard) = self.exporter.try_begin() else {
            info!("export already in progress, ignoring request");
            return Ok(ExportOutcome::Ignored);
        };
        self.exporter.ensure_ready()?;

        self.loader.load_users().await;
        let snapshot = self.loader.snapshot().await;
        let (records, summary) = if snapshot.filter.as_ref() == Some(filter) {
            (snapshot.records, snapshot.summary)
        } else {
            self.loader.fetch(filter).await?
        };
        let user_names = self.loader.user_names().await;

        let file = self
            .exporter
            .render(
                &guard,
                ExportContext {
                    records: &records,
                    summary,
                    filter,
                    user_names: &user_names,
                    branding,
                    now,
                },
            )
            .await?;
        Ok(ExportOutcome::Exported(file))
    }
}

/// 権限がない場合の本文
pub fn render_denied() -> String {
    format!(r#"<div class="denied">{}</div>"#, PERMISSION_DENIED)
}

fn status_class(status: Option<AttendanceStatus>) -> &'static str {
    match status {
        Some(AttendanceStatus::Present) => "status-present",
        Some(AttendanceStatus::Late) => "status-late",
        _ => "status-absent",
    }
}

fn render_record_row(index: usize, record: &AttendanceRecord, user_names: &HashMap<String, String>) -> String {
    let employee = user_names
        .get(&record.user_id)
        .map(String::as_str)
        .unwrap_or(&record.user_id);
    let check_out = record
        .out_time
        .map(|t| t.format("%I:%M %p").to_string())
        .unwrap_or_else(|| "Not marked".to_string());
    let duration = match (record.out_time, record.status) {
        (Some(_), _) => record.duration_str(),
        (None, Some(AttendanceStatus::Absent)) => "Absent".to_string(),
        (None, _) => "-".to_string(),
    };

    format!(
        r#"<tr class="{}"><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td class="{}">{}</td><td>{}</td><td>{}</td></tr>"#,
        if index % 2 == 0 { "even" } else { "odd" },
        record.date.format("%B %-d, %Y"),
        escape(employee),
        record.in_time.format("%I:%M %p"),
        check_out,
        status_class(record.status),
        record.status.map(|s| s.as_str()).unwrap_or(""),
        duration,
        record.overtime_str(),
    )
}

/// レポート画面の本文
pub fn render_report(
    snapshot: &ReportSnapshot,
    filter: &ReportFilter,
    users: &[UserData],
    user_names: &HashMap<String, String>,
    exporting: bool,
) -> String {
    let mut body = String::from(r#"<h2>Attendance Reports</h2>"#);

    if let Some(error) = &snapshot.error {
        body.push_str(&format!(r#"<div class="alert" role="alert">{}</div>"#, escape(error)));
    }

    let s = &snapshot.summary;
    body.push_str(&format!(
        r#"<div class="cards"><div class="card"><h3>Total Records</h3><p>{}</p></div><div class="card"><h3>Present</h3><p>{}</p></div><div class="card"><h3>Late</h3><p>{}</p></div><div class="card"><h3>Absent</h3><p>{}</p></div></div>"#,
        s.total, s.present, s.late, s.absent
    ));

    // 絞り込みフォーム
    let mut options = format!(
        r#"<option value="{}"{}>{}</option>"#,
        ALL_USERS,
        if filter.selected_user == UserSelection::All { " selected" } else { "" },
        ALL_EMPLOYEES
    );
    for user in users {
        let selected = filter.selected_user == UserSelection::User(user.id.clone());
        options.push_str(&format!(
            r#"<option value="{}"{}>{}</option>"#,
            escape(&user.id),
            if selected { " selected" } else { "" },
            escape(user.display_name())
        ));
    }

    let query = format!(
        "start={}&end={}&user={}",
        filter.start_date,
        filter.end_date,
        escape(filter.selected_user.as_param())
    );
    let download = if exporting {
        r#"<span>Generating PDF...</span>"#.to_string()
    } else {
        format!(r#"<a href="/api/reports/export?{}">Download Report</a>"#, query)
    };

    body.push_str(&format!(
        r#"<form class="card" method="get" action="/dashboard/reports"><label for="employee">Employee</label> <select id="employee" name="user">{}</select> <label for="start-date">Start Date</label> <input id="start-date" type="date" name="start" value="{}"> <label for="end-date">End Date</label> <input id="end-date" type="date" name="end" value="{}"> <button type="submit">Apply</button> {}</form>"#,
        options, filter.start_date, filter.end_date, download
    ));

    body.push_str(
        "<table><thead><tr><th>Date</th><th>Employee</th><th>Check-in</th><th>Check-out</th><th>Status</th><th>Duration</th><th>Overtime</th></tr></thead><tbody>",
    );
    if snapshot.records.is_empty() {
        body.push_str(r#"<tr><td colspan="7">No attendance records found for the selected criteria</td></tr>"#);
    } else {
        for (index, record) in snapshot.records.iter().enumerate() {
            body.push_str(&render_record_row(index, record, user_names));
        }
    }
    body.push_str("</tbody></table>");

    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::SummaryStats;
    use crate::export::{ExportEngine, ExportOptions, ReportDocument};
    use crate::store::{MemoryStore, Predicate, Row, StoreValue, ATTENDANCE, USERS};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("row must be an object"),
        }
    }

    fn store() -> Arc<dyn RecordStore> {
        Arc::new(
            MemoryStore::new()
                .with_rows(
                    ATTENDANCE,
                    vec![
                        row(json!({
                            "id": "a", "userId": "u1",
                            "date": "2024-01-02T00:00:00",
                            "inTime": "2024-01-02T09:00:00",
                            "outTime": "2024-01-02T17:30:00",
                            "status": "PRESENT", "overtime": 0.5
                        })),
                        row(json!({
                            "id": "b", "userId": "u2",
                            "date": "2024-01-03T00:00:00",
                            "inTime": "2024-01-03T09:00:00",
                            "status": "ABSENT"
                        })),
                    ],
                )
                .with_rows(
                    USERS,
                    vec![row(json!({ "id": "u1", "name": "Jane <Doe>", "email": "jane@example.com" }))],
                ),
        )
    }

    fn filter() -> ReportFilter {
        ReportFilter {
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 1, 7).unwrap(),
            selected_user: UserSelection::All,
        }
    }

    #[tokio::test]
    async fn test_render_report_page() {
        let view = ReportView::new(store(), Arc::new(EngineSlot::new()));
        let snapshot = view.show(&filter()).await;
        let users = view.loader.users().await;
        let names = view.loader.user_names().await;
        let html = render_report(&snapshot, &filter(), &users, &names, false);

        assert!(html.contains("<td>January 3, 2024</td>"));
        assert!(html.contains("Jane &lt;Doe&gt;"));
        assert!(html.contains("<td>u2</td>"));
        assert!(html.contains("Not marked"));
        assert!(html.contains("<td>Absent</td>"));
        assert!(html.contains("<td>8h 30m</td>"));
        assert!(html.contains("<td>0.50h</td>"));
        assert!(html.contains("start=2024-01-01&end=2024-01-07&user=all"));
        assert!(!html.contains("alert"));
    }

    #[test]
    fn test_render_empty_and_error() {
        let snapshot = ReportSnapshot {
            filter: None,
            records: vec![],
            summary: SummaryStats::default(),
            loading: false,
            error: Some("Error fetching records. Please try again.".to_string()),
        };
        let html = render_report(&snapshot, &filter(), &[], &HashMap::new(), true);
        assert!(html.contains("No attendance records found for the selected criteria"));
        assert!(html.contains(r#"role="alert">Error fetching records. Please try again.</div>"#));
        assert!(html.contains("Generating PDF..."));
    }

    #[tokio::test]
    async fn test_export_without_engine_is_not_ready() {
        let view = ReportView::new(store(), Arc::new(EngineSlot::new()));
        let now = NaiveDate::from_ymd_opt(2024, 1, 8).unwrap().and_hms_opt(9, 0, 0).unwrap();
        let result = view.export(&filter(), &Branding::default(), now).await;
        assert!(matches!(result, Err(crate::error::ReportError::EngineNotReady)));
        assert!(!view.exporter.is_busy());
        assert_eq!(view.loader.snapshot().await.filter, None);
    }

    /// userId == "u1" のクエリを解放されるまで止めるストア
    struct GatedStore {
        inner: MemoryStore,
        queries: AtomicUsize,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl RecordStore for GatedStore {
        async fn query(&self, collection: &str, predicates: &[Predicate]) -> Result<Vec<Row>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let gated = predicates
                .iter()
                .any(|p| p == &Predicate::equals("userId", StoreValue::Text("u1".to_string())));
            if gated {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.query(collection, predicates).await
        }

        async fn get_all(&self, collection: &str) -> Result<Vec<Row>> {
            self.inner.get_all(collection).await
        }
    }

    fn march_row(id: &str, user: &str) -> Row {
        row(json!({
            "id": id, "userId": user,
            "date": "2024-03-04T00:00:00",
            "inTime": "2024-03-04T09:00:00",
            "outTime": "2024-03-04T17:00:00",
            "status": "PRESENT"
        }))
    }

    fn gated_store() -> Arc<GatedStore> {
        Arc::new(GatedStore {
            inner: MemoryStore::new()
                .with_rows(ATTENDANCE, vec![march_row("j1", "u1"), march_row("b1", "u2")])
                .with_rows(
                    USERS,
                    vec![
                        row(json!({ "id": "u1", "name": "Jane Doe", "email": "jane@example.com" })),
                        row(json!({ "id": "u2", "name": "Bob Roe", "email": "bob@example.com" })),
                    ],
                ),
            queries: AtomicUsize::new(0),
            entered: Notify::new(),
            release: Notify::new(),
        })
    }

    /// 受け取った文書の従業員欄と各行の従業員名を記録するエンジン
    #[derive(Default)]
    struct RecordingEngine {
        documents: StdMutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl ExportEngine for RecordingEngine {
        async fn render(&self, document: &ReportDocument, _options: &ExportOptions) -> Result<Vec<u8>> {
            let rows = document.rows.iter().map(|r| r.cells[1].text.clone()).collect();
            self.documents
                .lock()
                .unwrap()
                .push((document.employee.clone(), rows));
            Ok(b"%PDF-1.3".to_vec())
        }
    }

    fn march(user: &str) -> ReportFilter {
        ReportFilter {
            start_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
            selected_user: UserSelection::User(user.to_string()),
        }
    }

    fn march_now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 5).unwrap().and_hms_opt(14, 7, 0).unwrap()
    }

    fn recording_view(store: Arc<GatedStore>) -> (Arc<ReportView>, Arc<RecordingEngine>) {
        let engine = Arc::new(RecordingEngine::default());
        let slot = Arc::new(EngineSlot::new());
        slot.install(engine.clone()).unwrap();
        (Arc::new(ReportView::new(store, slot)), engine)
    }

    #[tokio::test]
    async fn test_export_keeps_its_own_records_when_view_changes() {
        let store = gated_store();
        let (view, engine) = recording_view(store.clone());

        let exporting = view.clone();
        let task = tokio::spawn(async move {
            exporting.export(&march("u1"), &Branding::default(), march_now()).await
        });
        store.entered.notified().await;

        // エクスポートの取得中に画面は別の従業員へ切り替わる
        let shown = view.show(&march("u2")).await;
        assert_eq!(shown.records[0].user_id, "u2");

        store.release.notify_one();
        let ExportOutcome::Exported(file) = task.await.unwrap().unwrap() else {
            panic!("export was ignored");
        };
        assert_eq!(file.filename, "attendance-report-jane-doe-2024-03-05-1407.pdf");
        assert_eq!(
            *engine.documents.lock().unwrap(),
            vec![("Jane Doe".to_string(), vec!["Jane Doe".to_string()])]
        );

        let snap = view.loader.snapshot().await;
        assert_eq!(snap.filter, Some(march("u2")));
        assert!(snap.records.iter().all(|r| r.user_id == "u2"));
    }

    #[tokio::test]
    async fn test_second_export_during_fetch_is_ignored() {
        let store = gated_store();
        let (view, engine) = recording_view(store.clone());

        let exporting = view.clone();
        let task = tokio::spawn(async move {
            exporting.export(&march("u1"), &Branding::default(), march_now()).await
        });
        store.entered.notified().await;
        assert!(view.exporter.is_busy());

        let second = view.export(&march("u1"), &Branding::default(), march_now()).await.unwrap();
        assert!(matches!(second, ExportOutcome::Ignored));
        assert_eq!(store.queries.load(Ordering::SeqCst), 1);

        store.release.notify_one();
        assert!(matches!(task.await.unwrap().unwrap(), ExportOutcome::Exported(_)));
        assert_eq!(engine.documents.lock().unwrap().len(), 1);
        assert!(!view.exporter.is_busy());
    }
}
