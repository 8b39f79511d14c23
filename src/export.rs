use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{error, info};

use crate::attendance::{AttendanceRecord, AttendanceStatus, SummaryStats};
use crate::busy::{BusyFlag, BusyGuard};
use crate::config::Branding;
use crate::error::{ReportError, Result};
use crate::loader::{ReportFilter, UserSelection};

/// エクスポート失敗時に画面へ出すメッセージ
pub const EXPORT_ERROR_MESSAGE: &str = "Failed to generate PDF. Please try again.";

pub const ALL_EMPLOYEES: &str = "All Employees";

/// RGB色（0-255）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb8(pub u8, pub u8, pub u8);

pub mod palette {
    use super::Rgb8;

    pub const BRAND: Rgb8 = Rgb8(0x1e, 0x40, 0xaf);
    pub const PRESENT: Rgb8 = Rgb8(0x15, 0x80, 0x3d);
    pub const LATE: Rgb8 = Rgb8(0x85, 0x4d, 0x0e);
    pub const ABSENT: Rgb8 = Rgb8(0xdc, 0x26, 0x26);
    pub const TEXT: Rgb8 = Rgb8(0x11, 0x18, 0x27);
    pub const MUTED: Rgb8 = Rgb8(0x66, 0x66, 0x66);
    pub const FOOTER: Rgb8 = Rgb8(0x64, 0x74, 0x8b);
    pub const HEADER_BG: Rgb8 = Rgb8(0xe2, 0xe8, 0xf0);
    pub const HEADER_TEXT: Rgb8 = Rgb8(0x1e, 0x3a, 0x8a);
    pub const HEADER_BORDER: Rgb8 = Rgb8(0xcb, 0xd5, 0xe1);
    pub const ROW_BORDER: Rgb8 = Rgb8(0xe2, 0xe8, 0xf0);
    pub const ROW_EVEN: Rgb8 = Rgb8(0xf8, 0xfa, 0xfc);
    pub const ROW_ODD: Rgb8 = Rgb8(0xff, 0xff, 0xff);
}

pub const TABLE_HEADERS: [&str; 7] = [
    "Date",
    "Employee",
    "Check In",
    "Check Out",
    "Status",
    "Duration",
    "Overtime",
];

/// 色付きテキスト
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub text: String,
    pub color: Rgb8,
}

impl Cell {
    fn plain(text: impl Into<String>) -> Self {
        Self { text: text.into(), color: palette::TEXT }
    }

    fn colored(text: impl Into<String>, color: Rgb8) -> Self {
        Self { text: text.into(), color }
    }
}

/// 表の1行
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub cells: [Cell; 7],
    pub background: Rgb8,
}

/// 集計欄の1項目
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryItem {
    pub label: &'static str,
    pub value: usize,
    pub color: Rgb8,
}

/// エクスポートする文書の内容
#[derive(Debug, Clone, PartialEq)]
pub struct ReportDocument {
    pub brand: String,
    pub system_name: String,
    pub title: String,
    pub date_range: String,
    pub employee: String,
    pub summary: Vec<SummaryItem>,
    pub rows: Vec<ReportRow>,
    pub generated_at: String,
    pub footer_note: String,
}

/// エクスポート時点の入力一式
pub struct ExportContext<'a> {
    pub records: &'a [AttendanceRecord],
    pub summary: SummaryStats,
    pub filter: &'a ReportFilter,
    pub user_names: &'a HashMap<String, String>,
    pub branding: &'a Branding,
    pub now: NaiveDateTime,
}

impl ExportContext<'_> {
    /// 選択中の従業員名（未解決なら None）
    fn selected_name(&self) -> Option<&str> {
        match &self.filter.selected_user {
            UserSelection::All => Some(ALL_EMPLOYEES),
            UserSelection::User(id) => self.user_names.get(id).map(String::as_str),
        }
    }
}

fn date_str(t: &NaiveDateTime) -> String {
    t.format("%b %-d, %Y").to_string()
}

fn time_str(t: &NaiveDateTime) -> String {
    t.format("%I:%M %p").to_string()
}

fn status_color(status: Option<AttendanceStatus>) -> Rgb8 {
    match status {
        Some(AttendanceStatus::Present) => palette::PRESENT,
        Some(AttendanceStatus::Late) => palette::LATE,
        _ => palette::ABSENT,
    }
}

impl ReportDocument {
    pub fn build(ctx: &ExportContext<'_>) -> Self {
        let filter = ctx.filter;
        let date_range = format!(
            "{} - {}",
            filter.start_date.format("%b %-d, %Y"),
            filter.end_date.format("%b %-d, %Y")
        );

        let employee = match &filter.selected_user {
            UserSelection::All => ALL_EMPLOYEES.to_string(),
            UserSelection::User(id) => ctx.selected_name().unwrap_or(id).to_string(),
        };

        let summary = vec![
            SummaryItem { label: "Total Records", value: ctx.summary.total, color: palette::BRAND },
            SummaryItem { label: "Present", value: ctx.summary.present, color: palette::PRESENT },
            SummaryItem { label: "Late", value: ctx.summary.late, color: palette::LATE },
            SummaryItem { label: "Absent", value: ctx.summary.absent, color: palette::ABSENT },
        ];

        let rows = ctx
            .records
            .iter()
            .enumerate()
            .map(|(index, record)| {
                let employee = ctx
                    .user_names
                    .get(&record.user_id)
                    .cloned()
                    .unwrap_or_else(|| record.user_id.clone());
                let overtime_color = if record.overtime > 0.0 {
                    palette::PRESENT
                } else {
                    palette::MUTED
                };

                ReportRow {
                    cells: [
                        Cell::plain(date_str(&record.date)),
                        Cell::plain(employee),
                        Cell::plain(time_str(&record.in_time)),
                        Cell::plain(record.out_time.as_ref().map(time_str).unwrap_or_else(|| "-".to_string())),
                        Cell::colored(record.status_str(), status_color(record.status)),
                        Cell::plain(record.duration_str()),
                        Cell::colored(record.overtime_str(), overtime_color),
                    ],
                    // 偶数行は薄い網掛け
                    background: if index % 2 == 0 { palette::ROW_EVEN } else { palette::ROW_ODD },
                }
            })
            .collect();

        Self {
            brand: ctx.branding.brand_name.clone(),
            system_name: ctx.branding.system_name.clone(),
            title: "Attendance Report".to_string(),
            date_range,
            employee,
            summary,
            rows,
            generated_at: ctx.now.format("%b %-d, %Y, %-I:%M %p").to_string(),
            footer_note: format!("Generated by {} AMS", ctx.branding.brand_name),
        }
    }
}

/// 出力ファイル名
/// attendance-report-{all-employees|氏名スラッグ|unknown}-{yyyy-MM-dd-HHmm}.pdf
pub fn export_filename(selected_name: Option<&str>, all: bool, now: NaiveDateTime) -> String {
    let slug = if all {
        "all-employees".to_string()
    } else {
        selected_name
            .map(|name| name.split_whitespace().collect::<Vec<_>>().join("-").to_lowercase())
            .filter(|slug| !slug.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    };

    format!("attendance-report-{}-{}.pdf", slug, now.format("%Y-%m-%d-%H%M"))
}

/// ページ設定
#[derive(Debug, Clone, PartialEq)]
pub struct ExportOptions {
    pub page_width_mm: f64,
    pub page_height_mm: f64,
    pub landscape: bool,
    pub margin_mm: f64,
    pub image_quality: f32,
    pub filename: String,
}

impl ExportOptions {
    /// A4横・余白10mm
    pub fn a4_landscape(filename: String) -> Self {
        Self {
            page_width_mm: 297.0,
            page_height_mm: 210.0,
            landscape: true,
            margin_mm: 10.0,
            image_quality: 0.98,
            filename,
        }
    }
}

/// ダウンロード用ファイル
#[derive(Debug, Clone)]
pub struct ExportedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub enum ExportOutcome {
    Exported(ExportedFile),
    /// 別のエクスポートが実行中のため無視
    Ignored,
}

/// 文書をファイルに変換するエンジン
#[async_trait]
pub trait ExportEngine: Send + Sync {
    async fn render(&self, document: &ReportDocument, options: &ExportOptions) -> Result<Vec<u8>>;
}

/// 起動時に注入されるエンジンの置き場所
#[derive(Default)]
pub struct EngineSlot {
    engine: OnceLock<Arc<dyn ExportEngine>>,
}

impl EngineSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, engine: Arc<dyn ExportEngine>) -> Result<()> {
        self.engine
            .set(engine)
            .map_err(|_| ReportError::Config("export engine already installed".to_string()))
    }

    pub fn is_ready(&self) -> bool {
        self.engine.get().is_some()
    }

    pub fn get(&self) -> Result<Arc<dyn ExportEngine>> {
        self.engine.get().cloned().ok_or(ReportError::EngineNotReady)
    }
}

/// エクスポート処理（同時に1つまで）
pub struct Exporter {
    engine: Arc<EngineSlot>,
    busy: BusyFlag,
}

impl Exporter {
    pub fn new(engine: Arc<EngineSlot>) -> Self {
        Self { engine, busy: BusyFlag::new() }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.is_busy()
    }

    /// エクスポート枠を取る（実行中なら None）
    ///
    /// 返したガードが生きている間は他のエクスポートを受け付けない。
    pub fn try_begin(&self) -> Option<BusyGuard<'_>> {
        self.busy.try_acquire()
    }

    /// エンジンが登録済みか確認
    pub fn ensure_ready(&self) -> Result<()> {
        self.engine.get().map(|_| ())
    }

    pub async fn export(&self, ctx: ExportContext<'_>) -> Result<ExportOutcome> {
        let Some(guard) = self.try_begin() else {
            info!("export already in progress, ignoring request");
            return Ok(ExportOutcome::Ignored);
        };

        self.render(&guard, ctx).await.map(ExportOutcome::Exported)
    }

    /// 取得済みの枠の中で文書を組み立てて描画する
    pub async fn render(&self, _guard: &BusyGuard<'_>, ctx: ExportContext<'_>) -> Result<ExportedFile> {
        let engine = self.engine.get()?;

        let document = ReportDocument::build(&ctx);
        let all = ctx.filter.selected_user == UserSelection::All;
        let filename = export_filename(ctx.selected_name(), all, ctx.now);
        let options = ExportOptions::a4_landscape(filename.clone());

        match engine.render(&document, &options).await {
            Ok(bytes) => {
                info!(%filename, bytes = bytes.len(), rows = document.rows.len(), "exported report");
                Ok(ExportedFile { filename, bytes })
            }
            Err(e) => {
                error!(error = %e, "PDF generation failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, d)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn record(id: &str, user: &str, status: Option<AttendanceStatus>, out: Option<NaiveDateTime>, overtime: f64) -> AttendanceRecord {
        AttendanceRecord {
            id: id.to_string(),
            user_id: user.to_string(),
            date: at(4, 0, 0),
            in_time: at(4, 9, 5),
            out_time: out,
            status,
            overtime,
        }
    }

    fn branding() -> Branding {
        Branding {
            brand_name: "Brand Care".to_string(),
            system_name: "Attendance Management System".to_string(),
        }
    }

    fn filter(user: UserSelection) -> ReportFilter {
        ReportFilter {
            start_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
            selected_user: user,
        }
    }

    fn names() -> HashMap<String, String> {
        HashMap::from([("u1".to_string(), "Jane Doe".to_string())])
    }

    #[test]
    fn test_filename_for_named_employee() {
        assert_eq!(
            export_filename(Some("Jane Doe"), false, at(5, 14, 7)),
            "attendance-report-jane-doe-2024-03-05-1407.pdf"
        );
        assert_eq!(
            export_filename(Some("Mary  Ann\tLee"), false, at(5, 9, 0)),
            "attendance-report-mary-ann-lee-2024-03-05-0900.pdf"
        );
    }

    #[test]
    fn test_filename_for_all_and_unknown() {
        assert_eq!(
            export_filename(Some(ALL_EMPLOYEES), true, at(5, 14, 7)),
            "attendance-report-all-employees-2024-03-05-1407.pdf"
        );
        assert_eq!(
            export_filename(None, false, at(5, 14, 7)),
            "attendance-report-unknown-2024-03-05-1407.pdf"
        );
    }

    #[test]
    fn test_document_rows() {
        let records = vec![
            record("a", "u1", Some(AttendanceStatus::Present), Some(at(4, 17, 35)), 1.25),
            record("b", "u9", None, None, 0.0),
            record("c", "u1", Some(AttendanceStatus::Late), None, 0.0),
        ];
        let names = names();
        let branding = branding();
        let filter = filter(UserSelection::All);
        let ctx = ExportContext {
            records: &records,
            summary: SummaryStats::from_records(&records),
            filter: &filter,
            user_names: &names,
            branding: &branding,
            now: at(5, 14, 7),
        };
        let doc = ReportDocument::build(&ctx);

        assert_eq!(doc.date_range, "Mar 1, 2024 - Mar 5, 2024");
        assert_eq!(doc.employee, "All Employees");
        assert_eq!(doc.generated_at, "Mar 5, 2024, 2:07 PM");
        assert_eq!(doc.footer_note, "Generated by Brand Care AMS");
        assert_eq!(doc.summary[0].value, 3);
        assert_eq!(doc.summary[1].value, 1);

        let first: Vec<&str> = doc.rows[0].cells.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(
            first,
            vec!["Mar 4, 2024", "Jane Doe", "09:05 AM", "05:35 PM", "PRESENT", "8h 30m", "1.25h"]
        );
        assert_eq!(doc.rows[0].cells[4].color, palette::PRESENT);
        assert_eq!(doc.rows[0].cells[6].color, palette::PRESENT);

        let second: Vec<&str> = doc.rows[1].cells.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(second, vec!["Mar 4, 2024", "u9", "09:05 AM", "-", "Unknown", "-", "-"]);
        assert_eq!(doc.rows[1].cells[4].color, palette::ABSENT);
        assert_eq!(doc.rows[2].cells[4].color, palette::LATE);

        assert_eq!(doc.rows[0].background, palette::ROW_EVEN);
        assert_eq!(doc.rows[1].background, palette::ROW_ODD);
        assert_eq!(doc.rows[2].background, palette::ROW_EVEN);
    }

    #[test]
    fn test_document_unresolved_employee_uses_id() {
        let names = names();
        let branding = branding();
        let filter = filter(UserSelection::User("u42".to_string()));
        let ctx = ExportContext {
            records: &[],
            summary: SummaryStats::default(),
            filter: &filter,
            user_names: &names,
            branding: &branding,
            now: at(5, 14, 7),
        };
        assert_eq!(ReportDocument::build(&ctx).employee, "u42");
        assert_eq!(ctx.selected_name(), None);
    }

    /// 呼び出し回数を数え、解放されるまで完了しないエンジン
    struct SlowEngine {
        calls: AtomicUsize,
        started: Notify,
        release: Notify,
        fail: bool,
    }

    #[async_trait]
    impl ExportEngine for SlowEngine {
        async fn render(&self, _document: &ReportDocument, _options: &ExportOptions) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.release.notified().await;
            if self.fail {
                return Err(ReportError::Export("render failed".to_string()));
            }
            Ok(b"%PDF-1.3".to_vec())
        }
    }

    fn slow_engine(fail: bool) -> Arc<SlowEngine> {
        Arc::new(SlowEngine {
            calls: AtomicUsize::new(0),
            started: Notify::new(),
            release: Notify::new(),
            fail,
        })
    }

    fn exporter_with(engine: Arc<SlowEngine>) -> Arc<Exporter> {
        let slot = Arc::new(EngineSlot::new());
        slot.install(engine).unwrap();
        Arc::new(Exporter::new(slot))
    }

    async fn run_export(exporter: &Exporter) -> Result<ExportOutcome> {
        let names = names();
        let branding = branding();
        let filter = filter(UserSelection::User("u1".to_string()));
        exporter
            .export(ExportContext {
                records: &[],
                summary: SummaryStats::default(),
                filter: &filter,
                user_names: &names,
                branding: &branding,
                now: at(5, 14, 7),
            })
            .await
    }

    #[tokio::test]
    async fn test_second_export_is_ignored_while_busy() {
        let engine = slow_engine(false);
        let exporter = exporter_with(engine.clone());

        let first_exporter = exporter.clone();
        let first = tokio::spawn(async move { run_export(&first_exporter).await });
        engine.started.notified().await;
        assert!(exporter.is_busy());

        let second = run_export(&exporter).await.unwrap();
        assert!(matches!(second, ExportOutcome::Ignored));
        assert!(exporter.is_busy());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);

        engine.release.notify_one();
        match first.await.unwrap().unwrap() {
            ExportOutcome::Exported(file) => {
                assert_eq!(file.filename, "attendance-report-jane-doe-2024-03-05-1407.pdf");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!exporter.is_busy());
    }

    #[tokio::test]
    async fn test_failed_export_clears_busy_flag() {
        let engine = slow_engine(true);
        let exporter = exporter_with(engine.clone());
        engine.release.notify_one();

        let result = run_export(&exporter).await;
        assert!(matches!(result, Err(ReportError::Export(_))));
        assert!(!exporter.is_busy());
    }

    #[tokio::test]
    async fn test_engine_not_ready() {
        let exporter = Exporter::new(Arc::new(EngineSlot::new()));
        let result = run_export(&exporter).await;
        assert!(matches!(result, Err(ReportError::EngineNotReady)));
        assert!(!exporter.is_busy());
    }
}
