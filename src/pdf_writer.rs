use async_trait::async_trait;
use lopdf::{Dictionary, Document, Object, StringFormat};
use printpdf::path::{PaintMode, WindingOrder};
use printpdf::*;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{ReportError, Result};
use crate::export::{palette, Cell, ExportEngine, ExportOptions, ReportDocument, Rgb8, TABLE_HEADERS};

/// 表の列幅（mm、合計277mm = A4横 - 左右余白）
const COLUMN_WIDTHS: [f64; 7] = [40.0, 60.0, 32.0, 32.0, 35.0, 40.0, 38.0];
const HEADER_ROW_H: f64 = 9.0;
const ROW_H: f64 = 8.0;
const FOOTER_H: f64 = 8.0;
const BODY_FONT_PT: f32 = 9.0;

/// mm → Mm型
fn mm(val: f64) -> Mm {
    Mm(val as f32)
}

fn color(c: Rgb8) -> Color {
    Color::Rgb(Rgb::new(
        c.0 as f32 / 255.0,
        c.1 as f32 / 255.0,
        c.2 as f32 / 255.0,
        None,
    ))
}

#[derive(Debug, Clone, Copy)]
enum Align {
    Left,
    Center,
    Right,
}

/// テキスト幅の概算（半角0.5em、全角1em）
fn text_width_mm(text: &str, font_size_pt: f32) -> f64 {
    let em_mm = font_size_pt as f64 * 0.352778; // 1pt = 0.352778mm
    let ems: f64 = text.chars().map(|c| if c.is_ascii() { 0.5 } else { 1.0 }).sum();
    ems * em_mm
}

/// テキストのX座標を計算（align対応）
fn calc_text_x(cell_x: f64, cell_w: f64, text: &str, font_size_pt: f32, align: Align) -> f64 {
    let text_width = text_width_mm(text, font_size_pt);
    let padding = 2.0;

    match align {
        Align::Center => cell_x + (cell_w - text_width) / 2.0,
        Align::Right => cell_x + cell_w - text_width - padding,
        Align::Left => cell_x + padding,
    }
}

/// 上端原点のセル座標 → PDF座標(左下原点)のベースライン
/// セル内で垂直中央揃え
fn y_convert_text(y_mm: f64, h_mm: f64, font_size_pt: f32, page_height_mm: f64) -> Mm {
    let font_size_mm = font_size_pt as f64 * 0.352778;
    let descender = font_size_mm * 0.2;
    let text_y = y_mm + (h_mm + font_size_mm) / 2.0 - descender;
    mm(page_height_mm - text_y)
}

/// 矩形・線用のY座標変換
fn y_convert(y_mm: f64, page_height_mm: f64) -> Mm {
    mm(page_height_mm - y_mm)
}

/// 1ページ目・2ページ目以降に入る行数から、行をページに割り付ける
fn paginate(row_count: usize, first_page_rows: usize, other_page_rows: usize) -> Vec<std::ops::Range<usize>> {
    let first_page_rows = first_page_rows.max(1);
    let other_page_rows = other_page_rows.max(1);

    let mut pages = vec![0..row_count.min(first_page_rows)];
    let mut start = pages[0].end;
    while start < row_count {
        let end = (start + other_page_rows).min(row_count);
        pages.push(start..end);
        start = end;
    }
    pages
}

/// printpdfへの描画をまとめたもの
struct PdfWriter {
    doc: PdfDocumentReference,
    page_width_mm: f64,
    page_height_mm: f64,
    margin_mm: f64,
    layer: PdfLayerReference,
    regular: IndirectFontRef,
    bold: IndirectFontRef,
}

impl PdfWriter {
    /// font が None なら組み込みのHelveticaを使う
    fn new(title: &str, options: &ExportOptions, font: Option<&[u8]>) -> Result<Self> {
        let (page_width_mm, page_height_mm) = if options.landscape {
            (
                options.page_width_mm.max(options.page_height_mm),
                options.page_width_mm.min(options.page_height_mm),
            )
        } else {
            (
                options.page_width_mm.min(options.page_height_mm),
                options.page_width_mm.max(options.page_height_mm),
            )
        };

        let (doc, page, layer) =
            PdfDocument::new(title, mm(page_width_mm), mm(page_height_mm), "Layer 1");
        let layer = doc.get_page(page).get_layer(layer);

        let (regular, bold) = match font {
            Some(bytes) => {
                // 外部フォントは太字なしで共用
                let font = doc
                    .add_external_font(Cursor::new(bytes))
                    .map_err(|e| ReportError::Export(format!("font: {}", e)))?;
                (font.clone(), font)
            }
            None => (
                doc.add_builtin_font(BuiltinFont::Helvetica)
                    .map_err(|e| ReportError::Export(e.to_string()))?,
                doc.add_builtin_font(BuiltinFont::HelveticaBold)
                    .map_err(|e| ReportError::Export(e.to_string()))?,
            ),
        };

        Ok(Self {
            doc,
            page_width_mm,
            page_height_mm,
            margin_mm: options.margin_mm,
            layer,
            regular,
            bold,
        })
    }

    fn content_width(&self) -> f64 {
        self.page_width_mm - self.margin_mm * 2.0
    }

    fn add_page(&mut self) {
        let (page, layer) = self.doc.add_page(
            mm(self.page_width_mm),
            mm(self.page_height_mm),
            "Layer 1",
        );
        self.layer = self.doc.get_page(page).get_layer(layer);
    }

    #[allow(clippy::too_many_arguments)]
    fn text(&self, text: &str, x: f64, y: f64, w: f64, h: f64, size: f32, bold: bool, fg: Rgb8, align: Align) {
        if text.is_empty() {
            return;
        }
        let font = if bold { &self.bold } else { &self.regular };
        self.layer.set_fill_color(color(fg));
        self.layer.use_text(
            text,
            size,
            mm(calc_text_x(x, w, text, size, align)),
            y_convert_text(y, h, size, self.page_height_mm),
            font,
        );
    }

    fn rect_points(&self, x: f64, y: f64, w: f64, h: f64) -> Vec<(Point, bool)> {
        vec![
            (Point::new(mm(x), y_convert(y, self.page_height_mm)), false),
            (Point::new(mm(x + w), y_convert(y, self.page_height_mm)), false),
            (Point::new(mm(x + w), y_convert(y + h, self.page_height_mm)), false),
            (Point::new(mm(x), y_convert(y + h, self.page_height_mm)), false),
        ]
    }

    /// 塗りつぶし＋枠線のセル
    fn cell_box(&self, x: f64, y: f64, w: f64, h: f64, fill: Rgb8, border: Rgb8) {
        self.layer.set_fill_color(color(fill));
        self.layer.set_outline_color(color(border));
        self.layer.set_outline_thickness(0.2);
        self.layer.add_polygon(Polygon {
            rings: vec![self.rect_points(x, y, w, h)],
            mode: PaintMode::FillStroke,
            winding_order: WindingOrder::NonZero,
        });
    }

    fn hline(&self, x1: f64, x2: f64, y: f64, stroke: Rgb8) {
        self.layer.set_outline_color(color(stroke));
        self.layer.set_outline_thickness(0.3);
        self.layer.add_line(Line {
            points: vec![
                (Point::new(mm(x1), y_convert(y, self.page_height_mm)), false),
                (Point::new(mm(x2), y_convert(y, self.page_height_mm)), false),
            ],
            is_closed: false,
        });
    }

    /// ヘッダー・タイトル・条件・集計（1ページ目のみ）。描画後のYを返す
    fn draw_title_block(&self, document: &ReportDocument) -> f64 {
        let x = self.margin_mm;
        let w = self.content_width();
        let mut y = self.margin_mm;

        self.text(&document.brand, x, y, w, 10.0, 18.0, true, palette::BRAND, Align::Left);
        self.text(&document.system_name, x, y, w, 10.0, 14.0, true, palette::BRAND, Align::Right);
        y += 12.0;
        self.hline(x, x + w, y, palette::HEADER_BORDER);
        y += 4.0;

        self.text(&document.title, x, y, w, 10.0, 16.0, true, palette::BRAND, Align::Center);
        y += 14.0;

        self.text("Date Range:", x, y, w, 6.0, 10.0, true, palette::TEXT, Align::Left);
        self.text(&document.date_range, x + 24.0, y, w - 24.0, 6.0, 10.0, false, palette::TEXT, Align::Left);
        y += 6.0;
        self.text("Employee:", x, y, w, 6.0, 10.0, true, palette::TEXT, Align::Left);
        self.text(&document.employee, x + 24.0, y, w - 24.0, 6.0, 10.0, false, palette::TEXT, Align::Left);
        y += 10.0;

        let mut item_x = x;
        for item in &document.summary {
            let label = format!("{}:", item.label);
            self.text(&label, item_x, y, 60.0, 6.0, 10.0, true, item.color, Align::Left);
            let value_x = item_x + text_width_mm(&label, 10.0) + 4.0;
            self.text(&item.value.to_string(), value_x, y, 20.0, 6.0, 10.0, false, item.color, Align::Left);
            item_x += 60.0;
        }
        y += 10.0;

        y
    }

    fn draw_table_header(&self, y: f64) -> f64 {
        let mut x = self.margin_mm;
        for (header, w) in TABLE_HEADERS.iter().zip(COLUMN_WIDTHS) {
            self.cell_box(x, y, w, HEADER_ROW_H, palette::HEADER_BG, palette::HEADER_BORDER);
            self.text(header, x, y, w, HEADER_ROW_H, BODY_FONT_PT + 1.0, true, palette::HEADER_TEXT, Align::Left);
            x += w;
        }
        y + HEADER_ROW_H
    }

    fn draw_row(&self, cells: &[Cell; 7], background: Rgb8, y: f64) {
        let mut x = self.margin_mm;
        for (cell, w) in cells.iter().zip(COLUMN_WIDTHS) {
            self.cell_box(x, y, w, ROW_H, background, palette::ROW_BORDER);
            self.text(&cell.text, x, y, w, ROW_H, BODY_FONT_PT, false, cell.color, Align::Left);
            x += w;
        }
    }

    fn draw_footer(&self, document: &ReportDocument, page_no: usize, page_count: usize) {
        let x = self.margin_mm;
        let w = self.content_width();
        let y = self.page_height_mm - self.margin_mm - FOOTER_H;
        let size = 8.0;

        self.text(&document.generated_at, x, y, w, FOOTER_H, size, false, palette::FOOTER, Align::Left);
        self.text(
            &format!("Page {} of {}", page_no, page_count),
            x,
            y,
            w,
            FOOTER_H,
            size,
            false,
            palette::FOOTER,
            Align::Center,
        );
        self.text(&document.footer_note, x, y, w, FOOTER_H, size, false, palette::FOOTER, Align::Right);
    }

    /// 全ページを描画
    fn render(&mut self, document: &ReportDocument) {
        let bottom = self.page_height_mm - self.margin_mm - FOOTER_H - 2.0;

        let body_top_first = self.draw_title_block(document) + HEADER_ROW_H;
        let body_top_other = self.margin_mm + HEADER_ROW_H;
        let rows_first = ((bottom - body_top_first) / ROW_H).floor().max(0.0) as usize;
        let rows_other = ((bottom - body_top_other) / ROW_H).floor().max(0.0) as usize;

        let pages = paginate(document.rows.len(), rows_first, rows_other);
        let page_count = pages.len();

        for (page_idx, range) in pages.into_iter().enumerate() {
            let top = if page_idx == 0 {
                body_top_first - HEADER_ROW_H
            } else {
                self.add_page();
                self.margin_mm
            };

            let mut y = self.draw_table_header(top);

            if document.rows.is_empty() {
                self.text(
                    "No attendance records found for the selected criteria",
                    self.margin_mm,
                    y,
                    self.content_width(),
                    ROW_H,
                    BODY_FONT_PT,
                    false,
                    palette::MUTED,
                    Align::Center,
                );
            }

            for row in &document.rows[range] {
                self.draw_row(&row.cells, row.background, y);
                y += ROW_H;
            }

            self.draw_footer(document, page_idx + 1, page_count);
        }
    }

    fn save_to_bytes(self) -> Result<Vec<u8>> {
        self.doc
            .save_to_bytes()
            .map_err(|e| ReportError::Export(e.to_string()))
    }
}

/// 文書情報の文字列（ASCII以外を含む場合はBOM付きUTF-16BE）
fn pdf_text_string(s: &str) -> Object {
    if s.is_ascii() {
        return Object::String(s.as_bytes().to_vec(), StringFormat::Literal);
    }
    let mut bytes = vec![0xFE, 0xFF];
    for unit in s.encode_utf16() {
        bytes.extend_from_slice(&unit.to_be_bytes());
    }
    Object::String(bytes, StringFormat::Hexadecimal)
}

/// WinAnsiの組み込みフォントで描けない文字を含むか
fn needs_external_font(document: &ReportDocument) -> bool {
    let wide = |s: &str| s.chars().any(|c| c as u32 > 0xFF);
    wide(&document.brand)
        || wide(&document.system_name)
        || wide(&document.employee)
        || document.rows.iter().any(|row| row.cells.iter().any(|cell| wide(&cell.text)))
}

/// lopdfで文書情報（タイトル等）を書き込む
fn stamp_document_info(bytes: &[u8], document: &ReportDocument) -> Result<Vec<u8>> {
    let mut doc = Document::load_mem(bytes)?;

    let info = Dictionary::from_iter(vec![
        ("Title", pdf_text_string(&document.title)),
        ("Subject", pdf_text_string(&format!("{} / {}", document.date_range, document.employee))),
        ("Author", pdf_text_string(&document.brand)),
        ("Creator", pdf_text_string(&document.system_name)),
        ("Producer", pdf_text_string(env!("CARGO_PKG_NAME"))),
    ]);
    let info_id = doc.add_object(Object::Dictionary(info));
    doc.trailer.set("Info", Object::Reference(info_id));

    let mut out = Vec::new();
    doc.save_to(&mut out)?;
    Ok(out)
}

/// printpdfによるPDF出力エンジン
#[derive(Default, Clone)]
pub struct PdfEngine {
    /// TTFフォントのデータ（未設定なら組み込みフォント）
    font: Option<Arc<Vec<u8>>>,
}

impl PdfEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_font(font: Vec<u8>) -> Self {
        Self { font: Some(Arc::new(font)) }
    }

    /// TTFファイルを読み込んで使う
    pub fn from_font_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let font = std::fs::read(path)?;
        info!(path = %path.display(), bytes = font.len(), "loaded PDF font");
        Ok(Self::with_font(font))
    }

    /// 同期版（ブロッキング）
    pub fn render_blocking(&self, document: &ReportDocument, options: &ExportOptions) -> Result<Vec<u8>> {
        if self.font.is_none() && needs_external_font(document) {
            warn!(employee = %document.employee, "report has characters outside the built-in font, set PDF_FONT_FILE");
        }

        let mut writer = PdfWriter::new(&document.title, options, self.font.as_deref().map(Vec::as_slice))?;
        writer.render(document);
        let bytes = writer.save_to_bytes()?;
        stamp_document_info(&bytes, document)
    }
}

#[async_trait]
impl ExportEngine for PdfEngine {
    async fn render(&self, document: &ReportDocument, options: &ExportOptions) -> Result<Vec<u8>> {
        let engine = self.clone();
        let document = document.clone();
        let options = options.clone();

        tokio::task::spawn_blocking(move || engine.render_blocking(&document, &options))
            .await
            .map_err(|e| ReportError::Export(e.to_string()))?
    }
}
