use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Local, NaiveDate};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Branding;
use crate::error::ReportError;
use crate::export::{EngineSlot, ExportOutcome, EXPORT_ERROR_MESSAGE};
use crate::html;
use crate::loader::{ReportFilter, UserSelection};
use crate::navigation::{can_view, Navigation, DASHBOARD_PATH, LOGIN_PATH, PERMISSION_DENIED, REPORTS_PATH};
use crate::session::{SessionContext, SessionProvider};
use crate::store::RecordStore;
use crate::view::{render_denied, render_report, SessionView};

/// アプリケーション状態
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub sessions: Arc<dyn SessionProvider>,
    pub engine: Arc<EngineSlot>,
    pub branding: Branding,
    /// セッショントークン → 画面状態
    views: Mutex<HashMap<String, Arc<SessionView>>>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn RecordStore>,
        sessions: Arc<dyn SessionProvider>,
        engine: Arc<EngineSlot>,
        branding: Branding,
    ) -> Self {
        Self {
            store,
            sessions,
            engine,
            branding,
            views: Mutex::new(HashMap::new()),
        }
    }

    async fn view_for(&self, ctx: &SessionContext) -> Arc<SessionView> {
        self.views
            .lock()
            .await
            .entry(ctx.token.clone())
            .or_insert_with(|| Arc::new(SessionView::new(self.store.clone(), self.engine.clone())))
            .clone()
    }

    async fn drop_view(&self, token: &str) {
        self.views.lock().await.remove(token);
    }
}

/// レポートの絞り込みパラメータ
#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub user: Option<String>,
}

impl ReportQuery {
    /// 未指定の日付は今日、従業員は全員
    fn into_filter(self, today: NaiveDate) -> ReportFilter {
        let mut filter = ReportFilter::for_day(today);
        if let Some(start) = self.start {
            filter.start_date = start;
        }
        if let Some(end) = self.end {
            filter.end_date = end;
        }
        if let Some(user) = self.user.as_deref() {
            filter.selected_user = UserSelection::parse(user);
        }
        filter
    }
}

/// エラーレスポンス
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(ErrorResponse { error: message.to_string() })).into_response()
}

/// RFC 5987 の attr-char 以外は%エンコード
const FILENAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_');

/// ダウンロード用の Content-Disposition
/// filename は ASCII の代替名、filename* に UTF-8 の元の名前を入れる
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        utf8_percent_encode(filename, FILENAME_ENCODE_SET)
    )
}

/// Authorization: Bearer <token> または session クッキー
fn session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(token.trim().to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().strip_prefix("session="))
        .map(|token| token.to_string())
        .next()
}

async fn resolve_session(state: &AppState, headers: &HeaderMap) -> Option<SessionContext> {
    let token = session_token(headers)?;
    SessionContext::resolve(state.sessions.clone(), &token).await
}

/// ルーターを組み立てる
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route(DASHBOARD_PATH, get(dashboard))
        .route(REPORTS_PATH, get(reports_page))
        .route("/api/reports", get(reports_json))
        .route("/api/reports/export", get(export_report))
        .route("/logout", post(logout))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// HTTPサーバーを起動
pub async fn run(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!(port, "server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// ヘルスチェック
async fn health_check() -> &'static str {
    "OK"
}

async fn dashboard(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(ctx) = resolve_session(&state, &headers).await else {
        return Redirect::to(LOGIN_PATH).into_response();
    };
    let view = state.view_for(&ctx).await;

    let body = format!(
        "<h2>Dashboard</h2><p>Signed in as {}</p>",
        html::escape(&ctx.session.email)
    );
    Html(html::page("Dashboard", &view.shell.render(&ctx, DASHBOARD_PATH), &body)).into_response()
}

/// レポート画面（管理者のみ）
async fn reports_page(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ReportQuery>,
) -> Response {
    let Some(ctx) = resolve_session(&state, &headers).await else {
        return Redirect::to(LOGIN_PATH).into_response();
    };
    let view = state.view_for(&ctx).await;
    let nav = view.shell.render(&ctx, REPORTS_PATH);

    if !can_view(REPORTS_PATH, ctx.is_manager()) {
        return Html(html::page("Attendance Reports", &nav, &render_denied())).into_response();
    }

    let filter = query.into_filter(Local::now().date_naive());
    let snapshot = view.report.show(&filter).await;
    let users = view.report.loader.users().await;
    let user_names = view.report.loader.user_names().await;

    let body = render_report(
        &snapshot,
        &filter,
        &users,
        &user_names,
        view.report.exporter.is_busy(),
    );
    Html(html::page("Attendance Reports", &nav, &body)).into_response()
}

/// レポートのJSON
async fn reports_json(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ReportQuery>,
) -> Response {
    let Some(ctx) = resolve_session(&state, &headers).await else {
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    };
    if !can_view(REPORTS_PATH, ctx.is_manager()) {
        return error_response(StatusCode::FORBIDDEN, PERMISSION_DENIED);
    }

    let view = state.view_for(&ctx).await;
    let filter = query.into_filter(Local::now().date_naive());
    let snapshot = view.report.show(&filter).await;

    if let Some(message) = &snapshot.error {
        return error_response(StatusCode::BAD_GATEWAY, message);
    }
    Json(snapshot).into_response()
}

/// PDFダウンロード
async fn export_report(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ReportQuery>,
) -> Response {
    let Some(ctx) = resolve_session(&state, &headers).await else {
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    };
    if !can_view(REPORTS_PATH, ctx.is_manager()) {
        return error_response(StatusCode::FORBIDDEN, PERMISSION_DENIED);
    }

    let view = state.view_for(&ctx).await;
    let filter = query.into_filter(Local::now().date_naive());

    match view
        .report
        .export(&filter, &state.branding, Local::now().naive_local())
        .await
    {
        Ok(ExportOutcome::Exported(file)) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/pdf".to_string()),
                (header::CONTENT_DISPOSITION, content_disposition(&file.filename)),
            ],
            file.bytes,
        )
            .into_response(),
        Ok(ExportOutcome::Ignored) => {
            error_response(StatusCode::CONFLICT, "An export is already in progress")
        }
        Err(ReportError::EngineNotReady) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "PDF export is not ready yet")
        }
        Err(e) => {
            error!(error = %e, "export request failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, EXPORT_ERROR_MESSAGE)
        }
    }
}

/// ログアウト（成功したらログイン画面へ）
async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(ctx) = resolve_session(&state, &headers).await else {
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    };
    let view = state.view_for(&ctx).await;

    match view.shell.logout(&ctx).await {
        Navigation::Redirect(path) => {
            state.drop_view(&ctx.token).await;
            Redirect::to(path).into_response()
        }
        Navigation::Ignored => error_response(StatusCode::CONFLICT, "Logout already in progress"),
        Navigation::Stay => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Logout failed"),
    }
}
