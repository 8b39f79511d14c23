use std::env;
use std::path::PathBuf;

use crate::db::DbConfig;
use crate::error::{ReportError, Result};

/// 帳票に印字する名称
#[derive(Debug, Clone)]
pub struct Branding {
    pub brand_name: String,
    pub system_name: String,
}

impl Default for Branding {
    fn default() -> Self {
        Self {
            brand_name: "Brand Care".to_string(),
            system_name: "Attendance Management System".to_string(),
        }
    }
}

/// レコードストアの種類
#[derive(Debug, Clone)]
pub enum StoreBackend {
    /// JSONファイルから読み込むメモリストア
    Memory { data_file: PathBuf },
    MySql(DbConfig),
}

/// アプリケーション設定
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub store: StoreBackend,
    pub sessions_file: PathBuf,
    pub branding: Branding,
    /// PDFに埋め込むTTFフォント（未設定なら組み込みフォント）
    pub pdf_font_file: Option<PathBuf>,
}

impl AppConfig {
    /// 環境変数から設定を読み込み（.envがあれば先に読む）
    /// PORT, REPORT_STORE, REPORT_DATA_FILE, SESSIONS_FILE, BRAND_NAME, SYSTEM_NAME, PDF_FONT_FILE,
    /// STORE_DB_HOST / STORE_DB_PORT / STORE_DB_USER / STORE_DB_PASSWORD / STORE_DB_NAME
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let port = match env::var("PORT") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| ReportError::Config(format!("PORT is not a valid port: {}", raw)))?,
            Err(_) => 8080,
        };

        let store = match env::var("REPORT_STORE").unwrap_or_else(|_| "memory".to_string()).as_str() {
            "memory" => StoreBackend::Memory {
                data_file: env::var("REPORT_DATA_FILE")
                    .unwrap_or_else(|_| "demos/store.json".to_string())
                    .into(),
            },
            "mysql" => StoreBackend::MySql(DbConfig::from_env_with_prefix("STORE")),
            other => {
                return Err(ReportError::Config(format!(
                    "REPORT_STORE must be memory or mysql, got {}",
                    other
                )))
            }
        };

        let defaults = Branding::default();
        let branding = Branding {
            brand_name: env::var("BRAND_NAME").unwrap_or(defaults.brand_name),
            system_name: env::var("SYSTEM_NAME").unwrap_or(defaults.system_name),
        };

        Ok(Self {
            port,
            store,
            sessions_file: env::var("SESSIONS_FILE")
                .unwrap_or_else(|_| "demos/sessions.json".to_string())
                .into(),
            branding,
            pdf_font_file: env::var("PDF_FONT_FILE")
                .ok()
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}
