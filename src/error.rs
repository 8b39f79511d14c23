use thiserror::Error;

/// レポート処理全体のエラー
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("record store query failed: {0}")]
    Store(String),

    #[error("failed to project row {id}: {reason}")]
    Projection { id: String, reason: String },

    #[error("document export failed: {0}")]
    Export(String),

    #[error("export engine is not ready")]
    EngineNotReady,

    #[error("session error: {0}")]
    Session(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<mysql::Error> for ReportError {
    fn from(e: mysql::Error) -> Self {
        ReportError::Store(e.to_string())
    }
}

impl From<lopdf::Error> for ReportError {
    fn from(e: lopdf::Error) -> Self {
        ReportError::Export(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReportError>;
