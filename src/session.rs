use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{ReportError, Result};

/// ログイン中のユーザー
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    pub email: String,
    #[serde(default)]
    pub is_manager: bool,
}

/// 外部の認証サービス
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// トークンからセッションを解決（無効なら None）
    async fn resolve(&self, token: &str) -> Option<Session>;

    /// セッションを終了
    async fn logout(&self, token: &str) -> Result<()>;
}

/// リクエストごとに解決したセッション
#[derive(Clone)]
pub struct SessionContext {
    pub token: String,
    pub session: Session,
    provider: Arc<dyn SessionProvider>,
}

impl SessionContext {
    /// トークンを解決してコンテキストを作る
    pub async fn resolve(provider: Arc<dyn SessionProvider>, token: &str) -> Option<Self> {
        let session = provider.resolve(token).await?;
        Some(Self {
            token: token.to_string(),
            session,
            provider,
        })
    }

    pub fn is_manager(&self) -> bool {
        self.session.is_manager
    }

    pub async fn logout(&self) -> Result<()> {
        self.provider.logout(&self.token).await
    }
}

#[derive(Debug, Deserialize)]
struct SessionEntry {
    token: String,
    #[serde(flatten)]
    session: Session,
}

/// トークン表で動くセッションプロバイダ（開発用）
#[derive(Debug, Default)]
pub struct StaticSessionProvider {
    sessions: RwLock<HashMap<String, Session>>,
}

impl StaticSessionProvider {
    pub fn new(sessions: HashMap<String, Session>) -> Self {
        Self { sessions: RwLock::new(sessions) }
    }

    /// JSONファイルから読み込む
    /// 形式: [ { "token": "...", "userId": "...", "email": "...", "isManager": true }, ... ]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json_str = std::fs::read_to_string(path)?;
        let entries: Vec<SessionEntry> = serde_json::from_str(&json_str)
            .map_err(|e| ReportError::Config(format!("{}: {}", path.display(), e)))?;

        info!(sessions = entries.len(), "loaded sessions");

        Ok(Self::new(
            entries.into_iter().map(|e| (e.token, e.session)).collect(),
        ))
    }
}

#[async_trait]
impl SessionProvider for StaticSessionProvider {
    async fn resolve(&self, token: &str) -> Option<Session> {
        self.sessions.read().await.get(token).cloned()
    }

    async fn logout(&self, token: &str) -> Result<()> {
        match self.sessions.write().await.remove(token) {
            Some(_) => Ok(()),
            None => Err(ReportError::Session("unknown session".to_string())),
        }
    }
}
