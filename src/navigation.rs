use tracing::{error, info};

use crate::busy::BusyFlag;
use crate::html::escape;
use crate::session::SessionContext;

pub const LOGIN_PATH: &str = "/login";
pub const DASHBOARD_PATH: &str = "/dashboard";
pub const MY_ATTENDANCE_PATH: &str = "/dashboard/my-attendance";
pub const REPORTS_PATH: &str = "/dashboard/reports";

/// 権限のないユーザーに出す固定メッセージ
pub const PERMISSION_DENIED: &str = "You do not have permission to view this page.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavLink {
    pub href: &'static str,
    pub label: &'static str,
    pub active: bool,
}

/// 表示するリンク（Reportsは管理者のみ）
pub fn nav_links(is_manager: bool, current_path: &str) -> Vec<NavLink> {
    let mut links = vec![(DASHBOARD_PATH, "Dashboard"), (MY_ATTENDANCE_PATH, "My Attendance")];
    if is_manager {
        links.push((REPORTS_PATH, "Reports"));
    }

    links
        .into_iter()
        .map(|(href, label)| NavLink {
            href,
            label,
            active: href == current_path,
        })
        .collect()
}

/// ルートを表示できるか
pub fn can_view(path: &str, is_manager: bool) -> bool {
    path != REPORTS_PATH || is_manager
}

/// ログアウト後の遷移
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    Redirect(&'static str),
    /// 失敗したので現在のページに留まる
    Stay,
    /// 既にログアウト処理中
    Ignored,
}

/// ナビゲーション（リンク表示とログアウト）
#[derive(Debug, Default)]
pub struct NavigationShell {
    logging_out: BusyFlag,
}

impl NavigationShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_logging_out(&self) -> bool {
        self.logging_out.is_busy()
    }

    /// セッションを終了してログイン画面へ
    pub async fn logout(&self, ctx: &SessionContext) -> Navigation {
        let Some(_guard) = self.logging_out.try_acquire() else {
            return Navigation::Ignored;
        };

        match ctx.logout().await {
            Ok(()) => {
                info!(user = %ctx.session.user_id, "logged out");
                Navigation::Redirect(LOGIN_PATH)
            }
            Err(e) => {
                error!(error = %e, user = %ctx.session.user_id, "logout error");
                Navigation::Stay
            }
        }
    }

    pub fn render(&self, ctx: &SessionContext, current_path: &str) -> String {
        let links: String = nav_links(ctx.is_manager(), current_path)
            .iter()
            .map(|link| {
                format!(
                    r#"<a href="{}"{}>{}</a>"#,
                    link.href,
                    if link.active { r#" class="active""# } else { "" },
                    link.label
                )
            })
            .collect();

        let button = if self.is_logging_out() {
            r#"<button type="submit" disabled>Logging out...</button>"#
        } else {
            r#"<button type="submit">Logout</button>"#
        };

        format!(
            r#"<nav><div>{}</div><div><span>{}</span> <form method="post" action="/logout" style="display:inline">{}</form></div></nav>"#,
            links,
            escape(&ctx.session.email),
            button
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ReportError, Result};
    use crate::session::{Session, SessionProvider};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    struct TestProvider {
        fail: bool,
        calls: AtomicUsize,
        release: Option<Notify>,
        started: Notify,
    }

    #[async_trait]
    impl SessionProvider for TestProvider {
        async fn resolve(&self, _token: &str) -> Option<Session> {
            Some(Session {
                user_id: "u1".to_string(),
                email: "boss@example.com".to_string(),
                is_manager: true,
            })
        }

        async fn logout(&self, _token: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            if let Some(release) = &self.release {
                release.notified().await;
            }
            if self.fail {
                Err(ReportError::Session("network".to_string()))
            } else {
                Ok(())
            }
        }
    }

    async fn context(provider: Arc<TestProvider>) -> SessionContext {
        SessionContext::resolve(provider, "token").await.unwrap()
    }

    fn provider(fail: bool, gated: bool) -> Arc<TestProvider> {
        Arc::new(TestProvider {
            fail,
            calls: AtomicUsize::new(0),
            release: gated.then(Notify::new),
            started: Notify::new(),
        })
    }

    #[test]
    fn test_reports_link_only_for_managers() {
        let manager = nav_links(true, REPORTS_PATH);
        assert_eq!(manager.len(), 3);
        assert!(manager.iter().any(|l| l.href == REPORTS_PATH && l.active));
        assert!(manager.iter().filter(|l| l.active).count() == 1);

        let staff = nav_links(false, DASHBOARD_PATH);
        assert!(staff.iter().all(|l| l.href != REPORTS_PATH));
        assert!(staff[0].active);
    }

    #[test]
    fn test_route_gate() {
        assert!(can_view(REPORTS_PATH, true));
        assert!(!can_view(REPORTS_PATH, false));
        assert!(can_view(DASHBOARD_PATH, false));
    }

    #[tokio::test]
    async fn test_logout_redirects_to_login() {
        let p = provider(false, false);
        let shell = NavigationShell::new();
        let nav = shell.logout(&context(p.clone()).await).await;
        assert_eq!(nav, Navigation::Redirect(LOGIN_PATH));
        assert!(!shell.is_logging_out());
    }

    #[tokio::test]
    async fn test_logout_failure_stays() {
        let p = provider(true, false);
        let shell = NavigationShell::new();
        let nav = shell.logout(&context(p).await).await;
        assert_eq!(nav, Navigation::Stay);
        assert!(!shell.is_logging_out());
    }

    #[tokio::test]
    async fn test_concurrent_logout_is_ignored() {
        let p = provider(false, true);
        let shell = Arc::new(NavigationShell::new());
        let ctx = context(p.clone()).await;

        let first_shell = shell.clone();
        let first_ctx = ctx.clone();
        let first = tokio::spawn(async move { first_shell.logout(&first_ctx).await });
        p.started.notified().await;

        assert_eq!(shell.logout(&ctx).await, Navigation::Ignored);
        assert!(shell.render(&ctx, DASHBOARD_PATH).contains("Logging out..."));

        if let Some(release) = &p.release {
            release.notify_one();
        }
        assert_eq!(first.await.unwrap(), Navigation::Redirect(LOGIN_PATH));
        assert_eq!(p.calls.load(Ordering::SeqCst), 1);
        assert!(!shell.is_logging_out());
    }
}
