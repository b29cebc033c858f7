use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use dirs_next::data_dir;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tokio::sync::watch;

use crate::gateway::Gateway;
use crate::types::{AuthSession, User};

/// Who is signed in, shared with everything that writes per-user data.
///
/// Subscribers get a [`watch::Receiver`] and see `None` after sign-out.
pub struct SessionContext {
    store_path: PathBuf,
    user: watch::Sender<Option<User>>,
}

impl SessionContext {
    /// Restore the stored session (if any) and confirm it with the backend.
    /// An expired access token is refreshed first; a rejected one gets one
    /// refresh attempt. A session that still fails is discarded.
    pub async fn init<G: Gateway>(gateway: &G, store_path: PathBuf) -> Result<Self> {
        let (user, _) = watch::channel(None);
        let ctx = Self { store_path, user };

        let stored = match load_session(&ctx.store_path) {
            Ok(stored) => stored,
            Err(err) => {
                tracing::warn!("ignoring unreadable session file: {err:#}");
                None
            }
        };
        let Some(mut session) = stored else {
            return Ok(ctx);
        };

        let mut refreshed = false;
        if session.is_expired(Utc::now().timestamp()) {
            refreshed = true;
            if let Some(fresh) = ctx.refresh(gateway, &session).await {
                session = fresh;
            }
        }
        gateway.restore_session(&session);
        let mut verified = gateway.current_user().await;
        if matches!(verified, Ok(None))
            && !refreshed
            && let Some(fresh) = ctx.refresh(gateway, &session).await
        {
            session = fresh;
            verified = gateway.current_user().await;
        }

        match verified {
            Ok(Some(current)) => {
                ctx.user.send_replace(Some(current));
            }
            Ok(None) => {
                tracing::info!("stored session expired; signing out");
                ctx.forget()?;
            }
            Err(err) => {
                // Offline: keep the stored identity rather than losing the session.
                tracing::warn!("could not verify stored session: {err:#}");
                ctx.user.send_replace(Some(session.user));
            }
        }
        Ok(ctx)
    }

    /// Exchange the session's refresh token and save the result.
    async fn refresh<G: Gateway>(&self, gateway: &G, session: &AuthSession) -> Option<AuthSession> {
        let refresh_token = session.refresh_token.as_deref()?;
        match gateway.refresh_session(refresh_token).await {
            Ok(fresh) => {
                tracing::debug!("session refreshed");
                if let Err(err) = save_session(&self.store_path, &fresh) {
                    tracing::warn!("failed to save refreshed session: {err:#}");
                }
                Some(fresh)
            }
            Err(err) => {
                tracing::warn!("could not refresh stored session: {err:#}");
                None
            }
        }
    }

    pub fn current(&self) -> Option<User> {
        self.user.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<User>> {
        self.user.subscribe()
    }

    pub async fn sign_in<G: Gateway>(
        &self,
        gateway: &G,
        email: &str,
        password: &str,
    ) -> Result<User> {
        let session = gateway.sign_in(email, password).await?;
        save_session(&self.store_path, &session)?;
        self.user.send_replace(Some(session.user.clone()));
        Ok(session.user)
    }

    pub async fn sign_out<G: Gateway>(&self, gateway: &G) -> Result<()> {
        let remote = gateway.sign_out().await;
        self.forget()?;
        remote
    }

    fn forget(&self) -> Result<()> {
        self.user.send_replace(None);
        if self.store_path.exists() {
            fs::remove_file(&self.store_path).with_context(|| {
                format!("failed to remove session file {}", self.store_path.display())
            })?;
        }
        Ok(())
    }
}

pub fn session_path() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| anyhow!("Could not determine data directory"))?;
    Ok(base.join("anicat").join("session.json"))
}

fn load_session(path: &Path) -> Result<Option<AuthSession>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read session file {}", path.display()))?;
    let session = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse session file {}", path.display()))?;
    Ok(Some(session))
}

pub fn save_session(path: &Path, session: &AuthSession) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create session directory {}", parent.display()))?;
    }
    let data = serde_json::to_string_pretty(session)?;
    fs::write(path, data)
        .with_context(|| format!("failed to write session file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::memory::MemoryGateway;

    fn store(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("anicat-session-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir.join("session.json")
    }

    #[tokio::test]
    async fn sign_in_persists_and_init_restores() {
        let gateway = MemoryGateway::new();
        gateway.add_account("u1", "viewer@example.test", "hunter2");
        let path = store("restore");

        let ctx = SessionContext::init(&gateway, path.clone()).await.unwrap();
        assert!(ctx.current().is_none());
        let user = ctx
            .sign_in(&gateway, "viewer@example.test", "hunter2")
            .await
            .unwrap();
        assert_eq!(user.id, "u1");
        assert!(path.exists());

        let fresh = MemoryGateway::new();
        fresh.add_account("u1", "viewer@example.test", "hunter2");
        let restored = SessionContext::init(&fresh, path.clone()).await.unwrap();
        assert_eq!(restored.current().map(|u| u.id), Some("u1".to_string()));
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn sign_out_clears_store_and_notifies() {
        let gateway = MemoryGateway::new();
        gateway.add_account("u1", "viewer@example.test", "hunter2");
        let path = store("signout");
        let ctx = SessionContext::init(&gateway, path.clone()).await.unwrap();
        ctx.sign_in(&gateway, "viewer@example.test", "hunter2")
            .await
            .unwrap();
        let mut rx = ctx.subscribe();

        ctx.sign_out(&gateway).await.unwrap();

        rx.changed().await.unwrap();
        assert!(rx.borrow().is_none());
        assert!(!path.exists());
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn rejected_session_is_discarded() {
        let path = store("stale");
        let session = AuthSession {
            access_token: "token-ghost".to_string(),
            refresh_token: None,
            expires_at: None,
            user: User {
                id: "ghost".to_string(),
                email: None,
            },
        };
        save_session(&path, &session).unwrap();

        let ctx = SessionContext::init(&MemoryGateway::new(), path.clone())
            .await
            .unwrap();

        assert!(ctx.current().is_none());
        assert!(!path.exists());
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn expired_session_is_refreshed_and_saved() {
        let gateway = MemoryGateway::new();
        gateway.add_account("u1", "viewer@example.test", "hunter2");
        let path = store("expired");
        let mut stale = gateway.issue_session("u1");
        stale.expires_at = Some(Utc::now().timestamp() - 60);
        save_session(&path, &stale).unwrap();

        let ctx = SessionContext::init(&gateway, path.clone()).await.unwrap();

        assert_eq!(ctx.current().map(|u| u.id), Some("u1".to_string()));
        let saved = load_session(&path).unwrap().unwrap();
        assert_ne!(saved.access_token, stale.access_token);
        assert_ne!(saved.refresh_token, stale.refresh_token);
        assert!(!saved.is_expired(Utc::now().timestamp()));
        // refresh tokens are single use
        let used = stale.refresh_token.unwrap();
        assert!(gateway.refresh_session(&used).await.is_err());
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn rejected_token_gets_one_refresh() {
        let gateway = MemoryGateway::new();
        gateway.add_account("u1", "viewer@example.test", "hunter2");
        let path = store("revoked");
        let session = gateway.issue_session("u1");
        gateway.revoke(&session.access_token);
        save_session(&path, &session).unwrap();

        let ctx = SessionContext::init(&gateway, path.clone()).await.unwrap();

        assert_eq!(ctx.current().map(|u| u.id), Some("u1".to_string()));
        let saved = load_session(&path).unwrap().unwrap();
        assert_ne!(saved.access_token, session.access_token);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn expired_session_with_dead_refresh_token_is_discarded() {
        let gateway = MemoryGateway::new();
        gateway.add_account("u1", "viewer@example.test", "hunter2");
        let path = store("deadrefresh");
        let mut session = gateway.issue_session("u1");
        session.expires_at = Some(Utc::now().timestamp() - 60);
        session.refresh_token = Some("refresh-unknown".to_string());
        save_session(&path, &session).unwrap();

        let ctx = SessionContext::init(&gateway, path.clone()).await.unwrap();

        assert!(ctx.current().is_none());
        assert!(!path.exists());
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn wrong_password_leaves_session_empty() {
        let gateway = MemoryGateway::new();
        gateway.add_account("u1", "viewer@example.test", "hunter2");
        let path = store("badpass");
        let ctx = SessionContext::init(&gateway, path.clone()).await.unwrap();

        assert!(ctx.sign_in(&gateway, "viewer@example.test", "nope").await.is_err());
        assert!(ctx.current().is_none());
        assert!(!path.exists());
    }
}
