use anyhow::{Context, Result, bail};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::RwLock;
use url::Url;

use super::{Gateway, Query};
use crate::session::save_session;
use crate::types::{AuthSession, User};

const USER_AGENT: &str = concat!("anicat/", env!("CARGO_PKG_VERSION"));

pub struct RestGateway {
    client: Client,
    base: Url,
    anon_key: String,
    session: RwLock<Option<AuthSession>>,
    /// Where a session refreshed mid-run is written back.
    session_file: Option<PathBuf>,
}

impl RestGateway {
    pub fn new(base_url: &str, anon_key: &str) -> Result<Self> {
        let mut normalized = base_url.trim().to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base = Url::parse(&normalized)
            .with_context(|| format!("invalid backend url {base_url}"))?;
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            client,
            base,
            anon_key: anon_key.to_string(),
            session: RwLock::new(None),
            session_file: None,
        })
    }

    pub fn with_session_file(mut self, path: PathBuf) -> Self {
        self.session_file = Some(path);
        self
    }

    fn token(&self) -> Option<String> {
        self.session
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|s| s.access_token.clone()))
    }

    fn refresh_token(&self) -> Option<String> {
        self.session
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().and_then(|s| s.refresh_token.clone()))
    }

    fn set_session(&self, session: Option<AuthSession>) {
        if let Ok(mut guard) = self.session.write() {
            *guard = session;
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("failed to build backend url for {path}"))
    }

    fn rest_url(&self, table: &str, query: &Query) -> Result<Url> {
        let mut url = self.endpoint(&format!("rest/v1/{table}"))?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(columns) = &query.columns {
                pairs.append_pair("select", columns);
            }
            for filter in &query.filters {
                pairs.append_pair(
                    &filter.column,
                    &format!("{}.{}", filter.op.as_str(), filter.value),
                );
            }
            if let Some(order) = &query.order {
                let direction = if order.ascending { "asc" } else { "desc" };
                pairs.append_pair("order", &format!("{}.{direction}.nullslast", order.column));
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let bearer = self.token().unwrap_or_else(|| self.anon_key.clone());
        self.client
            .request(method, url)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {bearer}"))
            .header("Accept", "application/json")
    }

    /// Send what `build` makes. A 401 gets one token refresh and a resend.
    async fn send(&self, build: impl Fn() -> RequestBuilder, action: &str) -> Result<Response> {
        let response = build()
            .send()
            .await
            .with_context(|| format!("{action} failed"))?;
        if response.status() != StatusCode::UNAUTHORIZED || !self.refresh_after_rejection().await {
            return Ok(response);
        }
        build()
            .send()
            .await
            .with_context(|| format!("{action} failed"))
    }

    async fn refresh_after_rejection(&self) -> bool {
        let Some(refresh_token) = self.refresh_token() else {
            return false;
        };
        match self.refresh_session(&refresh_token).await {
            Ok(session) => {
                tracing::info!("access token refreshed");
                if let Some(path) = &self.session_file
                    && let Err(err) = save_session(path, &session)
                {
                    tracing::warn!("failed to save refreshed session: {err:#}");
                }
                true
            }
            Err(err) => {
                tracing::warn!("token refresh failed: {err:#}");
                false
            }
        }
    }

    async fn token_grant(&self, grant_type: &str, body: Value, action: &str) -> Result<AuthSession> {
        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", grant_type);
        let response = self
            .client
            .post(url)
            .header("apikey", &self.anon_key)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{action} request failed"))?;
        let text = Self::expect_success(response, action).await?;
        let grant: TokenGrant = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {action} response"))?;
        let expires_at = grant.expires_at.or_else(|| {
            grant
                .expires_in
                .map(|secs| chrono::Utc::now().timestamp() + secs)
        });
        let session = AuthSession {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at,
            user: grant.user,
        };
        self.set_session(Some(session.clone()));
        Ok(session)
    }

    async fn expect_success(response: Response, action: &str) -> Result<String> {
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            bail!("{action} failed with HTTP {status}: {text}");
        }
        Ok(text)
    }
}

impl Gateway for RestGateway {
    async fn read_one(&self, table: &str, query: &Query) -> Result<Option<Value>> {
        let query = query.clone().limit(1);
        Ok(self.read_many(table, &query).await?.into_iter().next())
    }

    async fn read_many(&self, table: &str, query: &Query) -> Result<Vec<Value>> {
        let url = self.rest_url(table, query)?;
        let response = self
            .send(
                || self.request(Method::GET, url.clone()),
                &format!("request to {table}"),
            )
            .await?;
        let text = Self::expect_success(response, &format!("read from {table}")).await?;
        serde_json::from_str(&text).with_context(|| format!("failed to parse {table} response"))
    }

    async fn upsert(&self, table: &str, on_conflict: &[&str], row: Value) -> Result<()> {
        let mut url = self.rest_url(table, &Query::new())?;
        if !on_conflict.is_empty() {
            url.query_pairs_mut()
                .append_pair("on_conflict", &on_conflict.join(","));
        }
        let response = self
            .send(
                || {
                    self.request(Method::POST, url.clone())
                        .header("Prefer", "resolution=merge-duplicates,return=minimal")
                        .json(&row)
                },
                &format!("upsert into {table}"),
            )
            .await?;
        Self::expect_success(response, &format!("upsert into {table}")).await?;
        Ok(())
    }

    async fn insert(&self, table: &str, row: Value) -> Result<()> {
        let url = self.rest_url(table, &Query::new())?;
        let response = self
            .send(
                || {
                    self.request(Method::POST, url.clone())
                        .header("Prefer", "return=minimal")
                        .json(&row)
                },
                &format!("insert into {table}"),
            )
            .await?;
        Self::expect_success(response, &format!("insert into {table}")).await?;
        Ok(())
    }

    async fn delete(&self, table: &str, query: &Query) -> Result<()> {
        if query.filters.is_empty() {
            bail!("refusing to delete from {table} without a filter");
        }
        let url = self.rest_url(table, query)?;
        let response = self
            .send(
                || self.request(Method::DELETE, url.clone()),
                &format!("delete from {table}"),
            )
            .await?;
        Self::expect_success(response, &format!("delete from {table}")).await?;
        Ok(())
    }

    async fn current_user(&self) -> Result<Option<User>> {
        if self.token().is_none() {
            return Ok(None);
        }
        let url = self.endpoint("auth/v1/user")?;
        let response = self
            .request(Method::GET, url)
            .send()
            .await
            .context("session lookup failed")?;
        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Ok(None);
        }
        let text = Self::expect_success(response, "session lookup").await?;
        let user: User = serde_json::from_str(&text).context("failed to parse user response")?;
        Ok(Some(user))
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession> {
        let body = json!({ "email": email, "password": password });
        self.token_grant("password", body, "sign-in").await
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<AuthSession> {
        let body = json!({ "refresh_token": refresh_token });
        self.token_grant("refresh_token", body, "token refresh").await
    }

    async fn sign_out(&self) -> Result<()> {
        if self.token().is_none() {
            return Ok(());
        }
        let url = self.endpoint("auth/v1/logout")?;
        let result = self.request(Method::POST, url).send().await;
        self.set_session(None);
        let response = result.context("sign-out request failed")?;
        Self::expect_success(response, "sign-out").await?;
        Ok(())
    }

    fn restore_session(&self, session: &AuthSession) {
        self.set_session(Some(session.clone()));
    }

    async fn upload_object(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        let url = self.endpoint(&format!("storage/v1/object/{bucket}/{path}"))?;
        let response = self
            .send(
                || {
                    self.request(Method::POST, url.clone())
                        .header("x-upsert", "true")
                        .header("Content-Type", content_type)
                        .body(bytes.clone())
                },
                &format!("upload to {bucket}/{path}"),
            )
            .await?;
        Self::expect_success(response, &format!("upload to {bucket}/{path}")).await?;
        Ok(self.public_url(bucket, path))
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        match self.endpoint(&format!("storage/v1/object/public/{bucket}/{path}")) {
            Ok(url) => url.to_string(),
            Err(_) => format!("{}storage/v1/object/public/{bucket}/{path}", self.base),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenGrant {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: User,
}
