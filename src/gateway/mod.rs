//! Access to the hosted backend: tables, auth and object storage.
//!
//! Everything the client knows about the backend goes through [`Gateway`].
//! The production implementation speaks the PostgREST/GoTrue/Storage HTTP
//! dialect ([`rest::RestGateway`]); tests use an in-memory table store.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::types::{AuthSession, User};

#[cfg(test)]
pub mod memory;
pub mod rest;

pub const ANIME_TABLE: &str = "anime";
pub const EPISODES_TABLE: &str = "anime_episodes";
pub const CATEGORIES_TABLE: &str = "categories";
pub const ANIME_CATEGORIES_TABLE: &str = "anime_categories";
pub const PROGRESS_TABLE: &str = "watch_progress";
pub const HISTORY_TABLE: &str = "watch_history";
pub const WATCHLIST_TABLE: &str = "watchlist";

pub const VIDEO_BUCKET: &str = "anime-videos";
pub const THUMBNAIL_BUCKET: &str = "anime-thumbnails";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gte,
    /// Case-insensitive match; `%` is the wildcard.
    Ilike,
}

impl FilterOp {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Gte => "gte",
            FilterOp::Ilike => "ilike",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// Filter, sort and limit for a table read or delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub columns: Option<String>,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, columns: &str) -> Self {
        self.columns = Some(columns.to_string());
        self
    }

    pub fn eq(self, column: &str, value: impl ToString) -> Self {
        self.filter(column, FilterOp::Eq, value.to_string())
    }

    pub fn gte(self, column: &str, value: impl ToString) -> Self {
        self.filter(column, FilterOp::Gte, value.to_string())
    }

    pub fn ilike(self, column: &str, pattern: impl ToString) -> Self {
        self.filter(column, FilterOp::Ilike, pattern.to_string())
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn filter(mut self, column: &str, op: FilterOp, value: String) -> Self {
        self.filters.push(Filter {
            column: column.to_string(),
            op,
            value,
        });
        self
    }
}

pub trait Gateway {
    async fn read_one(&self, table: &str, query: &Query) -> Result<Option<Value>>;
    async fn read_many(&self, table: &str, query: &Query) -> Result<Vec<Value>>;
    /// Insert or overwrite the row whose `on_conflict` columns match.
    async fn upsert(&self, table: &str, on_conflict: &[&str], row: Value) -> Result<()>;
    async fn insert(&self, table: &str, row: Value) -> Result<()>;
    async fn delete(&self, table: &str, query: &Query) -> Result<()>;

    async fn current_user(&self) -> Result<Option<User>>;
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession>;
    /// Trade a refresh token for a new session and start using it.
    async fn refresh_session(&self, refresh_token: &str) -> Result<AuthSession>;
    async fn sign_out(&self) -> Result<()>;
    fn restore_session(&self, session: &AuthSession);

    /// Store `bytes` at `bucket/path` (overwriting) and return its public URL.
    async fn upload_object(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String>;
    fn public_url(&self, bucket: &str, path: &str) -> String;
}

pub async fn fetch_one<T, G>(gateway: &G, table: &str, query: &Query) -> Result<Option<T>>
where
    T: DeserializeOwned,
    G: Gateway + ?Sized,
{
    match gateway.read_one(table, query).await? {
        Some(row) => {
            let parsed = serde_json::from_value(row)
                .with_context(|| format!("failed to parse {table} row"))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

pub async fn fetch_many<T, G>(gateway: &G, table: &str, query: &Query) -> Result<Vec<T>>
where
    T: DeserializeOwned,
    G: Gateway + ?Sized,
{
    gateway
        .read_many(table, query)
        .await?
        .into_iter()
        .map(|row| {
            serde_json::from_value(row).with_context(|| format!("failed to parse {table} row"))
        })
        .collect()
}
