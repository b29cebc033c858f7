//! In-memory [`Gateway`] used by tests: tables of JSON rows, a user list,
//! issued tokens and per-table write failure injection.

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::{Filter, FilterOp, Gateway, Query};
use crate::types::{AuthSession, User};

#[derive(Default)]
pub struct MemoryGateway {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    failing: Mutex<HashSet<String>>,
    attempts: Mutex<HashMap<String, usize>>,
    accounts: Mutex<Vec<(User, String)>>,
    signed_in: Mutex<Option<User>>,
    /// Live refresh tokens and the user they belong to.
    refresh_tokens: Mutex<HashMap<String, String>>,
    revoked: Mutex<HashSet<String>>,
    issued: Mutex<usize>,
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(id: &str) -> Self {
        let gateway = Self::new();
        let user = gateway.add_account(id, &format!("{id}@example.test"), "secret");
        *gateway.signed_in.lock().unwrap() = Some(user);
        gateway
    }

    pub fn add_account(&self, id: &str, email: &str, password: &str) -> User {
        let user = User {
            id: id.to_string(),
            email: Some(email.to_string()),
        };
        self.accounts
            .lock()
            .unwrap()
            .push((user.clone(), password.to_string()));
        user
    }

    /// A fresh one-hour session for an existing account.
    pub fn issue_session(&self, user_id: &str) -> AuthSession {
        let user = self
            .accounts
            .lock()
            .unwrap()
            .iter()
            .find(|(user, _)| user.id == user_id)
            .map(|(user, _)| user.clone())
            .expect("known account");
        let n = {
            let mut issued = self.issued.lock().unwrap();
            *issued += 1;
            *issued
        };
        let refresh_token = format!("refresh-{user_id}-{n}");
        self.refresh_tokens
            .lock()
            .unwrap()
            .insert(refresh_token.clone(), user_id.to_string());
        AuthSession {
            access_token: format!("token-{user_id}-{n}"),
            refresh_token: Some(refresh_token),
            expires_at: Some(Utc::now().timestamp() + 3600),
            user,
        }
    }

    /// The backend stops accepting `access_token`.
    pub fn revoke(&self, access_token: &str) {
        self.revoked
            .lock()
            .unwrap()
            .insert(access_token.to_string());
    }

    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Make every subsequent write to `table` fail until toggled back.
    pub fn set_failing(&self, table: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(table.to_string());
        } else {
            set.remove(table);
        }
    }

    /// Writes attempted against `table`, failed ones included.
    pub fn write_attempts(&self, table: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(table)
            .copied()
            .unwrap_or(0)
    }

    pub fn object(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&format!("{bucket}/{path}"))
            .cloned()
    }

    fn begin_write(&self, table: &str) -> Result<()> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_insert(0) += 1;
        if self.failing.lock().unwrap().contains(table) {
            bail!("simulated network failure writing {table}");
        }
        Ok(())
    }
}

impl Gateway for MemoryGateway {
    async fn read_one(&self, table: &str, query: &Query) -> Result<Option<Value>> {
        Ok(self.read_many(table, query).await?.into_iter().next())
    }

    async fn read_many(&self, table: &str, query: &Query) -> Result<Vec<Value>> {
        let mut rows: Vec<Value> = self
            .rows(table)
            .into_iter()
            .filter(|row| query.filters.iter().all(|f| matches(row, f)))
            .collect();
        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let (x, y) = (&a[&order.column], &b[&order.column]);
                match (x.is_null(), y.is_null()) {
                    (true, false) => Ordering::Greater,
                    (false, true) => Ordering::Less,
                    _ if order.ascending => compare(x, y),
                    _ => compare(x, y).reverse(),
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn upsert(&self, table: &str, on_conflict: &[&str], row: Value) -> Result<()> {
        self.begin_write(table)?;
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.entry(table.to_string()).or_default();
        let existing = rows
            .iter_mut()
            .find(|candidate| on_conflict.iter().all(|key| candidate[*key] == row[*key]));
        match existing {
            Some(slot) => *slot = row,
            None => rows.push(row),
        }
        Ok(())
    }

    async fn insert(&self, table: &str, mut row: Value) -> Result<()> {
        self.begin_write(table)?;
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.entry(table.to_string()).or_default();
        if let Some(fields) = row.as_object_mut()
            && !fields.contains_key("id")
        {
            fields.insert("id".to_string(), Value::String(format!("{table}-{}", rows.len() + 1)));
        }
        rows.push(row);
        Ok(())
    }

    async fn delete(&self, table: &str, query: &Query) -> Result<()> {
        self.begin_write(table)?;
        if let Some(rows) = self.tables.lock().unwrap().get_mut(table) {
            rows.retain(|row| !query.filters.iter().all(|f| matches(row, f)));
        }
        Ok(())
    }

    async fn current_user(&self) -> Result<Option<User>> {
        Ok(self.signed_in.lock().unwrap().clone())
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession> {
        let user = self
            .accounts
            .lock()
            .unwrap()
            .iter()
            .find(|(user, secret)| user.email.as_deref() == Some(email) && secret == password)
            .map(|(user, _)| user.clone())
            .ok_or_else(|| anyhow!("invalid login credentials"))?;
        let session = self.issue_session(&user.id);
        *self.signed_in.lock().unwrap() = Some(user);
        Ok(session)
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<AuthSession> {
        let user_id = self
            .refresh_tokens
            .lock()
            .unwrap()
            .remove(refresh_token)
            .ok_or_else(|| anyhow!("invalid refresh token"))?;
        let session = self.issue_session(&user_id);
        *self.signed_in.lock().unwrap() = Some(session.user.clone());
        Ok(session)
    }

    async fn sign_out(&self) -> Result<()> {
        *self.signed_in.lock().unwrap() = None;
        Ok(())
    }

    fn restore_session(&self, session: &AuthSession) {
        let known = self
            .accounts
            .lock()
            .unwrap()
            .iter()
            .any(|(user, _)| user.id == session.user.id);
        let accepted = known
            && !session.is_expired(Utc::now().timestamp())
            && !self.revoked.lock().unwrap().contains(&session.access_token);
        *self.signed_in.lock().unwrap() = accepted.then(|| session.user.clone());
    }

    async fn upload_object(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String> {
        self.begin_write(bucket)?;
        self.objects
            .lock()
            .unwrap()
            .insert(format!("{bucket}/{path}"), bytes);
        Ok(self.public_url(bucket, path))
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("memory://{bucket}/{path}")
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn matches(row: &Value, filter: &Filter) -> bool {
    let Some(actual) = scalar(&row[&filter.column]) else {
        return false;
    };
    match filter.op {
        FilterOp::Eq => actual == filter.value,
        FilterOp::Gte => compare(&row[&filter.column], &Value::String(filter.value.clone()))
            != Ordering::Less,
        FilterOp::Ilike => {
            let needle = filter.value.trim_matches('%').to_lowercase();
            actual.to_lowercase().contains(&needle)
        }
    }
}

fn compare(a: &Value, b: &Value) -> Ordering {
    match (scalar(a), scalar(b)) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            if let (Ok(x), Ok(y)) = (a.parse::<f64>(), b.parse::<f64>()) {
                return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
            }
            if let (Ok(x), Ok(y)) = (
                DateTime::parse_from_rfc3339(&a),
                DateTime::parse_from_rfc3339(&b),
            ) {
                return x.cmp(&y);
            }
            a.cmp(&b)
        }
    }
}
