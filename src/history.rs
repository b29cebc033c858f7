use anyhow::Result;
use chrono::{DateTime, Duration, Local, Months, TimeZone, Utc};
use clap::ValueEnum;
use dialoguer::{Select, theme::ColorfulTheme};
use serde_json::json;

use crate::gateway::{self, Gateway, HISTORY_TABLE, Query};
use crate::types::{TrackingTarget, WatchHistoryEntry};

/// Appends one `watch_history` row per progress flush. Rows are never
/// deduplicated; the table is a flush log.
pub struct HistoryLogger<'a, G: Gateway> {
    gateway: &'a G,
}

impl<'a, G: Gateway> HistoryLogger<'a, G> {
    pub fn new(gateway: &'a G) -> Self {
        Self { gateway }
    }

    pub async fn log(&self, target: &TrackingTarget, watched_seconds: u64) {
        let row = json!({
            "user_id": target.user_id,
            "anime_id": target.anime_id,
            "episode_id": target.episode_id,
            "watch_duration": watched_seconds,
            "watched_at": Utc::now(),
        });
        if let Err(err) = self.gateway.insert(HISTORY_TABLE, row).await {
            tracing::warn!(episode = %target.episode_id, "failed to log watch history: {err:#}");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum HistoryRange {
    #[default]
    All,
    Today,
    Week,
    Month,
}

impl HistoryRange {
    /// Earliest `watched_at` included by this range, relative to `now`.
    pub fn since(self, now: DateTime<Local>) -> Option<DateTime<Utc>> {
        match self {
            HistoryRange::All => None,
            HistoryRange::Today => {
                let midnight = now.date_naive().and_hms_opt(0, 0, 0)?;
                Local
                    .from_local_datetime(&midnight)
                    .earliest()
                    .map(|dt| dt.with_timezone(&Utc))
            }
            HistoryRange::Week => Some((now - Duration::days(7)).with_timezone(&Utc)),
            HistoryRange::Month => now
                .checked_sub_months(Months::new(1))
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

pub async fn list<G: Gateway>(
    gateway: &G,
    user_id: &str,
    range: HistoryRange,
) -> Result<Vec<WatchHistoryEntry>> {
    let mut query = Query::new()
        .eq("user_id", user_id)
        .order_by("watched_at", false);
    if let Some(since) = range.since(Local::now()) {
        query = query.gte("watched_at", since.to_rfc3339());
    }
    gateway::fetch_many(gateway, HISTORY_TABLE, &query).await
}

/// Delete every history row of `user_id`. Progress rows are untouched.
pub async fn clear<G: Gateway>(gateway: &G, user_id: &str) -> Result<()> {
    gateway
        .delete(HISTORY_TABLE, &Query::new().eq("user_id", user_id))
        .await
}

pub fn format_entry(entry: &WatchHistoryEntry, title: &str, episode: &str) -> String {
    let minutes = entry.watch_duration / 60;
    let seconds = entry.watch_duration % 60;
    format!(
        "{} \u{00b7} {} \u{00b7} {}:{:02} watched \u{00b7} {}",
        title,
        episode,
        minutes,
        seconds,
        entry
            .watched_at
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M")
    )
}

pub fn select_entry(labels: &[String]) -> Result<Option<usize>> {
    if labels.is_empty() {
        println!("History is empty.");
        return Ok(None);
    }
    let selection = Select::with_theme(&theme())
        .with_prompt("Select an entry to replay (Esc to cancel)")
        .items(labels)
        .default(0)
        .interact_opt()?;
    Ok(selection)
}

pub fn theme() -> ColorfulTheme {
    ColorfulTheme::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::memory::MemoryGateway;

    fn row(user: &str, episode: &str, watched_at: DateTime<Utc>) -> serde_json::Value {
        json!({
            "user_id": user,
            "anime_id": "a1",
            "episode_id": episode,
            "watch_duration": 120,
            "watched_at": watched_at,
        })
    }

    #[tokio::test]
    async fn log_appends_without_dedup() {
        let gateway = MemoryGateway::with_user("u1");
        let logger = HistoryLogger::new(&gateway);
        let target = TrackingTarget {
            user_id: "u1".to_string(),
            anime_id: "a1".to_string(),
            episode_id: "e1".to_string(),
        };

        logger.log(&target, 10).await;
        logger.log(&target, 20).await;

        let rows = gateway.rows(HISTORY_TABLE);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["watch_duration"], 20);
    }

    #[tokio::test]
    async fn failed_insert_is_swallowed() {
        let gateway = MemoryGateway::with_user("u1");
        gateway.set_failing(HISTORY_TABLE, true);
        let target = TrackingTarget {
            user_id: "u1".to_string(),
            anime_id: "a1".to_string(),
            episode_id: "e1".to_string(),
        };

        HistoryLogger::new(&gateway).log(&target, 10).await;

        assert_eq!(gateway.write_attempts(HISTORY_TABLE), 1);
        assert!(gateway.rows(HISTORY_TABLE).is_empty());
    }

    #[tokio::test]
    async fn list_filters_by_user_and_range_newest_first() {
        let gateway = MemoryGateway::with_user("u1");
        let now = Utc::now();
        gateway.seed(
            HISTORY_TABLE,
            vec![
                row("u1", "old", now - Duration::days(40)),
                row("u1", "recent", now - Duration::days(2)),
                row("u1", "latest", now - Duration::minutes(1)),
                row("u2", "other", now),
            ],
        );

        let all = list(&gateway, "u1", HistoryRange::All).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|e| e.episode_id.as_str()).collect();
        assert_eq!(ids, vec!["latest", "recent", "old"]);

        let week = list(&gateway, "u1", HistoryRange::Week).await.unwrap();
        assert_eq!(week.len(), 2);
    }

    #[tokio::test]
    async fn clear_only_removes_own_rows() {
        let gateway = MemoryGateway::with_user("u1");
        let now = Utc::now();
        gateway.seed(
            HISTORY_TABLE,
            vec![row("u1", "e1", now), row("u2", "e2", now)],
        );

        clear(&gateway, "u1").await.unwrap();

        let rows = gateway.rows(HISTORY_TABLE);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["user_id"], "u2");
    }

    #[test]
    fn ranges_have_expected_lower_bounds() {
        let now = Local::now();
        assert!(HistoryRange::All.since(now).is_none());
        let week = HistoryRange::Week.since(now).unwrap();
        assert_eq!((now.with_timezone(&Utc) - week).num_days(), 7);
        let today = HistoryRange::Today.since(now).unwrap();
        assert!(today <= now.with_timezone(&Utc));
        assert!(HistoryRange::Month.since(now).unwrap() < week);
    }
}
