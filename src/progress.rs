//! Watch-progress persistence: one row per (user, episode), overwritten on
//! every flush, plus a history append per flush.

use chrono::Utc;
use serde_json::json;

use crate::gateway::{self, Gateway, PROGRESS_TABLE, Query};
use crate::history::HistoryLogger;
use crate::types::{TrackingTarget, WatchProgress};

/// Fraction of the runtime after which an episode counts as watched.
pub const COMPLETION_THRESHOLD: f64 = 0.9;

/// Saved positions at or below this many seconds restart from the beginning.
pub const RESUME_MIN_SECONDS: u64 = 10;

pub fn is_completed(elapsed: u64, total: u64) -> bool {
    if total == 0 {
        return false;
    }
    elapsed as f64 / total as f64 > COMPLETION_THRESHOLD
}

/// Where to seek on mount, given whatever was stored for this episode.
pub fn resume_position(saved: Option<&WatchProgress>) -> Option<u64> {
    let saved = saved?;
    if saved.completed || saved.progress_seconds <= RESUME_MIN_SECONDS {
        return None;
    }
    Some(saved.progress_seconds)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub elapsed: u64,
    pub total: u64,
}

impl ProgressSnapshot {
    /// Whole seconds, as written to the backend. A non-finite duration is
    /// stored as 0 (unknown).
    pub fn from_position(position: f64, duration: f64) -> Self {
        let total = if duration.is_finite() && duration > 0.0 {
            duration.floor() as u64
        } else {
            0
        };
        let mut elapsed = if position.is_finite() && position > 0.0 {
            position.floor() as u64
        } else {
            0
        };
        if total > 0 {
            elapsed = elapsed.min(total);
        }
        Self { elapsed, total }
    }

    pub fn completed(&self) -> bool {
        is_completed(self.elapsed, self.total)
    }
}

/// Best-effort writer of [`WatchProgress`] rows. Without a target (nobody
/// signed in, or no episode identity) every operation is a no-op.
pub struct ProgressRecorder<'a, G: Gateway> {
    gateway: &'a G,
    target: Option<TrackingTarget>,
    history: HistoryLogger<'a, G>,
    /// Once set (stored row or a flush past the threshold) stays set.
    completed: bool,
}

impl<'a, G: Gateway> ProgressRecorder<'a, G> {
    pub fn new(gateway: &'a G, target: Option<TrackingTarget>) -> Self {
        Self {
            gateway,
            target,
            history: HistoryLogger::new(gateway),
            completed: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.target.is_some()
    }

    pub fn target(&self) -> Option<&TrackingTarget> {
        self.target.as_ref()
    }

    /// Stop writing, e.g. after sign-out.
    pub fn detach(&mut self) {
        self.target = None;
    }

    /// Read the stored row for the current target and decide the resume point.
    pub async fn resume_point(&mut self) -> Option<u64> {
        let target = self.target.as_ref()?;
        let query = Query::new()
            .eq("user_id", &target.user_id)
            .eq("episode_id", &target.episode_id);
        match gateway::fetch_one::<WatchProgress, _>(self.gateway, PROGRESS_TABLE, &query).await {
            Ok(saved) => {
                if saved.as_ref().is_some_and(|saved| saved.completed) {
                    self.completed = true;
                }
                resume_position(saved.as_ref())
            }
            Err(err) => {
                tracing::warn!(episode = %target.episode_id, "failed to load watch progress: {err:#}");
                None
            }
        }
    }

    /// Upsert the progress row and append a history entry. Failures of either
    /// write are logged and dropped independently.
    pub async fn flush(&mut self, snapshot: ProgressSnapshot) {
        let Some(target) = self.target.as_ref() else {
            return;
        };
        self.completed |= snapshot.completed();
        let row = json!({
            "user_id": target.user_id,
            "anime_id": target.anime_id,
            "episode_id": target.episode_id,
            "progress_seconds": snapshot.elapsed,
            "total_duration": snapshot.total,
            "completed": self.completed,
            "last_watched_at": Utc::now(),
        });
        match self
            .gateway
            .upsert(PROGRESS_TABLE, &["user_id", "episode_id"], row)
            .await
        {
            Ok(()) => tracing::debug!(
                episode = %target.episode_id,
                elapsed = snapshot.elapsed,
                total = snapshot.total,
                "saved watch progress"
            ),
            Err(err) => {
                tracing::warn!(episode = %target.episode_id, "failed to save watch progress: {err:#}")
            }
        }
        self.history.log(target, snapshot.elapsed).await;
    }
}
