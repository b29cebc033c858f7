use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AnimeKind {
    Series,
    Movie,
}

impl AnimeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AnimeKind::Series => "series",
            AnimeKind::Movie => "movie",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AnimeKind::Series => "Series",
            AnimeKind::Movie => "Movie",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anime {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub release_year: Option<i32>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<AnimeKind>,
}

impl Anime {
    pub fn label(&self) -> String {
        let mut out = self.title.clone();
        if let Some(year) = self.release_year {
            out.push_str(&format!(" ({year})"));
        }
        if let Some(rating) = self.rating {
            out.push_str(&format!(" \u{2605} {rating:.1}"));
        }
        out
    }

    /// Header shown above the episode list.
    pub fn details(&self, categories: &[String]) -> String {
        let mut out = self.title.clone();
        if let Some(year) = self.release_year {
            out.push_str(&format!(" ({year})"));
        }
        let mut tags: Vec<String> = self.kind.iter().map(|k| k.label().to_string()).collect();
        if !categories.is_empty() {
            tags.push(categories.join(", "));
        }
        if !tags.is_empty() {
            out.push('\n');
            out.push_str(&tags.join(" \u{00b7} "));
        }
        let mut facts = Vec::new();
        if let Some(rating) = self.rating {
            facts.push(format!("Rating: {rating}/10"));
        }
        if let Some(status) = self.status.as_deref().filter(|s| !s.is_empty()) {
            facts.push(format!("Status: {status}"));
        }
        if !facts.is_empty() {
            out.push('\n');
            out.push_str(&facts.join(" \u{00b7} "));
        }
        if let Some(description) = self
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
        {
            out.push_str("\n\n");
            out.push_str(description);
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub anime_id: String,
    pub episode_number: i32,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

impl Episode {
    pub fn label(&self) -> String {
        match &self.title {
            Some(title) if !title.trim().is_empty() => {
                format!("Episode {} \u{00b7} {}", self.episode_number, title)
            }
            _ => format!("Episode {}", self.episode_number),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchProgress {
    pub user_id: String,
    pub anime_id: String,
    pub episode_id: String,
    pub progress_seconds: u64,
    pub total_duration: u64,
    pub completed: bool,
    pub last_watched_at: DateTime<Utc>,
}

impl WatchProgress {
    pub fn percent(&self) -> f64 {
        if self.total_duration == 0 {
            return 0.0;
        }
        (self.progress_seconds as f64 / self.total_duration as f64 * 100.0).min(100.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchHistoryEntry {
    pub user_id: String,
    pub anime_id: String,
    pub episode_id: String,
    pub watch_duration: u64,
    pub watched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub user_id: String,
    pub anime_id: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: User,
}

impl AuthSession {
    /// Seconds before `expires_at` at which the access token is treated as spent.
    pub const EXPIRY_MARGIN_SECS: i64 = 30;

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at - Self::EXPIRY_MARGIN_SECS <= now)
    }
}

/// The (user, anime, episode) triple a progress write is keyed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingTarget {
    pub user_id: String,
    pub anime_id: String,
    pub episode_id: String,
}

impl TrackingTarget {
    pub fn resolve(user: Option<&User>, anime_id: &str, episode_id: Option<&str>) -> Option<Self> {
        let user = user?;
        let episode_id = episode_id.filter(|id| !id.is_empty())?;
        if anime_id.is_empty() {
            return None;
        }
        Some(Self {
            user_id: user.id.clone(),
            anime_id: anime_id.to_string(),
            episode_id: episode_id.to_string(),
        })
    }
}
