//! Read side of the catalog plus the per-user lists built on it.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;

use crate::gateway::{
    self, ANIME_CATEGORIES_TABLE, ANIME_TABLE, CATEGORIES_TABLE, EPISODES_TABLE, Gateway,
    PROGRESS_TABLE, Query, THUMBNAIL_BUCKET, VIDEO_BUCKET, WATCHLIST_TABLE,
};
use crate::types::{Anime, AnimeKind, Category, Episode, WatchProgress, WatchlistEntry};

pub const SEARCH_LIMIT: usize = 8;
pub const CONTINUE_WATCHING_LIMIT: usize = 6;
pub const LATEST_LIMIT: usize = 12;

pub async fn list_by_kind<G: Gateway>(gateway: &G, kind: AnimeKind) -> Result<Vec<Anime>> {
    let query = Query::new()
        .eq("type", kind.as_str())
        .order_by("rating", false);
    gateway::fetch_many(gateway, ANIME_TABLE, &query).await
}

/// Most recently added titles, newest first.
pub async fn latest<G: Gateway>(gateway: &G) -> Result<Vec<Anime>> {
    let query = Query::new()
        .order_by("created_at", false)
        .limit(LATEST_LIMIT);
    gateway::fetch_many(gateway, ANIME_TABLE, &query).await
}

pub async fn categories<G: Gateway>(gateway: &G) -> Result<Vec<Category>> {
    gateway::fetch_many(gateway, CATEGORIES_TABLE, &Query::new().order_by("name", true)).await
}

#[derive(Debug, Deserialize)]
struct AnimeCategoryLink {
    #[serde(default)]
    anime_id: String,
    #[serde(default)]
    category_id: String,
}

/// Names of the categories `anime_id` is filed under, alphabetical.
pub async fn categories_of<G: Gateway>(gateway: &G, anime_id: &str) -> Result<Vec<String>> {
    let links: Vec<AnimeCategoryLink> = gateway::fetch_many(
        gateway,
        ANIME_CATEGORIES_TABLE,
        &Query::new()
            .select("category_id")
            .eq("anime_id", anime_id),
    )
    .await?;
    if links.is_empty() {
        return Ok(Vec::new());
    }
    Ok(categories(gateway)
        .await?
        .into_iter()
        .filter(|c| links.iter().any(|link| link.category_id == c.id))
        .map(|c| c.name)
        .collect())
}

pub async fn anime_in_category<G: Gateway>(gateway: &G, category_name: &str) -> Result<Vec<Anime>> {
    let Some(category) = categories(gateway)
        .await?
        .into_iter()
        .find(|c| c.name.eq_ignore_ascii_case(category_name))
    else {
        bail!("No category named \"{category_name}\"");
    };
    let links: Vec<AnimeCategoryLink> = gateway::fetch_many(
        gateway,
        ANIME_CATEGORIES_TABLE,
        &Query::new()
            .select("anime_id")
            .eq("category_id", &category.id),
    )
    .await?;
    let mut out = Vec::with_capacity(links.len());
    for link in links {
        if let Some(anime) = anime(gateway, &link.anime_id).await? {
            out.push(anime);
        }
    }
    out.sort_by(|a, b| {
        b.rating
            .unwrap_or(f64::MIN)
            .total_cmp(&a.rating.unwrap_or(f64::MIN))
    });
    Ok(out)
}

/// Case-insensitive title search, best rated first.
pub async fn search<G: Gateway>(gateway: &G, text: &str) -> Result<Vec<Anime>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let query = Query::new()
        .ilike("title", format!("%{text}%"))
        .order_by("rating", false)
        .limit(SEARCH_LIMIT);
    gateway::fetch_many(gateway, ANIME_TABLE, &query).await
}

pub async fn anime<G: Gateway>(gateway: &G, id: &str) -> Result<Option<Anime>> {
    gateway::fetch_one(gateway, ANIME_TABLE, &Query::new().eq("id", id)).await
}

pub async fn episodes<G: Gateway>(gateway: &G, anime_id: &str) -> Result<Vec<Episode>> {
    let query = Query::new()
        .eq("anime_id", anime_id)
        .order_by("episode_number", true);
    gateway::fetch_many(gateway, EPISODES_TABLE, &query).await
}

pub async fn episode<G: Gateway>(gateway: &G, id: &str) -> Result<Option<Episode>> {
    gateway::fetch_one(gateway, EPISODES_TABLE, &Query::new().eq("id", id)).await
}

pub fn next_episode<'a>(episodes: &'a [Episode], current_id: &str) -> Option<&'a Episode> {
    let current = episodes.iter().find(|ep| ep.id == current_id)?;
    episodes
        .iter()
        .filter(|ep| ep.episode_number > current.episode_number)
        .min_by_key(|ep| ep.episode_number)
}

#[derive(Debug, Clone)]
pub struct ContinueItem {
    pub progress: WatchProgress,
    pub anime_title: String,
    pub episode: Option<Episode>,
}

impl ContinueItem {
    pub fn label(&self) -> String {
        let episode = self
            .episode
            .as_ref()
            .map(Episode::label)
            .unwrap_or_else(|| "Unknown episode".to_string());
        format!(
            "{} \u{00b7} {} \u{00b7} {:.0}%",
            self.anime_title,
            episode,
            self.progress.percent()
        )
    }
}

/// Unfinished episodes, most recently watched first.
pub async fn continue_watching<G: Gateway>(gateway: &G, user_id: &str) -> Result<Vec<ContinueItem>> {
    let query = Query::new()
        .eq("user_id", user_id)
        .eq("completed", false)
        .order_by("last_watched_at", false)
        .limit(CONTINUE_WATCHING_LIMIT);
    let rows: Vec<WatchProgress> = gateway::fetch_many(gateway, PROGRESS_TABLE, &query).await?;

    let mut titles: HashMap<String, String> = HashMap::new();
    let mut items = Vec::with_capacity(rows.len());
    for progress in rows {
        if !titles.contains_key(&progress.anime_id) {
            let title = anime(gateway, &progress.anime_id)
                .await?
                .map(|a| a.title)
                .unwrap_or_else(|| "Unknown title".to_string());
            titles.insert(progress.anime_id.clone(), title);
        }
        let episode = episode(gateway, &progress.episode_id).await?;
        items.push(ContinueItem {
            anime_title: titles[&progress.anime_id].clone(),
            episode,
            progress,
        });
    }
    Ok(items)
}

pub async fn watchlist<G: Gateway>(gateway: &G, user_id: &str) -> Result<Vec<Anime>> {
    let entries: Vec<WatchlistEntry> = gateway::fetch_many(
        gateway,
        WATCHLIST_TABLE,
        &Query::new()
            .eq("user_id", user_id)
            .order_by("added_at", false),
    )
    .await?;
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        if let Some(anime) = anime(gateway, &entry.anime_id).await? {
            out.push(anime);
        }
    }
    Ok(out)
}

pub async fn add_to_watchlist<G: Gateway>(gateway: &G, user_id: &str, anime_id: &str) -> Result<()> {
    if anime(gateway, anime_id).await?.is_none() {
        bail!("No anime with id {anime_id}");
    }
    let row = json!({
        "user_id": user_id,
        "anime_id": anime_id,
        "added_at": Utc::now(),
    });
    gateway
        .upsert(WATCHLIST_TABLE, &["user_id", "anime_id"], row)
        .await
}

pub async fn remove_from_watchlist<G: Gateway>(
    gateway: &G,
    user_id: &str,
    anime_id: &str,
) -> Result<()> {
    let query = Query::new().eq("user_id", user_id).eq("anime_id", anime_id);
    gateway.delete(WATCHLIST_TABLE, &query).await
}

#[derive(Debug, Clone)]
pub struct EpisodeUpload<'a> {
    pub anime_id: &'a str,
    pub episode_number: i32,
    pub title: Option<&'a str>,
    pub description: Option<&'a str>,
    pub video_file: Option<&'a Path>,
    pub video_url: Option<&'a str>,
    pub thumbnail_file: Option<&'a Path>,
}

/// Add an episode, uploading the video to object storage when a file is given.
pub async fn upload_episode<G: Gateway>(gateway: &G, upload: EpisodeUpload<'_>) -> Result<String> {
    if anime(gateway, upload.anime_id).await?.is_none() {
        bail!("No anime with id {}", upload.anime_id);
    }
    let object_name = |file: &Path| {
        let ext = file
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp4")
            .to_ascii_lowercase();
        (format!("{}/{}.{ext}", upload.anime_id, upload.episode_number), ext)
    };
    let video_url = match (upload.video_file, upload.video_url) {
        (Some(file), _) => {
            let (object_path, ext) = object_name(file);
            let bytes = read_file(file).await?;
            gateway
                .upload_object(VIDEO_BUCKET, &object_path, bytes, video_content_type(&ext))
                .await?
        }
        (None, Some(url)) if !url.trim().is_empty() => url.trim().to_string(),
        _ => bail!("Either a video file or a video URL is required"),
    };
    let thumbnail_url = match upload.thumbnail_file {
        Some(file) => {
            let (object_path, ext) = object_name(file);
            let bytes = read_file(file).await?;
            Some(
                gateway
                    .upload_object(THUMBNAIL_BUCKET, &object_path, bytes, image_content_type(&ext))
                    .await?,
            )
        }
        None => None,
    };
    let row = json!({
        "anime_id": upload.anime_id,
        "episode_number": upload.episode_number,
        "title": upload.title,
        "description": upload.description,
        "video_url": video_url,
        "thumbnail_url": thumbnail_url,
    });
    gateway.insert(EPISODES_TABLE, row).await?;
    Ok(video_url)
}

pub async fn delete_episode<G: Gateway>(gateway: &G, episode_id: &str) -> Result<()> {
    gateway
        .delete(EPISODES_TABLE, &Query::new().eq("id", episode_id))
        .await
}

async fn read_file(file: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))
}

fn image_content_type(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "webp" => "image/webp",
        _ => "image/jpeg",
    }
}

fn video_content_type(ext: &str) -> &'static str {
    match ext {
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        _ => "video/mp4",
    }
}
