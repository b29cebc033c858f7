//! The playback surface: transport controls, key bindings and lifecycle
//! signals over a [`MediaBackend`].

use anyhow::{Result, bail};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use url::Url;

pub const ALLOWED_RATES: [f64; 6] = [0.5, 0.75, 1.0, 1.25, 1.5, 2.0];
pub const SEEK_STEP_SECONDS: f64 = 5.0;
pub const VOLUME_STEP: f64 = 0.1;

static DRIVE_FILE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/file/d/([^/?#]+)").expect("valid regex"));
static DRIVE_ID_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?&]id=([^&#]+)").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    /// Playable by the media backend; fully instrumented.
    Direct(String),
    /// Third-party viewer page. Opened as-is, no progress tracking.
    Embedded(String),
    Unsupported(String),
}

impl MediaSource {
    pub fn classify(video_url: Option<&str>) -> Self {
        let Some(raw) = video_url.map(str::trim).filter(|url| !url.is_empty()) else {
            return MediaSource::Unsupported("episode has no video source".to_string());
        };
        if is_google_drive_url(raw) {
            return match extract_google_drive_file_id(raw) {
                Some(id) => MediaSource::Embedded(google_drive_preview_url(&id)),
                None => MediaSource::Unsupported(format!("unrecognised Google Drive link {raw}")),
            };
        }
        match Url::parse(raw) {
            Ok(url) if matches!(url.scheme(), "http" | "https" | "file") => {
                MediaSource::Direct(raw.to_string())
            }
            Ok(url) => MediaSource::Unsupported(format!("unsupported scheme {}", url.scheme())),
            Err(_) if Path::new(raw).is_absolute() => MediaSource::Direct(raw.to_string()),
            Err(_) => MediaSource::Unsupported(format!("not a playable source: {raw}")),
        }
    }
}

pub fn is_google_drive_url(url: &str) -> bool {
    url.contains("drive.google.com")
}

pub fn extract_google_drive_file_id(url: &str) -> Option<String> {
    [&*DRIVE_FILE_PATH, &*DRIVE_ID_PARAM]
        .iter()
        .find_map(|re| re.captures(url))
        .map(|caps| caps[1].to_string())
}

pub fn google_drive_preview_url(file_id: &str) -> String {
    format!("https://drive.google.com/file/d/{file_id}/preview")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Space,
    Left,
    Right,
    Up,
    Down,
    Escape,
    Char(char),
}

impl Key {
    /// Key name in mpv's input syntax.
    pub fn mpv_name(self) -> String {
        match self {
            Key::Space => "SPACE".to_string(),
            Key::Left => "LEFT".to_string(),
            Key::Right => "RIGHT".to_string(),
            Key::Up => "UP".to_string(),
            Key::Down => "DOWN".to_string(),
            Key::Escape => "ESC".to_string(),
            Key::Char(c) => c.to_string(),
        }
    }

    pub fn from_mpv_name(name: &str) -> Option<Self> {
        match name {
            "SPACE" => Some(Key::Space),
            "LEFT" => Some(Key::Left),
            "RIGHT" => Some(Key::Right),
            "UP" => Some(Key::Up),
            "DOWN" => Some(Key::Down),
            "ESC" => Some(Key::Escape),
            _ => {
                let mut chars = name.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Some(Key::Char(c)),
                    _ => None,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeyAction {
    TogglePlay,
    SeekBy(f64),
    VolumeBy(f64),
    ToggleFullscreen,
    ToggleMute,
    /// Move through [`ALLOWED_RATES`] by this many steps.
    StepRate(i32),
    PlayNext,
    CancelAutoplay,
}

pub fn default_bindings() -> Vec<(Key, KeyAction)> {
    vec![
        (Key::Space, KeyAction::TogglePlay),
        (Key::Left, KeyAction::SeekBy(-SEEK_STEP_SECONDS)),
        (Key::Right, KeyAction::SeekBy(SEEK_STEP_SECONDS)),
        (Key::Up, KeyAction::VolumeBy(VOLUME_STEP)),
        (Key::Down, KeyAction::VolumeBy(-VOLUME_STEP)),
        (Key::Char('f'), KeyAction::ToggleFullscreen),
        (Key::Char('m'), KeyAction::ToggleMute),
        (Key::Char('['), KeyAction::StepRate(-1)),
        (Key::Char(']'), KeyAction::StepRate(1)),
        (Key::Char('n'), KeyAction::PlayNext),
        (Key::Escape, KeyAction::CancelAutoplay),
    ]
}

/// Lifecycle signals raised by the media backend.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackSignal {
    Play,
    Pause,
    TimeUpdate { position: f64, duration: f64 },
    Ended,
    /// The window entered or left fullscreen, by key or by the player itself.
    FullscreenChanged(bool),
    Key(Key),
}

/// The media element behind a [`PlaybackSurface`].
pub trait MediaBackend {
    async fn set_paused(&mut self, paused: bool) -> Result<()>;
    async fn seek(&mut self, seconds: f64) -> Result<()>;
    async fn set_volume(&mut self, volume: f64) -> Result<()>;
    async fn set_muted(&mut self, muted: bool) -> Result<()>;
    async fn set_speed(&mut self, speed: f64) -> Result<()>;
    async fn set_fullscreen(&mut self, fullscreen: bool) -> Result<()>;
    async fn show_text(&mut self, text: &str) -> Result<()>;
    /// Route presses of `keys` back as [`PlaybackSignal::Key`].
    async fn bind_keys(&mut self, keys: &[Key]) -> Result<()>;
    async fn unbind_keys(&mut self, keys: &[Key]) -> Result<()>;
    /// Next signal, or `None` once the media is gone. Must be cancel-safe.
    async fn next_signal(&mut self) -> Option<PlaybackSignal>;
}

/// What a key press asks of the surrounding session, beyond transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRequest {
    PlayNext,
    /// Esc: cancels a running countdown, otherwise leaves fullscreen.
    CancelAutoplay,
}

pub struct PlaybackSurface<B: MediaBackend> {
    backend: B,
    bindings: Vec<(Key, KeyAction)>,
    mounted: bool,
    playing: bool,
    position: f64,
    duration: f64,
    volume: f64,
    muted: bool,
    rate: f64,
    fullscreen: bool,
}

impl<B: MediaBackend> PlaybackSurface<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            bindings: default_bindings(),
            mounted: false,
            playing: false,
            position: 0.0,
            duration: 0.0,
            volume: 1.0,
            muted: false,
            rate: 1.0,
            fullscreen: false,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn playback_rate(&self) -> f64 {
        self.rate
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }

    fn bound_keys(&self) -> Vec<Key> {
        self.bindings.iter().map(|(key, _)| *key).collect()
    }

    pub async fn mount(&mut self) -> Result<()> {
        if self.mounted {
            return Ok(());
        }
        let keys = self.bound_keys();
        self.backend.bind_keys(&keys).await?;
        self.mounted = true;
        Ok(())
    }

    pub async fn unmount(&mut self) {
        if !self.mounted {
            return;
        }
        self.mounted = false;
        let keys = self.bound_keys();
        if let Err(err) = self.backend.unbind_keys(&keys).await {
            tracing::debug!("failed to release key bindings: {err:#}");
        }
    }

    /// Next lifecycle signal; internal state is updated before it is returned.
    pub async fn next_signal(&mut self) -> Option<PlaybackSignal> {
        let signal = self.backend.next_signal().await?;
        match &signal {
            PlaybackSignal::Play => self.playing = true,
            PlaybackSignal::Pause => self.playing = false,
            PlaybackSignal::TimeUpdate { position, duration } => {
                self.position = *position;
                if duration.is_finite() && *duration > 0.0 {
                    self.duration = *duration;
                }
            }
            PlaybackSignal::Ended => {
                self.playing = false;
                if self.duration > 0.0 {
                    self.position = self.duration;
                }
            }
            PlaybackSignal::FullscreenChanged(fullscreen) => self.fullscreen = *fullscreen,
            PlaybackSignal::Key(_) => {}
        }
        Some(signal)
    }

    pub async fn play(&mut self) -> Result<()> {
        self.backend.set_paused(false).await
    }

    pub async fn pause(&mut self) -> Result<()> {
        self.backend.set_paused(true).await
    }

    pub async fn toggle_play(&mut self) -> Result<()> {
        if self.playing {
            self.pause().await
        } else {
            self.play().await
        }
    }

    /// Seek, clamped to `[0, duration]` (or `>= 0` while duration is unknown).
    pub async fn seek_to(&mut self, seconds: f64) -> Result<()> {
        let mut target = seconds.max(0.0);
        if self.duration > 0.0 {
            target = target.min(self.duration);
        }
        self.backend.seek(target).await?;
        self.position = target;
        Ok(())
    }

    pub async fn seek_by(&mut self, delta: f64) -> Result<()> {
        self.seek_to(self.position + delta).await
    }

    pub async fn set_volume(&mut self, volume: f64) -> Result<()> {
        let volume = volume.clamp(0.0, 1.0);
        self.backend.set_volume(volume).await?;
        self.volume = volume;
        Ok(())
    }

    pub async fn toggle_mute(&mut self) -> Result<()> {
        let muted = !self.muted;
        self.backend.set_muted(muted).await?;
        self.muted = muted;
        Ok(())
    }

    pub async fn set_playback_rate(&mut self, rate: f64) -> Result<()> {
        if !ALLOWED_RATES.iter().any(|allowed| (allowed - rate).abs() < f64::EPSILON) {
            bail!("unsupported playback rate {rate}x");
        }
        self.backend.set_speed(rate).await?;
        self.rate = rate;
        Ok(())
    }

    pub async fn step_playback_rate(&mut self, steps: i32) -> Result<()> {
        let current = ALLOWED_RATES
            .iter()
            .position(|allowed| (allowed - self.rate).abs() < f64::EPSILON)
            .unwrap_or(2);
        let last = ALLOWED_RATES.len() as i32 - 1;
        let index = (current as i32 + steps).clamp(0, last) as usize;
        self.set_playback_rate(ALLOWED_RATES[index]).await
    }

    pub async fn exit_fullscreen(&mut self) -> Result<()> {
        self.set_fullscreen(false).await
    }

    pub async fn toggle_fullscreen(&mut self) -> Result<()> {
        self.set_fullscreen(!self.fullscreen).await
    }

    async fn set_fullscreen(&mut self, fullscreen: bool) -> Result<()> {
        self.backend.set_fullscreen(fullscreen).await?;
        self.fullscreen = fullscreen;
        Ok(())
    }

    pub async fn show_message(&mut self, text: &str) -> Result<()> {
        self.backend.show_text(text).await
    }

    /// Run the binding for `key`. Transport keys act directly; the rest are
    /// handed back to the session.
    pub async fn handle_key(&mut self, key: Key) -> Result<Option<SessionRequest>> {
        let Some(action) = self
            .bindings
            .iter()
            .find(|(bound, _)| *bound == key)
            .map(|(_, action)| *action)
        else {
            return Ok(None);
        };
        match action {
            KeyAction::TogglePlay => self.toggle_play().await?,
            KeyAction::SeekBy(delta) => self.seek_by(delta).await?,
            KeyAction::VolumeBy(delta) => self.set_volume(self.volume + delta).await?,
            KeyAction::ToggleFullscreen => self.toggle_fullscreen().await?,
            KeyAction::ToggleMute => self.toggle_mute().await?,
            KeyAction::StepRate(steps) => self.step_playback_rate(steps).await?,
            KeyAction::PlayNext => return Ok(Some(SessionRequest::PlayNext)),
            KeyAction::CancelAutoplay => return Ok(Some(SessionRequest::CancelAutoplay)),
        }
        Ok(None)
    }
}
