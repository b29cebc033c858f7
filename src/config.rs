use anyhow::{Context, Result, anyhow, bail};
use ::config::{Config, Environment, File};
use dirs_next::config_dir;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

const ENV_PREFIX: &str = "ANICAT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub backend: BackendConfig,
    pub player: PlayerConfig,
    pub tracking: TrackingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`.
    pub url: String,
    /// Public (anon) API key sent with every request.
    pub anon_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Player command line; extra arguments are allowed, e.g. `mpv --profile=fast`.
    pub command: String,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            command: "mpv".to_string(),
        }
    }
}

impl PlayerConfig {
    pub fn command_line(&self) -> Result<(String, Vec<String>)> {
        let mut parts = shlex::split(&self.command)
            .ok_or_else(|| anyhow!("could not parse player command `{}`", self.command))?;
        if parts.is_empty() {
            bail!("player command is empty");
        }
        let program = parts.remove(0);
        Ok((program, parts))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub flush_interval_secs: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 10,
        }
    }
}

impl TrackingConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

impl Settings {
    /// Defaults, then the TOML file (if present), then `ANICAT_*` variables
    /// (`ANICAT_BACKEND__URL`, `ANICAT_PLAYER__COMMAND`, ...).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => settings_path()?,
        };
        Config::builder()
            .add_source(File::from(path.clone()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("failed to read config {}", path.display()))?
            .try_deserialize()
            .with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn require_backend(&self) -> Result<&BackendConfig> {
        if self.backend.url.trim().is_empty() || self.backend.anon_key.trim().is_empty() {
            bail!(
                "backend.url and backend.anon_key must be set (run `anicat config --init` or set ANICAT_BACKEND__URL / ANICAT_BACKEND__ANON_KEY)"
            );
        }
        Ok(&self.backend)
    }

    pub fn write_template(path: &Path) -> Result<()> {
        if path.exists() {
            bail!("config file {} already exists", path.display());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }
        let data = toml::to_string_pretty(&Settings::default())?;
        fs::write(path, data)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }
}

pub fn settings_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| anyhow!("Could not determine config directory"))?;
    Ok(base.join("anicat").join("config.toml"))
}
