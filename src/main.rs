use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::{Result, anyhow, bail};
use clap::{Parser, Subcommand};
use dialoguer::{FuzzySelect, Input, Password, Select};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod catalog;
mod config;
mod continuation;
mod gateway;
mod history;
mod mpv;
mod player;
mod progress;
mod session;
mod types;
mod watch;

use catalog::EpisodeUpload;
use config::{Settings, settings_path};
use gateway::rest::RestGateway;
use history::{HistoryRange, theme};
use mpv::MpvLauncher;
use session::{SessionContext, session_path};
use types::{Anime, AnimeKind, Episode, User};
use watch::Watcher;

#[derive(Debug, Parser)]
#[command(name = "anicat", about = "Browse the anime catalog and stream it via mpv.", version)]
struct Cli {
    /// Config file (defaults to the user config directory).
    #[arg(long, global = true, env = "ANICAT_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sign in with email and password.
    Login {
        #[arg(long)]
        email: Option<String>,
    },
    Logout,
    Whoami,
    /// List series (or movies), optionally limited to one category.
    Browse {
        #[arg(long)]
        movies: bool,
        #[arg(long, value_name = "NAME")]
        category: Option<String>,
        /// Newest additions of any kind.
        #[arg(long, conflicts_with_all = ["movies", "category"])]
        latest: bool,
    },
    Search {
        #[arg(required = true, value_name = "QUERY")]
        query: Vec<String>,
    },
    Watch {
        anime_id: String,
        #[arg(short = 'e', long, value_name = "EPISODE")]
        episode: Option<i32>,
    },
    /// Pick up an unfinished episode.
    Continue,
    History {
        #[arg(long, value_enum, default_value_t = HistoryRange::All)]
        since: HistoryRange,
        /// Delete the whole watch history.
        #[arg(long)]
        clear: bool,
    },
    Watchlist {
        #[command(subcommand)]
        action: Option<WatchlistAction>,
    },
    Admin {
        #[command(subcommand)]
        action: AdminAction,
    },
    Config {
        /// Write a starter config file.
        #[arg(long)]
        init: bool,
    },
}

#[derive(Debug, Subcommand)]
enum WatchlistAction {
    Add { anime_id: String },
    Remove { anime_id: String },
}

#[derive(Debug, Subcommand)]
enum AdminAction {
    UploadEpisode {
        anime_id: String,
        #[arg(long)]
        number: i32,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Local video file, uploaded to storage.
        #[arg(long, value_name = "FILE", conflicts_with = "url")]
        file: Option<PathBuf>,
        /// Existing video URL (direct file or Google Drive link).
        #[arg(long)]
        url: Option<String>,
        #[arg(long, value_name = "FILE")]
        thumbnail: Option<PathBuf>,
    },
    DeleteEpisode {
        episode_id: String,
    },
}

/// Where to start playing within a show.
enum StartAt {
    Pick,
    Number(i32),
    Episode(String),
}

struct App {
    settings: Settings,
    gateway: RestGateway,
    session: SessionContext,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let result = run().await;
    if let Err(err) = &result {
        eprintln!("error: {err:?}");
    }
    result
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    if let Command::Config { init } = &cli.command {
        return run_config(cli.config.as_deref(), *init);
    }

    let settings = Settings::load(cli.config.as_deref())?;
    let backend = settings.require_backend()?;
    let store = session_path()?;
    let gateway =
        RestGateway::new(&backend.url, &backend.anon_key)?.with_session_file(store.clone());
    let session = SessionContext::init(&gateway, store).await?;
    let app = App {
        settings,
        gateway,
        session,
    };

    match cli.command {
        Command::Login { email } => app.login(email).await,
        Command::Logout => app.logout().await,
        Command::Whoami => {
            match app.session.current() {
                Some(user) => println!("{}", describe(&user)),
                None => println!("Not signed in."),
            }
            Ok(())
        }
        Command::Browse {
            movies,
            category,
            latest,
        } => {
            if latest {
                app.latest().await
            } else {
                app.browse(movies, category.as_deref()).await
            }
        }
        Command::Search { query } => app.search(&query.join(" ")).await,
        Command::Watch { anime_id, episode } => {
            let Some(anime) = catalog::anime(&app.gateway, &anime_id).await? else {
                bail!("No anime with id {anime_id}");
            };
            let start = episode.map_or(StartAt::Pick, StartAt::Number);
            app.play(&anime, start).await
        }
        Command::Continue => app.resume().await,
        Command::History { since, clear } => app.history(since, clear).await,
        Command::Watchlist { action } => app.watchlist(action).await,
        Command::Admin { action } => app.admin(action).await,
        Command::Config { .. } => unreachable!("handled before the backend is configured"),
    }
}

fn run_config(path: Option<&Path>, init: bool) -> Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => settings_path()?,
    };
    if init {
        Settings::write_template(&path)?;
        println!("Wrote {}. Fill in backend.url and backend.anon_key.", path.display());
    } else {
        println!("{}", path.display());
    }
    Ok(())
}

fn describe(user: &User) -> String {
    match &user.email {
        Some(email) => format!("{email} ({})", user.id),
        None => user.id.clone(),
    }
}

impl App {
    fn require_user(&self) -> Result<User> {
        self.session
            .current()
            .ok_or_else(|| anyhow!("Not signed in. Run `anicat login` first."))
    }

    async fn login(&self, email: Option<String>) -> Result<()> {
        let email = match email {
            Some(email) => email,
            None => Input::<String>::with_theme(&theme())
                .with_prompt("Email")
                .interact_text()?,
        };
        let password = Password::with_theme(&theme())
            .with_prompt("Password")
            .interact()?;
        let user = self.session.sign_in(&self.gateway, &email, &password).await?;
        println!("Signed in as {}.", describe(&user));
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        if self.session.current().is_none() {
            println!("Not signed in.");
            return Ok(());
        }
        self.session.sign_out(&self.gateway).await?;
        println!("Signed out.");
        Ok(())
    }

    async fn browse(&self, movies: bool, category: Option<&str>) -> Result<()> {
        let kind = if movies {
            AnimeKind::Movie
        } else {
            AnimeKind::Series
        };
        let list = match category {
            Some(name) => catalog::anime_in_category(&self.gateway, name)
                .await?
                .into_iter()
                .filter(|anime| anime.kind.is_none_or(|k| k == kind))
                .collect(),
            None => catalog::list_by_kind(&self.gateway, kind).await?,
        };
        if list.is_empty() {
            println!("No {} found.", kind.label());
            return Ok(());
        }
        if let Some(anime) = pick_anime(&list, &format!("Select a {}", kind.label()))? {
            self.play(anime, StartAt::Pick).await?;
        }
        Ok(())
    }

    async fn latest(&self) -> Result<()> {
        let list = catalog::latest(&self.gateway).await?;
        if list.is_empty() {
            println!("Nothing has been added yet.");
            return Ok(());
        }
        if let Some(anime) = pick_anime(&list, "Latest anime")? {
            self.play(anime, StartAt::Pick).await?;
        }
        Ok(())
    }

    async fn search(&self, query: &str) -> Result<()> {
        let results = catalog::search(&self.gateway, query).await?;
        if results.is_empty() {
            bail!("No results for \"{query}\"");
        }
        if let Some(anime) = pick_anime(&results, "Select a show")? {
            self.play(anime, StartAt::Pick).await?;
        }
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        let user = self.require_user()?;
        let items = catalog::continue_watching(&self.gateway, &user.id).await?;
        if items.is_empty() {
            println!("Nothing to continue.");
            return Ok(());
        }
        let labels: Vec<String> = items.iter().map(|item| item.label()).collect();
        let Some(idx) = select(&labels, "Continue watching")? else {
            return Ok(());
        };
        let progress = &items[idx].progress;
        let Some(anime) = catalog::anime(&self.gateway, &progress.anime_id).await? else {
            bail!("Anime {} is no longer available", progress.anime_id);
        };
        self.play(&anime, StartAt::Episode(progress.episode_id.clone()))
            .await
    }

    async fn history(&self, range: HistoryRange, clear: bool) -> Result<()> {
        let user = self.require_user()?;
        if clear {
            history::clear(&self.gateway, &user.id).await?;
            println!("History cleared.");
            return Ok(());
        }

        let entries = history::list(&self.gateway, &user.id, range).await?;
        let mut shows: HashMap<String, Option<Anime>> = HashMap::new();
        let mut episodes: HashMap<String, Option<Episode>> = HashMap::new();
        let mut labels = Vec::with_capacity(entries.len());
        for entry in &entries {
            if !shows.contains_key(&entry.anime_id) {
                let anime = catalog::anime(&self.gateway, &entry.anime_id).await?;
                shows.insert(entry.anime_id.clone(), anime);
            }
            if !episodes.contains_key(&entry.episode_id) {
                let episode = catalog::episode(&self.gateway, &entry.episode_id).await?;
                episodes.insert(entry.episode_id.clone(), episode);
            }
            let title = shows[&entry.anime_id]
                .as_ref()
                .map_or("Unknown title".to_string(), |a| a.title.clone());
            let episode = episodes[&entry.episode_id]
                .as_ref()
                .map_or("Unknown episode".to_string(), Episode::label);
            labels.push(history::format_entry(entry, &title, &episode));
        }

        let Some(idx) = history::select_entry(&labels)? else {
            return Ok(());
        };
        let entry = &entries[idx];
        let Some(anime) = shows.remove(&entry.anime_id).flatten() else {
            bail!("Anime {} is no longer available", entry.anime_id);
        };
        self.play(&anime, StartAt::Episode(entry.episode_id.clone()))
            .await
    }

    async fn watchlist(&self, action: Option<WatchlistAction>) -> Result<()> {
        let user = self.require_user()?;
        match action {
            Some(WatchlistAction::Add { anime_id }) => {
                catalog::add_to_watchlist(&self.gateway, &user.id, &anime_id).await?;
                println!("Added {anime_id} to your watchlist.");
            }
            Some(WatchlistAction::Remove { anime_id }) => {
                catalog::remove_from_watchlist(&self.gateway, &user.id, &anime_id).await?;
                println!("Removed {anime_id} from your watchlist.");
            }
            None => {
                let list = catalog::watchlist(&self.gateway, &user.id).await?;
                if list.is_empty() {
                    println!("Your watchlist is empty.");
                    return Ok(());
                }
                if let Some(anime) = pick_anime(&list, "Watchlist")? {
                    self.play(anime, StartAt::Pick).await?;
                }
            }
        }
        Ok(())
    }

    async fn admin(&self, action: AdminAction) -> Result<()> {
        match action {
            AdminAction::UploadEpisode {
                anime_id,
                number,
                title,
                description,
                file,
                url,
                thumbnail,
            } => {
                let upload = EpisodeUpload {
                    anime_id: &anime_id,
                    episode_number: number,
                    title: title.as_deref(),
                    description: description.as_deref(),
                    video_file: file.as_deref(),
                    video_url: url.as_deref(),
                    thumbnail_file: thumbnail.as_deref(),
                };
                let video_url = catalog::upload_episode(&self.gateway, upload).await?;
                println!("Added episode {number} to {anime_id}: {video_url}");
            }
            AdminAction::DeleteEpisode { episode_id } => {
                catalog::delete_episode(&self.gateway, &episode_id).await?;
                println!("Deleted episode {episode_id}.");
            }
        }
        Ok(())
    }

    async fn play(&self, anime: &Anime, start: StartAt) -> Result<()> {
        let episodes = catalog::episodes(&self.gateway, &anime.id).await?;
        if episodes.is_empty() {
            bail!("No episodes available for {}", anime.title);
        }
        let categories = catalog::categories_of(&self.gateway, &anime.id).await?;
        println!("{}\n", anime.details(&categories));
        println!("{} episodes available.", episodes.len());

        let start_id = match start {
            StartAt::Episode(id) if episodes.iter().any(|ep| ep.id == id) => Some(id),
            StartAt::Number(n) => match episodes.iter().find(|ep| ep.episode_number == n) {
                Some(ep) => Some(ep.id.clone()),
                None => {
                    println!(
                        "Episode {n} does not exist for '{}'. Showing episode list.",
                        anime.title
                    );
                    pick_episode(&episodes)?
                }
            },
            StartAt::Episode(_) | StartAt::Pick => pick_episode(&episodes)?,
        };
        let Some(start_id) = start_id else {
            println!("Cancelled.");
            return Ok(());
        };

        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = stop_tx.send(true);
            }
        });
        let watcher = Watcher::new(
            &self.gateway,
            self.session.subscribe(),
            stop_rx,
            self.settings.tracking.flush_interval(),
        );
        let launcher = MpvLauncher::new(&self.settings.player);
        let result = watcher
            .watch_anime(&launcher, anime, &episodes, &start_id)
            .await;
        interrupt.abort();
        result
    }
}

fn pick_anime<'a>(list: &'a [Anime], prompt: &str) -> Result<Option<&'a Anime>> {
    let labels: Vec<String> = list.iter().map(Anime::label).collect();
    let selection = FuzzySelect::with_theme(&theme())
        .with_prompt(format!("{prompt} (Esc to cancel)"))
        .items(&labels)
        .default(0)
        .interact_opt()?;
    if selection.is_none() {
        println!("Cancelled.");
    }
    Ok(selection.map(|idx| &list[idx]))
}

fn pick_episode(episodes: &[Episode]) -> Result<Option<String>> {
    let labels: Vec<String> = episodes.iter().map(Episode::label).collect();
    Ok(select(&labels, "Select an episode")?.map(|idx| episodes[idx].id.clone()))
}

fn select(labels: &[String], prompt: &str) -> Result<Option<usize>> {
    let selection = Select::with_theme(&theme())
        .with_prompt(format!("{prompt} (Esc to cancel)"))
        .items(labels)
        .default(0)
        .interact_opt()?;
    Ok(selection)
}
