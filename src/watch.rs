//! One viewing session: drives a [`PlaybackSurface`] and wires its signals
//! into progress tracking and next-episode continuation.

use anyhow::Result;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};

use crate::catalog;
use crate::continuation::{ContinuationController, Tick};
use crate::gateway::Gateway;
use crate::player::{MediaBackend, MediaSource, PlaybackSignal, PlaybackSurface, SessionRequest};
use crate::progress::{ProgressRecorder, ProgressSnapshot};
use crate::types::{Anime, Episode, TrackingTarget, User};

/// Starts the media backend for a playable source.
pub trait Launcher {
    type Backend: MediaBackend;

    /// Start playing `url`, paused, positioned at `start` seconds when given.
    async fn launch(&self, url: &str, title: &str, start: Option<f64>) -> Result<Self::Backend>;
    /// Hand a viewer page to the system browser.
    fn open_external(&self, url: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpisodeOutcome {
    /// Continue with this episode id.
    Advance(String),
    /// Stream ended and nothing follows (or autoplay was cancelled).
    Finished,
    /// The player went away on its own.
    Closed,
    /// Shutdown was requested from outside.
    Unmounted,
}

pub struct Watcher<'a, G: Gateway> {
    gateway: &'a G,
    identity: watch::Receiver<Option<User>>,
    shutdown: watch::Receiver<bool>,
    flush_interval: Duration,
}

impl<'a, G: Gateway> Watcher<'a, G> {
    pub fn new(
        gateway: &'a G,
        identity: watch::Receiver<Option<User>>,
        shutdown: watch::Receiver<bool>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            gateway,
            identity,
            shutdown,
            flush_interval,
        }
    }

    /// Play `start_episode` and keep going through `episodes` as long as the
    /// continuation controller advances.
    pub async fn watch_anime<L: Launcher>(
        &self,
        launcher: &L,
        anime: &Anime,
        episodes: &[Episode],
        start_episode: &str,
    ) -> Result<()> {
        let mut current = episodes.iter().find(|ep| ep.id == start_episode);
        let mut controller = ContinuationController::new(None);

        while let Some(episode) = current {
            let next = catalog::next_episode(episodes, &episode.id).map(|ep| ep.id.clone());
            let title = format!("{} \u{00b7} {}", anime.title, episode.label());

            let url = match MediaSource::classify(episode.video_url.as_deref()) {
                MediaSource::Direct(url) => url,
                MediaSource::Embedded(url) => {
                    println!("Opening {title} in the browser (progress is not tracked there).");
                    launcher.open_external(&url)?;
                    return Ok(());
                }
                MediaSource::Unsupported(reason) => {
                    println!("Cannot play {title}: {reason}.");
                    return Ok(());
                }
            };

            let target = TrackingTarget::resolve(
                self.identity.borrow().as_ref(),
                &anime.id,
                Some(&episode.id),
            );
            if target.is_none() {
                tracing::info!("not signed in; watch progress will not be saved");
            }
            let mut recorder = ProgressRecorder::new(self.gateway, target);
            let resume = recorder.resume_point().await;

            println!("Playing {title}");
            let backend = launcher
                .launch(&url, &title, resume.map(|secs| secs as f64))
                .await?;
            let mut surface = PlaybackSurface::new(backend);
            controller.reset(next);

            match self
                .play_episode(&mut surface, recorder, resume, &mut controller)
                .await?
            {
                EpisodeOutcome::Advance(next_id) => {
                    current = episodes.iter().find(|ep| ep.id == next_id);
                }
                EpisodeOutcome::Finished => {
                    println!("Finished {title}.");
                    current = None;
                }
                EpisodeOutcome::Closed | EpisodeOutcome::Unmounted => current = None,
            }
        }
        Ok(())
    }

    /// Drive one mounted episode until it ends, advances, closes or is
    /// shut down. Progress is flushed on the interval while playing, on
    /// pause, on end and on teardown.
    pub async fn run_episode<B: MediaBackend>(
        &self,
        surface: &mut PlaybackSurface<B>,
        target: Option<TrackingTarget>,
        controller: &mut ContinuationController,
    ) -> Result<EpisodeOutcome> {
        let mut recorder = ProgressRecorder::new(self.gateway, target);
        let resume = recorder.resume_point().await;
        self.play_episode(surface, recorder, resume, controller).await
    }

    async fn play_episode<B: MediaBackend>(
        &self,
        surface: &mut PlaybackSurface<B>,
        recorder: ProgressRecorder<'a, G>,
        resume: Option<u64>,
        controller: &mut ContinuationController,
    ) -> Result<EpisodeOutcome> {
        surface.mount().await?;
        let outcome = self.drive(surface, recorder, resume, controller).await;
        surface.unmount().await;
        Ok(outcome)
    }

    async fn drive<B: MediaBackend>(
        &self,
        surface: &mut PlaybackSurface<B>,
        mut recorder: ProgressRecorder<'a, G>,
        resume: Option<u64>,
        controller: &mut ContinuationController,
    ) -> EpisodeOutcome {
        let mut identity = self.identity.clone();
        let mut shutdown = self.shutdown.clone();
        let mut identity_open = true;
        let mut shutdown_open = true;
        let mut ticker: Option<Interval> = None;

        if *shutdown.borrow_and_update() {
            return EpisodeOutcome::Unmounted;
        }

        if let Some(resume) = resume {
            match surface.seek_to(resume as f64).await {
                Ok(()) => notify(surface, &format!("Resuming from {}", clock(resume))).await,
                Err(err) => tracing::warn!("failed to seek to saved position: {err:#}"),
            }
        }
        if let Err(err) = surface.play().await {
            tracing::warn!("failed to start playback: {err:#}");
        }

        loop {
            tokio::select! {
                changed = shutdown.changed(), if shutdown_open => match changed {
                    Ok(()) => {
                        if *shutdown.borrow_and_update() {
                            recorder.flush(snapshot(surface)).await;
                            return EpisodeOutcome::Unmounted;
                        }
                    }
                    Err(_) => shutdown_open = false,
                },
                changed = identity.changed(), if identity_open => match changed {
                    Ok(()) => {
                        let user = identity.borrow_and_update().clone();
                        let same_user = matches!(
                            (user.as_ref(), recorder.target()),
                            (Some(user), Some(target)) if user.id == target.user_id
                        );
                        if recorder.is_active() && !same_user {
                            tracing::info!("session changed; progress tracking stopped");
                            recorder.detach();
                        }
                    }
                    Err(_) => identity_open = false,
                },
                _ = next_tick(&mut ticker) => {
                    recorder.flush(snapshot(surface)).await;
                }
                signal = surface.next_signal() => match signal {
                    None => {
                        recorder.flush(snapshot(surface)).await;
                        return EpisodeOutcome::Closed;
                    }
                    Some(PlaybackSignal::Play) => {
                        if ticker.is_none() {
                            ticker = Some(flush_ticker(self.flush_interval));
                        }
                    }
                    Some(PlaybackSignal::Pause) => {
                        // mpv reports its initial paused state too; only a
                        // real pause after playback is worth a write.
                        if ticker.take().is_some() {
                            recorder.flush(snapshot(surface)).await;
                        }
                    }
                    Some(PlaybackSignal::TimeUpdate { position, duration }) => {
                        match controller.on_time_update(position, duration) {
                            Tick::Armed { remaining } | Tick::Countdown { remaining } => {
                                notify(surface, &countdown_message(remaining)).await;
                            }
                            Tick::Unchanged => {}
                        }
                    }
                    Some(PlaybackSignal::Ended) => {
                        recorder.flush(snapshot(surface)).await;
                        return match controller.on_ended() {
                            Some(next) => EpisodeOutcome::Advance(next),
                            None => EpisodeOutcome::Finished,
                        };
                    }
                    Some(PlaybackSignal::FullscreenChanged(_)) => {}
                    Some(PlaybackSignal::Key(key)) => match surface.handle_key(key).await {
                        Ok(Some(SessionRequest::PlayNext)) => match controller.play_now() {
                            Some(next) => {
                                recorder.flush(snapshot(surface)).await;
                                return EpisodeOutcome::Advance(next);
                            }
                            None => notify(surface, "No next episode").await,
                        },
                        Ok(Some(SessionRequest::CancelAutoplay)) => {
                            if controller.cancel() {
                                notify(surface, "Autoplay cancelled").await;
                            } else if surface.is_fullscreen()
                                && let Err(err) = surface.exit_fullscreen().await
                            {
                                tracing::warn!("failed to leave fullscreen: {err:#}");
                            }
                        }
                        Ok(None) => {}
                        Err(err) => tracing::warn!(?key, "key action failed: {err:#}"),
                    },
                },
            }
        }
    }
}

fn snapshot<B: MediaBackend>(surface: &PlaybackSurface<B>) -> ProgressSnapshot {
    ProgressSnapshot::from_position(surface.position(), surface.duration())
}

fn flush_ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn notify<B: MediaBackend>(surface: &mut PlaybackSurface<B>, text: &str) {
    if let Err(err) = surface.show_message(text).await {
        tracing::debug!("failed to show message: {err:#}");
    }
}

fn countdown_message(remaining: u64) -> String {
    format!("Next episode in {remaining}s \u{00b7} n: play now \u{00b7} Esc: cancel")
}

fn clock(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}
