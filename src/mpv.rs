//! External mpv process driven over its JSON IPC socket.

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::PlayerConfig;
use crate::player::{Key, MediaBackend, PlaybackSignal};
use crate::watch::Launcher;

#[cfg(unix)]
type IpcStream = tokio::net::UnixStream;
#[cfg(windows)]
type IpcStream = tokio::net::windows::named_pipe::NamedPipeClient;

/// Commands waiting for mpv's reply, by `request_id`.
type Replies = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<(), String>>>>>;

const KEY_MESSAGE: &str = "anicat-key";
const CONNECT_ATTEMPTS: usize = 50;
const CONNECT_DELAY: Duration = Duration::from_millis(100);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const LOAD_TIMEOUT: Duration = Duration::from_secs(30);
const OSD_DURATION_MS: u64 = 3000;

const OBSERVE_TIME_POS: u64 = 1;
const OBSERVE_DURATION: u64 = 2;
const OBSERVE_PAUSE: u64 = 3;
const OBSERVE_FULLSCREEN: u64 = 4;
const OBSERVE_SEEKABLE: u64 = 5;

pub struct MpvBackend {
    child: Child,
    ipc_path: String,
    ipc: IpcClient<WriteHalf<IpcStream>>,
    signals: mpsc::UnboundedReceiver<PlaybackSignal>,
    loaded: watch::Receiver<bool>,
    reader: JoinHandle<()>,
}

impl MpvBackend {
    /// Start the player paused on `url` (at `start` seconds when given) and
    /// connect to its IPC server.
    pub async fn launch(
        player: &PlayerConfig,
        url: &str,
        title: &str,
        start: Option<f64>,
    ) -> Result<Self> {
        let (program, extra_args) = player.command_line()?;
        let ipc_path = ipc_path();

        let mut cmd = Command::new(&program);
        cmd.args(mpv_args(&extra_args, url, title, &ipc_path, start))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                bail!(
                    "Player '{}' not found. Install mpv or set player.command in the config.",
                    program
                );
            }
            Err(err) => {
                return Err(anyhow!(err).context(format!("failed to launch player '{program}'")));
            }
        };
        tracing::info!(%url, ?start, "spawned {program}");

        let stream = connect_with_retry(&mut child, &ipc_path).await?;
        let (read_half, writer) = tokio::io::split(stream);
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let (loaded_tx, loaded) = watch::channel(false);
        let replies = Replies::default();
        let events = IpcEvents {
            signals: signal_tx,
            replies: replies.clone(),
            loaded: loaded_tx,
        };
        let reader = tokio::spawn(read_events(BufReader::new(read_half), events));

        let mut backend = Self {
            child,
            ipc_path,
            ipc: IpcClient::new(writer, replies),
            signals,
            loaded,
            reader,
        };
        for (id, property) in [
            (OBSERVE_TIME_POS, "time-pos"),
            (OBSERVE_DURATION, "duration"),
            (OBSERVE_PAUSE, "pause"),
            (OBSERVE_FULLSCREEN, "fullscreen"),
            (OBSERVE_SEEKABLE, "seekable"),
        ] {
            backend
                .ipc
                .command(json!(["observe_property", id, property]))
                .await?;
        }
        Ok(backend)
    }

    /// mpv refuses seeks until the file is open.
    async fn wait_until_loaded(&mut self) -> Result<()> {
        if *self.loaded.borrow() {
            return Ok(());
        }
        match timeout(LOAD_TIMEOUT, self.loaded.wait_for(|loaded| *loaded)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => bail!("mpv closed before the media loaded"),
            Err(_) => bail!("media did not load within {}s", LOAD_TIMEOUT.as_secs()),
        }
    }
}

impl Drop for MpvBackend {
    fn drop(&mut self) {
        self.reader.abort();
        let _ = self.child.start_kill();
        #[cfg(unix)]
        let _ = std::fs::remove_file(&self.ipc_path);
    }
}

impl MediaBackend for MpvBackend {
    async fn set_paused(&mut self, paused: bool) -> Result<()> {
        self.ipc
            .command(json!(["set_property", "pause", paused]))
            .await
    }

    async fn seek(&mut self, seconds: f64) -> Result<()> {
        self.wait_until_loaded().await?;
        self.ipc
            .command(json!(["seek", seconds, "absolute"]))
            .await
    }

    async fn set_volume(&mut self, volume: f64) -> Result<()> {
        self.ipc
            .command(json!(["set_property", "volume", (volume * 100.0).round()]))
            .await
    }

    async fn set_muted(&mut self, muted: bool) -> Result<()> {
        self.ipc
            .command(json!(["set_property", "mute", muted]))
            .await
    }

    async fn set_speed(&mut self, speed: f64) -> Result<()> {
        self.ipc
            .command(json!(["set_property", "speed", speed]))
            .await
    }

    async fn set_fullscreen(&mut self, fullscreen: bool) -> Result<()> {
        self.ipc
            .command(json!(["set_property", "fullscreen", fullscreen]))
            .await
    }

    async fn show_text(&mut self, text: &str) -> Result<()> {
        self.ipc
            .command(json!(["show-text", text, OSD_DURATION_MS]))
            .await
    }

    async fn bind_keys(&mut self, keys: &[Key]) -> Result<()> {
        for key in keys {
            let name = key.mpv_name();
            let route = format!("script-message {KEY_MESSAGE} {name}");
            self.ipc
                .command(json!(["keybind", name, route]))
                .await
                .with_context(|| {
                    format!("could not bind {name}; anicat needs an mpv with the keybind command")
                })?;
        }
        Ok(())
    }

    async fn unbind_keys(&mut self, keys: &[Key]) -> Result<()> {
        for key in keys {
            self.ipc
                .command(json!(["keybind", key.mpv_name(), "ignore"]))
                .await?;
        }
        Ok(())
    }

    async fn next_signal(&mut self) -> Option<PlaybackSignal> {
        self.signals.recv().await
    }
}

/// Launches mpv for direct sources and the system browser for viewer pages.
pub struct MpvLauncher<'a> {
    player: &'a PlayerConfig,
}

impl<'a> MpvLauncher<'a> {
    pub fn new(player: &'a PlayerConfig) -> Self {
        Self { player }
    }
}

impl Launcher for MpvLauncher<'_> {
    type Backend = MpvBackend;

    async fn launch(&self, url: &str, title: &str, start: Option<f64>) -> Result<MpvBackend> {
        MpvBackend::launch(self.player, url, title, start).await
    }

    fn open_external(&self, url: &str) -> Result<()> {
        open::that(url).with_context(|| format!("failed to open {url}"))
    }
}

fn mpv_args(
    extra_args: &[String],
    url: &str,
    title: &str,
    ipc_path: &str,
    start: Option<f64>,
) -> Vec<String> {
    let mut args = extra_args.to_vec();
    args.extend(
        ["--quiet", "--terminal=no", "--pause", "--keep-open=no", "--idle=no"]
            .map(String::from),
    );
    if let Some(start) = start.filter(|s| s.is_finite() && *s > 0.0) {
        args.push(format!("--start={start}"));
    }
    args.push(format!("--force-media-title={title}"));
    args.push(format!("--input-ipc-server={ipc_path}"));
    args.push(url.to_string());
    args
}

/// Writes commands and waits for the matching reply from the reader task.
struct IpcClient<W> {
    writer: W,
    next_id: u64,
    replies: Replies,
}

impl<W: AsyncWrite + Unpin> IpcClient<W> {
    fn new(writer: W, replies: Replies) -> Self {
        Self {
            writer,
            next_id: 1,
            replies,
        }
    }

    async fn command(&mut self, command: Value) -> Result<()> {
        let id = self.next_id;
        self.next_id += 1;
        let name = command[0].as_str().unwrap_or("command").to_string();

        let (tx, rx) = oneshot::channel();
        pending(&self.replies).insert(id, tx);
        let mut line = json!({ "command": command, "request_id": id }).to_string();
        line.push('\n');
        if let Err(err) = self.write(&line).await {
            pending(&self.replies).remove(&id);
            return Err(err);
        }

        match timeout(REPLY_TIMEOUT, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(error))) => bail!("mpv rejected {name}: {error}"),
            Ok(Err(_)) => bail!("mpv closed the IPC connection before answering {name}"),
            Err(_) => {
                pending(&self.replies).remove(&id);
                bail!("mpv did not answer {name} within {}s", REPLY_TIMEOUT.as_secs())
            }
        }
    }

    async fn write(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(line.as_bytes())
            .await
            .context("failed to write to mpv IPC socket")?;
        self.writer.flush().await?;
        Ok(())
    }
}

fn pending(replies: &Replies) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<(), String>>>> {
    replies.lock().unwrap_or_else(PoisonError::into_inner)
}

fn ipc_path() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let name = format!("anicat-mpv-{}-{nanos}", std::process::id());
    if cfg!(windows) {
        format!(r"\\.\pipe\{name}")
    } else {
        std::env::temp_dir()
            .join(format!("{name}.sock"))
            .to_string_lossy()
            .into_owned()
    }
}

#[cfg(unix)]
async fn connect(path: &str) -> std::io::Result<IpcStream> {
    tokio::net::UnixStream::connect(path).await
}

#[cfg(windows)]
async fn connect(path: &str) -> std::io::Result<IpcStream> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(path)
}

async fn connect_with_retry(child: &mut Child, path: &str) -> Result<IpcStream> {
    let mut last_err = None;
    for _ in 0..CONNECT_ATTEMPTS {
        if let Some(status) = child.try_wait()? {
            bail!("player exited before opening its IPC socket ({status})");
        }
        match connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
        tokio::time::sleep(CONNECT_DELAY).await;
    }
    Err(anyhow!(
        "could not connect to mpv IPC at {path}: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

/// Where the reader task delivers what mpv sends.
struct IpcEvents {
    signals: mpsc::UnboundedSender<PlaybackSignal>,
    replies: Replies,
    loaded: watch::Sender<bool>,
}

impl IpcEvents {
    fn resolve(&self, id: u64, message: &Value) {
        let Some(tx) = pending(&self.replies).remove(&id) else {
            return;
        };
        let outcome = match message["error"].as_str() {
            Some("success") => Ok(()),
            Some(error) => Err(error.to_string()),
            None => Err("malformed reply".to_string()),
        };
        let _ = tx.send(outcome);
    }
}

async fn read_events<R>(mut reader: BufReader<R>, events: IpcEvents)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut tracker = EventTracker::default();
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!("mpv IPC read failed: {err}");
                break;
            }
        }
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        if message.get("event").is_none() {
            if let Some(id) = message["request_id"].as_u64() {
                events.resolve(id, &message);
            }
            continue;
        }
        if marks_loaded(&message) {
            events.loaded.send_replace(true);
        }
        if let Some(signal) = tracker.translate(&message)
            && events.signals.send(signal).is_err()
        {
            break;
        }
    }
    // fail whatever is still waiting for an answer
    pending(&events.replies).clear();
}

/// `file-loaded`, or a first real `seekable` value, means seeks will stick.
fn marks_loaded(message: &Value) -> bool {
    match message["event"].as_str() {
        Some("file-loaded") => true,
        Some("property-change") => {
            message["name"].as_str() == Some("seekable") && message["data"].is_boolean()
        }
        _ => false,
    }
}

/// Turns mpv IPC event messages into [`PlaybackSignal`]s.
#[derive(Debug, Default)]
struct EventTracker {
    position: f64,
    duration: f64,
    paused: Option<bool>,
}

impl EventTracker {
    fn translate(&mut self, message: &Value) -> Option<PlaybackSignal> {
        match message["event"].as_str()? {
            "property-change" => match message["name"].as_str()? {
                "time-pos" => {
                    self.position = message["data"].as_f64()?;
                    Some(self.time_update())
                }
                "duration" => {
                    self.duration = message["data"].as_f64()?;
                    Some(self.time_update())
                }
                "fullscreen" => Some(PlaybackSignal::FullscreenChanged(
                    message["data"].as_bool()?,
                )),
                "pause" => {
                    let paused = message["data"].as_bool()?;
                    if self.paused == Some(paused) {
                        return None;
                    }
                    self.paused = Some(paused);
                    Some(if paused {
                        PlaybackSignal::Pause
                    } else {
                        PlaybackSignal::Play
                    })
                }
                _ => None,
            },
            "end-file" if message["reason"].as_str() == Some("eof") => Some(PlaybackSignal::Ended),
            "client-message" => {
                let args = message["args"].as_array()?;
                if args.first()?.as_str()? != KEY_MESSAGE {
                    return None;
                }
                Key::from_mpv_name(args.get(1)?.as_str()?).map(PlaybackSignal::Key)
            }
            _ => None,
        }
    }

    fn time_update(&self) -> PlaybackSignal {
        PlaybackSignal::TimeUpdate {
            position: self.position,
            duration: self.duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_changes_become_time_updates() {
        let mut tracker = EventTracker::default();
        assert_eq!(
            tracker.translate(&json!({"event": "property-change", "id": 2, "name": "duration", "data": 1440.5})),
            Some(PlaybackSignal::TimeUpdate { position: 0.0, duration: 1440.5 })
        );
        assert_eq!(
            tracker.translate(&json!({"event": "property-change", "id": 1, "name": "time-pos", "data": 12.25})),
            Some(PlaybackSignal::TimeUpdate { position: 12.25, duration: 1440.5 })
        );
        assert_eq!(
            tracker.translate(&json!({"event": "property-change", "id": 1, "name": "time-pos", "data": null})),
            None
        );
    }

    #[test]
    fn pause_property_is_deduplicated() {
        let mut tracker = EventTracker::default();
        let paused = json!({"event": "property-change", "name": "pause", "data": true});
        let playing = json!({"event": "property-change", "name": "pause", "data": false});
        assert_eq!(tracker.translate(&paused), Some(PlaybackSignal::Pause));
        assert_eq!(tracker.translate(&paused), None);
        assert_eq!(tracker.translate(&playing), Some(PlaybackSignal::Play));
    }

    #[test]
    fn only_eof_counts_as_ended() {
        let mut tracker = EventTracker::default();
        assert_eq!(
            tracker.translate(&json!({"event": "end-file", "reason": "eof"})),
            Some(PlaybackSignal::Ended)
        );
        assert_eq!(
            tracker.translate(&json!({"event": "end-file", "reason": "quit"})),
            None
        );
    }

    #[test]
    fn routed_key_messages_become_key_signals() {
        let mut tracker = EventTracker::default();
        assert_eq!(
            tracker.translate(&json!({"event": "client-message", "args": ["anicat-key", "SPACE"]})),
            Some(PlaybackSignal::Key(Key::Space))
        );
        assert_eq!(
            tracker.translate(&json!({"event": "client-message", "args": ["anicat-key", "n"]})),
            Some(PlaybackSignal::Key(Key::Char('n')))
        );
        assert_eq!(
            tracker.translate(&json!({"event": "client-message", "args": ["other", "SPACE"]})),
            None
        );
    }

    fn events() -> (
        IpcEvents,
        mpsc::UnboundedReceiver<PlaybackSignal>,
        watch::Receiver<bool>,
    ) {
        let (signals, rx) = mpsc::unbounded_channel();
        let (loaded, loaded_rx) = watch::channel(false);
        let events = IpcEvents {
            signals,
            replies: Replies::default(),
            loaded,
        };
        (events, rx, loaded_rx)
    }

    #[test]
    fn launch_arguments_start_at_the_resume_point() {
        let extra = vec!["--profile=fast".to_string()];
        let args = mpv_args(&extra, "https://cdn.example.com/1.mp4", "Show", "/tmp/s.sock", Some(45.0));

        assert_eq!(args[0], "--profile=fast");
        assert!(args.contains(&"--start=45".to_string()), "{args:?}");
        assert!(args.contains(&"--pause".to_string()));
        assert!(args.contains(&"--input-ipc-server=/tmp/s.sock".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("https://cdn.example.com/1.mp4"));

        let fresh = mpv_args(&[], "/srv/1.mkv", "Show", "/tmp/s.sock", None);
        assert!(!fresh.iter().any(|arg| arg.starts_with("--start")));
        let zero = mpv_args(&[], "/srv/1.mkv", "Show", "/tmp/s.sock", Some(0.0));
        assert!(!zero.iter().any(|arg| arg.starts_with("--start")));
    }

    #[test]
    fn fullscreen_property_is_reported() {
        let mut tracker = EventTracker::default();
        assert_eq!(
            tracker.translate(&json!({"event": "property-change", "name": "fullscreen", "data": true})),
            Some(PlaybackSignal::FullscreenChanged(true))
        );
    }

    #[test]
    fn load_markers() {
        assert!(marks_loaded(&json!({"event": "file-loaded"})));
        assert!(marks_loaded(
            &json!({"event": "property-change", "name": "seekable", "data": false})
        ));
        assert!(!marks_loaded(
            &json!({"event": "property-change", "name": "seekable"})
        ));
        assert!(!marks_loaded(&json!({"event": "start-file"})));
    }

    #[tokio::test]
    async fn reader_forwards_signals_until_eof() {
        let input = concat!(
            "{\"event\":\"property-change\",\"name\":\"pause\",\"data\":false}\n",
            "{\"request_id\":1,\"error\":\"success\"}\n",
            "not json\n",
            "{\"event\":\"file-loaded\"}\n",
            "{\"event\":\"end-file\",\"reason\":\"eof\"}\n",
        );
        let (events, mut rx, loaded) = events();

        read_events(BufReader::new(input.as_bytes()), events).await;

        assert_eq!(rx.recv().await, Some(PlaybackSignal::Play));
        assert_eq!(rx.recv().await, Some(PlaybackSignal::Ended));
        assert_eq!(rx.recv().await, None);
        assert!(*loaded.borrow());
    }

    #[tokio::test]
    async fn replies_are_matched_to_their_request() {
        let input = concat!(
            "{\"request_id\":2,\"error\":\"invalid parameter\"}\n",
            "{\"request_id\":1,\"error\":\"success\",\"data\":null}\n",
        );
        let (events, _rx, _loaded) = events();
        let replies = events.replies.clone();
        let (first_tx, first) = oneshot::channel();
        let (second_tx, second) = oneshot::channel();
        let (third_tx, third) = oneshot::channel();
        pending(&replies).insert(1, first_tx);
        pending(&replies).insert(2, second_tx);
        pending(&replies).insert(3, third_tx);

        read_events(BufReader::new(input.as_bytes()), events).await;

        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(second.await.unwrap(), Err("invalid parameter".to_string()));
        // never answered before the socket closed
        assert!(third.await.is_err());
        assert!(pending(&replies).is_empty());
    }

    #[tokio::test]
    async fn rejected_command_is_an_error() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (our_read, our_write) = tokio::io::split(ours);
        let (events, _rx, _loaded) = events();
        let mut client = IpcClient::new(our_write, events.replies.clone());
        tokio::spawn(read_events(BufReader::new(our_read), events));

        // stand-in for mpv: accept the first command, reject the second
        let player = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(theirs);
            let mut lines = BufReader::new(read).lines();
            for error in ["success", "unknown command"] {
                let line = lines.next_line().await.unwrap().unwrap();
                let request: Value = serde_json::from_str(&line).unwrap();
                let reply = json!({"request_id": request["request_id"], "error": error});
                write
                    .write_all(format!("{reply}\n").as_bytes())
                    .await
                    .unwrap();
            }
        });

        client
            .command(json!(["set_property", "pause", false]))
            .await
            .unwrap();
        let err = client
            .command(json!(["keybind", "n", "script-message anicat-key n"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("mpv rejected keybind: unknown command"), "{err}");
        player.await.unwrap();
    }
}
