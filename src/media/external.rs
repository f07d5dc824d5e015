//! Video and embedded-player segments, rendered by an external player process
//! (mpv) and controlled over its JSON IPC socket.
//!
//! Launch and IPC connect happen on a background task. Until the socket is up
//! the backend reports `Loading` and drops every control call; it does not
//! queue them. Mute is the exception: the latest mute intent is a launch
//! argument and is sent again the moment the connection attaches. The connect task checks its mount generation before publishing
//! the connection, so a player that comes up after its segment was torn down
//! is killed instead of attached.

use std::{
    path::Path,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::{mpsc, OnceCell},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::settings::MediaSettings;

use super::{Generation, MediaBackend, MediaStatus};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_POLL: Duration = Duration::from_millis(100);
const EMBED_WATCH_URL: &str = "https://www.youtube.com/watch?v=";

/// What the player process is asked to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerSource {
    Embedded { video_id: String },
    Video(String),
    Audio(String),
}

impl PlayerSource {
    fn target(&self) -> String {
        match self {
            PlayerSource::Embedded { video_id } => format!("{EMBED_WATCH_URL}{video_id}"),
            PlayerSource::Video(url) | PlayerSource::Audio(url) => url.clone(),
        }
    }

    fn args(&self) -> &'static [&'static str] {
        match self {
            // no on-screen controller: transport belongs to the operator console
            PlayerSource::Embedded { .. } => &["--force-window=yes", "--osc=no", "--ytdl=yes"],
            PlayerSource::Video(_) => &["--force-window=yes", "--osc=no", "--loop-file=inf"],
            PlayerSource::Audio(_) => &["--no-video", "--loop-file=inf"],
        }
    }
}

/// The external player installation, probed once per process.
#[derive(Debug, Clone)]
pub struct PlayerRuntime {
    pub executable: String,
    pub version: String,
    pub has_ytdl: bool,
}

static PLAYER_RUNTIME: OnceCell<std::result::Result<PlayerRuntime, String>> = OnceCell::const_new();

/// Resolves the player runtime. Only the first caller's `executable` is probed;
/// later callers share that result for the life of the process.
pub async fn player_runtime(executable: &str) -> std::result::Result<&'static PlayerRuntime, String> {
    PLAYER_RUNTIME
        .get_or_init(|| async {
            let probed = probe_runtime(executable).await.map_err(|err| format!("{err:#}"));
            match &probed {
                Ok(runtime) => log_info!(
                    "external player ready: {} (ytdl: {})",
                    runtime.version,
                    runtime.has_ytdl
                ),
                Err(reason) => log_warn!("external player unavailable: {}", reason),
            }
            probed
        })
        .await
        .as_ref()
        .map_err(Clone::clone)
}

async fn probe_runtime(executable: &str) -> Result<PlayerRuntime> {
    let output = Command::new(executable)
        .arg("--version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .with_context(|| format!("failed to launch {executable}; is it installed and on PATH?"))?;
    if !output.status.success() {
        return Err(anyhow!("{executable} --version exited with {}", output.status));
    }
    let version = String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or(executable)
        .trim()
        .to_string();

    Ok(PlayerRuntime {
        executable: executable.to_string(),
        version,
        has_ytdl: command_exists("yt-dlp").await,
    })
}

async fn command_exists(cmd: &str) -> bool {
    Command::new(cmd)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

enum Link {
    Connecting,
    Ready(mpsc::UnboundedSender<Value>),
    Failed(String),
    Disposed,
}

/// State shared between the backend handle and its background task.
#[derive(Clone)]
struct Mount {
    link: Arc<Mutex<Link>>,
    generation: Generation,
    cancel: CancellationToken,
    /// Last mute intent. Unlike play it is not dropped while connecting: the
    /// player starts with it and gets it again on attach.
    muted: Arc<AtomicBool>,
}

impl Mount {
    fn new(generation: Generation, muted: bool) -> Self {
        Self {
            link: Arc::new(Mutex::new(Link::Connecting)),
            generation,
            cancel: CancellationToken::new(),
            muted: Arc::new(AtomicBool::new(muted)),
        }
    }

    fn status(&self) -> MediaStatus {
        match &*lock_link(&self.link) {
            Link::Connecting => MediaStatus::Loading,
            Link::Ready(_) => MediaStatus::Ready,
            Link::Failed(reason) => MediaStatus::Unavailable(reason.clone()),
            Link::Disposed => MediaStatus::None,
        }
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Publishes the connection if this mount is still live and still waiting.
    fn attach(&self, tx: mpsc::UnboundedSender<Value>) -> bool {
        let mut guard = lock_link(&self.link);
        if !self.generation.is_live() || !matches!(*guard, Link::Connecting) {
            return false;
        }
        // under the link lock, so a concurrent set_muted is ordered after it
        let _ = tx.send(set_property("mute", self.is_muted()));
        *guard = Link::Ready(tx);
        true
    }

    fn fail(&self, reason: String, from_ready: bool) {
        let mut guard = lock_link(&self.link);
        let current = if from_ready {
            matches!(*guard, Link::Ready(_))
        } else {
            matches!(*guard, Link::Connecting)
        };
        if self.generation.is_live() && current {
            *guard = Link::Failed(reason);
        }
    }
}

/// Backend driving one external player process.
pub struct ExternalPlayer {
    mount: Mount,
}

impl ExternalPlayer {
    /// Starts launching the player in the background. Must be called inside a tokio runtime.
    pub fn launch(source: PlayerSource, generation: Generation, settings: &MediaSettings) -> Self {
        let mount = Mount::new(generation, settings.start_muted);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(run_player(source, settings.player_path.clone(), mount.clone()));
            }
            Err(_) => {
                *lock_link(&mount.link) =
                    Link::Failed("No async runtime for the external player".into());
            }
        }

        Self { mount }
    }

    fn send(&self, command: Value) {
        match &*lock_link(&self.mount.link) {
            Link::Ready(tx) => {
                if tx.send(command).is_err() {
                    log_debug!("player connection closed; command dropped");
                }
            }
            Link::Connecting => log_debug!(
                "player for generation {} not ready; command dropped",
                self.mount.generation.value()
            ),
            Link::Failed(_) | Link::Disposed => {}
        }
    }
}

impl MediaBackend for ExternalPlayer {
    fn play(&mut self) {
        self.send(set_property("pause", false));
    }

    fn pause(&mut self) {
        self.send(set_property("pause", true));
    }

    fn set_muted(&mut self, muted: bool) {
        self.mount.muted.store(muted, Ordering::SeqCst);
        self.send(set_property("mute", muted));
    }

    fn status(&self) -> MediaStatus {
        self.mount.status()
    }

    fn dispose(&mut self) {
        // dropping the sender ends the IPC pump, which kills the process
        *lock_link(&self.mount.link) = Link::Disposed;
        self.mount.cancel.cancel();
    }
}

impl Drop for ExternalPlayer {
    fn drop(&mut self) {
        self.mount.cancel.cancel();
    }
}

fn lock_link(link: &Mutex<Link>) -> MutexGuard<'_, Link> {
    match link.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn set_property(name: &str, value: bool) -> Value {
    json!({ "command": ["set_property", name, value] })
}

/// Command line for one player process. It starts paused, with the mount's
/// mute intent already applied.
fn launch_args(source: &PlayerSource, socket_path: &Path, muted: bool) -> Vec<String> {
    let mut args = vec![
        format!("--input-ipc-server={}", socket_path.display()),
        "--pause".to_string(),
        "--no-terminal".to_string(),
        format!("--mute={}", if muted { "yes" } else { "no" }),
    ];
    args.extend(source.args().iter().map(|arg| arg.to_string()));
    args.push(source.target());
    args
}

async fn run_player(source: PlayerSource, executable: String, mount: Mount) {
    let socket_path = std::env::temp_dir().join(format!("timekeeper-player-{}.sock", Uuid::new_v4()));

    let connected = tokio::select! {
        _ = mount.cancel.cancelled() => return,
        result = connect(&source, &executable, &socket_path, &mount) => result,
    };

    match connected {
        Ok((child, stream)) => serve(child, stream, &socket_path, &mount).await,
        Err(err) => {
            let reason = format!("{err:#}");
            if mount.generation.is_live() {
                log_warn!("Media player unavailable for {}: {}", source.target(), reason);
            }
            mount.fail(reason, false);
            let _ = std::fs::remove_file(&socket_path);
        }
    }
}

/// Attaches a connected player to its mount and pumps commands into it. A
/// player whose mount was superseded while it started is shut down instead.
async fn serve(mut child: Child, stream: IpcStream, socket_path: &Path, mount: &Mount) {
    let (tx, rx) = mpsc::unbounded_channel::<Value>();
    if !mount.attach(tx) {
        log_debug!(
            "player for stale generation {} came up late; shutting it down",
            mount.generation.value()
        );
        drop(stream);
        shutdown(&mut child, socket_path).await;
        return;
    }
    log_info!("player attached for generation {}", mount.generation.value());

    if let Some(reason) = pump(&mut child, stream, rx, &mount.cancel).await {
        mount.fail(reason, true);
    }
    shutdown(&mut child, socket_path).await;
}

async fn shutdown(child: &mut Child, socket_path: &Path) {
    let _ = child.kill().await;
    let _ = std::fs::remove_file(socket_path);
}

#[cfg(unix)]
type IpcStream = tokio::net::UnixStream;

#[cfg(unix)]
async fn connect(
    source: &PlayerSource,
    executable: &str,
    socket_path: &Path,
    mount: &Mount,
) -> Result<(Child, IpcStream)> {
    let runtime = player_runtime(executable).await.map_err(|reason| anyhow!(reason))?;
    if matches!(source, PlayerSource::Embedded { .. }) && !runtime.has_ytdl {
        log_warn!("yt-dlp not found; the player may fail to resolve embedded videos");
    }

    let mut child = Command::new(&runtime.executable)
        .args(launch_args(source, socket_path, mount.is_muted()))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to launch {}", runtime.executable))?;

    let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
    loop {
        if let Some(status) = child.try_wait().context("failed to poll player process")? {
            return Err(anyhow!("player exited before it was ready ({status})"));
        }
        match tokio::net::UnixStream::connect(socket_path).await {
            Ok(stream) => return Ok((child, stream)),
            Err(_) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(CONNECT_POLL).await;
            }
            Err(err) => {
                let _ = child.kill().await;
                return Err(anyhow!("player control socket never came up: {err}"));
            }
        }
    }
}

#[cfg(not(unix))]
type IpcStream = tokio::io::DuplexStream;

#[cfg(not(unix))]
async fn connect(
    _source: &PlayerSource,
    _executable: &str,
    _socket_path: &Path,
    _mount: &Mount,
) -> Result<(Child, IpcStream)> {
    Err(anyhow!("external player control needs Unix domain sockets"))
}

/// Forwards commands to the player until the mount goes away or the player
/// does. Returns a reason when the player side ended first.
async fn pump(
    child: &mut Child,
    stream: IpcStream,
    mut rx: mpsc::UnboundedReceiver<Value>,
    cancel: &CancellationToken,
) -> Option<String> {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut replies = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            command = rx.recv() => {
                let Some(command) = command else { return None };
                let mut line = command.to_string();
                line.push('\n');
                if let Err(err) = writer.write_all(line.as_bytes()).await {
                    log_warn!("player control write failed: {}", err);
                    return Some(format!("Player connection lost: {err}"));
                }
            }
            reply = replies.next_line() => match reply {
                Ok(Some(reply)) => inspect_reply(&reply),
                Ok(None) => return Some("Player closed its control socket".into()),
                Err(err) => return Some(format!("Player connection lost: {err}")),
            },
            status = child.wait() => {
                let reason = match status {
                    Ok(status) => format!("Player exited ({status})"),
                    Err(err) => format!("Player exited: {err}"),
                };
                log_warn!("{}", reason);
                return Some(reason);
            }
        }
    }
}

/// Playback refusals only surface here, as diagnostics.
fn inspect_reply(reply: &str) {
    let Ok(value) = serde_json::from_str::<Value>(reply) else {
        log_debug!("unparseable player reply: {}", reply);
        return;
    };
    match value.get("error").and_then(Value::as_str) {
        Some("success") | None => {}
        Some(error) => log_warn!("player rejected command: {}", error),
    }
    if let Some(event) = value.get("event").and_then(Value::as_str) {
        log_debug!("player event: {}", event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MountEpoch;

    #[test]
    fn builds_player_targets() {
        let embedded = PlayerSource::Embedded {
            video_id: "dQw4w9WgXcQ".into(),
        };
        assert_eq!(embedded.target(), "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert!(embedded.args().contains(&"--ytdl=yes"));

        let audio = PlayerSource::Audio("https://cdn.example.com/theme.mp3".into());
        assert_eq!(audio.target(), "https://cdn.example.com/theme.mp3");
        assert!(audio.args().contains(&"--no-video"));
    }

    #[test]
    fn transport_commands_are_ipc_property_writes() {
        assert_eq!(
            set_property("pause", false),
            json!({ "command": ["set_property", "pause", false] })
        );
        assert_eq!(
            set_property("mute", true),
            json!({ "command": ["set_property", "mute", true] })
        );
    }

    #[test]
    fn launch_outside_runtime_is_unavailable() {
        let epoch = MountEpoch::new();
        let mut player = ExternalPlayer::launch(
            PlayerSource::Video("/talks/intro.mp4".into()),
            epoch.begin(),
            &MediaSettings::default(),
        );
        assert!(matches!(player.status(), MediaStatus::Unavailable(_)));
        player.play();
        player.dispose();
        assert_eq!(player.status(), MediaStatus::None);
    }

    #[test]
    fn launch_arguments_carry_mute_intent() {
        let socket = Path::new("/tmp/timekeeper-player-test.sock");
        let source = PlayerSource::Video("/talks/intro.mp4".into());

        let args = launch_args(&source, socket, true);
        assert_eq!(args[0], "--input-ipc-server=/tmp/timekeeper-player-test.sock");
        assert!(args.contains(&"--pause".to_string()));
        assert!(args.contains(&"--mute=yes".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/talks/intro.mp4"));

        let args = launch_args(&source, socket, false);
        assert!(args.contains(&"--mute=no".to_string()));
        assert!(!args.contains(&"--mute=yes".to_string()));
    }

    #[tokio::test]
    async fn mute_intent_survives_connecting() {
        let epoch = MountEpoch::new();
        let settings = MediaSettings {
            player_path: "timekeeper-test-no-such-player".into(),
            ..MediaSettings::default()
        };
        let mut player = ExternalPlayer::launch(
            PlayerSource::Video("/talks/intro.mp4".into()),
            epoch.begin(),
            &settings,
        );
        assert!(!player.mount.is_muted());

        player.set_muted(true);
        assert!(player.mount.is_muted());
        player.set_muted(false);
        player.set_muted(true);
        assert!(player.mount.is_muted());
        player.dispose();
    }

    #[cfg(unix)]
    fn idle_child() -> Child {
        Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[cfg(unix)]
    fn test_socket_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("timekeeper-test-{}.sock", Uuid::new_v4()))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn late_player_for_a_superseded_mount_is_not_attached() {
        let epoch = MountEpoch::new();
        let mount = Mount::new(epoch.begin(), false);
        let _newer = epoch.begin();

        let (ours, mut theirs) = tokio::net::UnixStream::pair().unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            serve(idle_child(), ours, &test_socket_path(), &mount),
        )
        .await
        .unwrap();

        assert_eq!(mount.status(), MediaStatus::Loading);
        // our end was dropped without a single command
        let mut buf = [0u8; 64];
        let read = tokio::io::AsyncReadExt::read(&mut theirs, &mut buf).await.unwrap();
        assert_eq!(read, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn disposed_mount_is_not_attached() {
        let epoch = MountEpoch::new();
        let mount = Mount::new(epoch.begin(), false);
        *lock_link(&mount.link) = Link::Disposed;

        let (ours, _theirs) = tokio::net::UnixStream::pair().unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            serve(idle_child(), ours, &test_socket_path(), &mount),
        )
        .await
        .unwrap();
        assert_eq!(mount.status(), MediaStatus::None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn live_player_attaches_with_current_mute_first() {
        let epoch = MountEpoch::new();
        let mount = Mount::new(epoch.begin(), false);
        mount.muted.store(true, Ordering::SeqCst);

        let (ours, theirs) = tokio::net::UnixStream::pair().unwrap();
        let task = tokio::spawn({
            let mount = mount.clone();
            async move { serve(idle_child(), ours, &test_socket_path(), &mount).await }
        });

        let mut lines = BufReader::new(theirs).lines();
        let first = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&first).unwrap(),
            set_property("mute", true)
        );
        assert_eq!(mount.status(), MediaStatus::Ready);

        mount.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn calls_before_ready_are_dropped_and_dispose_wins() {
        let epoch = MountEpoch::new();
        let settings = MediaSettings {
            player_path: "timekeeper-test-no-such-player".into(),
            ..MediaSettings::default()
        };
        let mut player = ExternalPlayer::launch(
            PlayerSource::Video("/talks/intro.mp4".into()),
            epoch.begin(),
            &settings,
        );

        // not connected yet: these must neither panic nor block
        player.play();
        player.set_muted(true);

        player.dispose();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(player.status(), MediaStatus::None);
    }

    #[tokio::test]
    async fn stale_generation_does_not_publish_failure() {
        let epoch = MountEpoch::new();
        let settings = MediaSettings {
            player_path: "timekeeper-test-no-such-player".into(),
            ..MediaSettings::default()
        };
        let player = ExternalPlayer::launch(
            PlayerSource::Video("/talks/intro.mp4".into()),
            epoch.begin(),
            &settings,
        );
        // a newer mount supersedes this one before the connect attempt resolves
        let _next = epoch.begin();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(player.status(), MediaStatus::Loading);
    }
}
