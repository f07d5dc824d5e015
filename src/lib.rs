pub mod media;
pub mod models;
pub mod player;
pub mod session;
pub mod settings;
pub mod utils;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use media::{placeholder::PlaceholderFactory, DesktopDriverFactory, MediaDriverFactory};
use models::Plan;
use player::{
    commands::HELP, dispatch, AdvancePolicy, CommandOutcome, ControllerOptions, PlayerSnapshot,
    TransportCommand,
};
use session::{start_session, SessionExit};
use settings::{PlaybackSettings, SettingsStore};
use utils::format_clock;

/// Runs a presentation plan against the clock.
#[derive(Parser, Debug)]
#[command(name = "timekeeper", version, about)]
pub struct Cli {
    /// Plan exported by the planner (JSON)
    pub plan: PathBuf,

    /// Settings file (defaults to $XDG_CONFIG_HOME/timekeeper/settings.json)
    #[arg(long, env = "TIMEKEEPER_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Do not start any media backend
    #[arg(long)]
    pub no_media: bool,

    /// Log at debug level
    #[arg(short, long)]
    pub verbose: bool,
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    log::info!("Timekeeper starting up...");

    let result = tokio::runtime::Runtime::new()
        .context("Failed to start the async runtime")
        .and_then(|runtime| {
            let result = runtime.block_on(run_cli(cli));
            // A pending stdin read would otherwise hold the runtime open
            runtime.shutdown_timeout(Duration::from_millis(200));
            result
        });

    if let Err(err) = result {
        error!("{:#}", err);
        std::process::exit(1);
    }
}

async fn run_cli(cli: Cli) -> Result<()> {
    let settings_path = match cli.settings {
        Some(path) => path,
        None => SettingsStore::default_path()
            .ok_or_else(|| anyhow!("Cannot locate a config directory; pass --settings"))?,
    };
    let settings = SettingsStore::new(settings_path)?;
    info!("Using settings at {}", settings.path().display());

    let plan = Plan::from_json_file(&cli.plan)?;

    let factory: Arc<dyn MediaDriverFactory> = if cli.no_media {
        Arc::new(PlaceholderFactory::new())
    } else {
        Arc::new(DesktopDriverFactory::new(settings.media()))
    };
    let options = ControllerOptions::from_settings(&settings.snapshot());

    let session = start_session(plan, factory, options);
    let controller = session.controller().clone();

    println!("{}", session.plan().title);
    println!("{HELP}");

    let mut updates = controller.subscribe();
    let renderer = tokio::spawn(async move {
        let mut last: Option<StatusKey> = None;
        loop {
            let key = {
                let snapshot = updates.borrow_and_update();
                let key = StatusKey::of(&snapshot);
                if last.as_ref() != Some(&key) {
                    println!("{}", status_line(&snapshot));
                }
                key
            };
            last = Some(key);
            if updates.changed().await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let after = loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read from stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break session::AfterSession::Planning;
        };

        let command = match line.parse::<TransportCommand>() {
            Ok(command) => command,
            Err(err) => {
                println!("{err:#} (type `help` for commands)");
                continue;
            }
        };

        if let TransportCommand::AutoAdvance(policy) = command {
            remember_advance_policy(&settings, policy);
        }

        match dispatch(&controller, command).await {
            CommandOutcome::Snapshot(snapshot) => {
                if command == TransportCommand::Status {
                    println!("{}", status_line(&snapshot));
                }
            }
            CommandOutcome::Link(Some(link)) => println!("{link}"),
            CommandOutcome::Link(None) => println!("No related link for this segment"),
            CommandOutcome::Help => println!("{HELP}"),
            CommandOutcome::End(after) => break after,
        }
    };

    let exit = session.end(after).await;
    renderer.abort();

    if let SessionExit::Summary(summary) = exit {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(())
}

/// Keeps `auto on|off` as the default for later sessions.
fn remember_advance_policy(settings: &SettingsStore, policy: AdvancePolicy) {
    let playback = PlaybackSettings {
        continue_on_advance: policy.continues(),
    };
    if settings.playback() == playback {
        return;
    }
    if let Err(err) = settings.update_playback(playback) {
        warn!("Failed to save playback settings: {:#}", err);
    }
}

/// The parts of a snapshot worth a new status line; the countdowns alone are not.
#[derive(Debug, PartialEq)]
struct StatusKey {
    index: usize,
    is_playing: bool,
    is_muted: bool,
    is_finished: bool,
    media: media::MediaStatus,
}

impl StatusKey {
    fn of(snapshot: &PlayerSnapshot) -> Self {
        Self {
            index: snapshot.current_segment_index,
            is_playing: snapshot.is_playing,
            is_muted: snapshot.is_muted,
            is_finished: snapshot.is_finished,
            media: snapshot.media_status.clone(),
        }
    }
}

fn status_line(snapshot: &PlayerSnapshot) -> String {
    let Some(segment) = snapshot.current_segment.as_ref() else {
        return "No segments to present".to_string();
    };

    let transport = if snapshot.is_finished {
        "finished"
    } else if snapshot.is_playing {
        "playing"
    } else {
        "paused"
    };
    let media = match &snapshot.media_status {
        media::MediaStatus::None => "no media".to_string(),
        media::MediaStatus::Loading => format!("{} loading", snapshot.media_kind.as_str()),
        media::MediaStatus::Ready => format!("{} ready", snapshot.media_kind.as_str()),
        media::MediaStatus::Unavailable(reason) => reason.clone(),
    };

    format!(
        "[{}/{}] {} | segment {} left ({:.0}%) | total {} left ({:.0}%) | {}{} | {}",
        snapshot.current_segment_index + 1,
        snapshot.segment_count,
        segment.title,
        format_clock(snapshot.segment_time_left_secs),
        snapshot.segment_progress * 100.0,
        format_clock(snapshot.total_time_left_secs),
        snapshot.total_progress * 100.0,
        transport,
        if snapshot.is_muted { ", muted" } else { "" },
        media,
    )
}
