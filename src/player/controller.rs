use std::{sync::Arc, time::Duration};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{
    media::{DriverHandle, MediaDriverFactory, MediaKind, MediaStatus},
    models::{Plan, Segment},
    settings::UserSettings,
};

use super::{
    clock::{apply_tick, AdvancePolicy, ClockStatus, ClockTicket, SegmentClock, TickOutcome, TICK_INTERVAL},
    state::{Intent, PlaybackState},
};

/// Read-only view for the presentation layer, republished after every mutation.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    pub session_id: String,
    pub title: String,
    pub current_segment_index: usize,
    pub segment_count: usize,
    pub current_segment: Option<Segment>,
    pub segment_time_left_secs: f64,
    pub total_time_left_secs: f64,
    pub segment_progress: f64,
    pub total_progress: f64,
    pub is_playing: bool,
    pub is_muted: bool,
    pub is_finished: bool,
    pub has_previous: bool,
    pub has_next: bool,
    pub media_kind: MediaKind,
    pub media_status: MediaStatus,
    pub clock: ClockStatus,
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub tick_interval: Duration,
    pub policy: AdvancePolicy,
    pub start_muted: bool,
    pub heartbeat_every_ticks: u32,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        let debug_mode = std::env::var("TIMEKEEPER_DEBUG")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            tick_interval: TICK_INTERVAL,
            policy: AdvancePolicy::default(),
            start_muted: false,
            heartbeat_every_ticks: if debug_mode { 1 } else { 10 },
        }
    }
}

impl ControllerOptions {
    pub fn from_settings(settings: &UserSettings) -> Self {
        Self {
            policy: AdvancePolicy::from_continue_flag(settings.playback.continue_on_advance),
            start_muted: settings.media.start_muted,
            ..Self::default()
        }
    }
}

struct Inner {
    session_id: String,
    state: PlaybackState,
    clock: SegmentClock,
    driver: Option<DriverHandle>,
    factory: Arc<dyn MediaDriverFactory>,
    snapshots: watch::Sender<PlayerSnapshot>,
    heartbeat_every_ticks: u32,
    closed: bool,
}

/// Coordinates transport commands, the segment clock and the mounted media driver.
///
/// Clones share one session. Every mutation runs under a single lock, so
/// operator commands and clock ticks never interleave.
#[derive(Clone)]
pub struct PlaybackController {
    inner: Arc<Mutex<Inner>>,
    snapshots: watch::Receiver<PlayerSnapshot>,
    session_token: CancellationToken,
}

impl PlaybackController {
    /// Mounts the first segment's driver, paused. Call from inside a tokio
    /// runtime so asynchronous backends can start.
    pub fn new(
        session_id: String,
        plan: Arc<Plan>,
        factory: Arc<dyn MediaDriverFactory>,
        options: ControllerOptions,
    ) -> Self {
        let session_token = CancellationToken::new();
        let state = PlaybackState::new(plan).with_muted(options.start_muted);
        let clock = SegmentClock::new(options.tick_interval, options.policy, session_token.clone());

        let driver = state.current_segment().map(|segment| {
            let mut driver = factory.mount(&segment.id, &segment.media_url);
            replay_intent(&mut driver, &state);
            driver
        });

        let initial = build_snapshot(&session_id, &state, &clock, driver.as_ref());
        let (tx, rx) = watch::channel(initial);

        info!(
            "session {} ready: {} segments of {:.0}s",
            session_id,
            state.segment_count(),
            state.segment_duration_secs()
        );

        Self {
            inner: Arc::new(Mutex::new(Inner {
                session_id,
                state,
                clock,
                driver,
                factory,
                snapshots: tx,
                heartbeat_every_ticks: options.heartbeat_every_ticks.max(1),
                closed: false,
            })),
            snapshots: rx,
            session_token,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerSnapshot> {
        self.snapshots.clone()
    }

    pub async fn snapshot(&self) -> PlayerSnapshot {
        self.inner.lock().await.snapshot()
    }

    pub async fn toggle_play(&self) -> PlayerSnapshot {
        self.apply(PlaybackState::toggle_play).await
    }

    pub async fn play(&self) -> PlayerSnapshot {
        self.apply(|state| state.set_playing(true)).await
    }

    pub async fn pause(&self) -> PlayerSnapshot {
        self.apply(|state| state.set_playing(false)).await
    }

    pub async fn toggle_mute(&self) -> PlayerSnapshot {
        self.apply(PlaybackState::toggle_mute).await
    }

    pub async fn go_to_segment(&self, index: usize) -> PlayerSnapshot {
        self.apply(|state| {
            state.go_to_segment(index);
        })
        .await
    }

    pub async fn next_segment(&self) -> PlayerSnapshot {
        self.apply(PlaybackState::next_segment).await
    }

    pub async fn previous_segment(&self) -> PlayerSnapshot {
        self.apply(|state| {
            state.previous_segment();
        })
        .await
    }

    /// Changes what happens when a segment runs out. Takes effect on the next
    /// tick; a running clock is not restarted.
    pub async fn set_advance_policy(&self, policy: AdvancePolicy) -> PlayerSnapshot {
        let mut guard = self.inner.lock().await;
        guard.clock.rebind(policy);
        info!("advance policy set to {:?}", policy);
        guard.publish()
    }

    /// Stops the clock and releases the driver. Further commands are ignored.
    pub async fn shutdown(&self) -> PlaybackState {
        self.session_token.cancel();
        let mut guard = self.inner.lock().await;
        guard.close();
        guard.state.clone()
    }

    /// Synchronous teardown for drop paths. The ticker is cancelled at once; if
    /// a tick holds the lock, closing finishes on a spawned `shutdown`.
    pub(crate) fn abort(&self) {
        self.session_token.cancel();
        match self.inner.try_lock() {
            Ok(mut guard) => guard.close(),
            Err(_) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let controller = self.clone();
                    handle.spawn(async move {
                        controller.shutdown().await;
                    });
                }
                Err(_) => warn!("session lock busy outside a runtime; media released on last drop"),
            },
        }
    }

    async fn apply<F>(&self, op: F) -> PlayerSnapshot
    where
        F: FnOnce(&mut PlaybackState),
    {
        let mut guard = self.inner.lock().await;
        if guard.closed {
            return guard.snapshot();
        }
        let before = guard.state.intent();
        op(&mut guard.state);
        guard.sync(&self.inner, before);
        guard.publish()
    }
}

impl Inner {
    fn snapshot(&self) -> PlayerSnapshot {
        build_snapshot(&self.session_id, &self.state, &self.clock, self.driver.as_ref())
    }

    fn publish(&self) -> PlayerSnapshot {
        let snapshot = self.snapshot();
        self.snapshots.send_replace(snapshot.clone());
        snapshot
    }

    /// Brings the driver and the clock in line with the state after a mutation.
    fn sync(&mut self, shared: &Arc<Mutex<Inner>>, before: Intent) {
        let after = self.state.intent();
        if after.index != before.index {
            self.remount();
        } else if let Some(driver) = self.driver.as_mut() {
            if after.is_playing != before.is_playing {
                if after.is_playing {
                    driver.play();
                } else {
                    driver.pause();
                }
            }
            if after.is_muted != before.is_muted {
                if after.is_muted {
                    driver.mute();
                } else {
                    driver.unmute();
                }
            }
        }
        self.sync_clock(shared);
    }

    fn remount(&mut self) {
        let Some(segment) = self.state.current_segment().cloned() else {
            if let Some(mut old) = self.driver.take() {
                old.dispose();
            }
            return;
        };

        if let Some(driver) = self.driver.as_mut() {
            if driver.is_bound_to(&segment.id, &segment.media_url) {
                replay_intent(driver, &self.state);
                return;
            }
        }
        if let Some(mut old) = self.driver.take() {
            old.dispose();
        }
        let mut driver = self.factory.mount(&segment.id, &segment.media_url);
        replay_intent(&mut driver, &self.state);
        self.driver = Some(driver);
    }

    fn sync_clock(&mut self, shared: &Arc<Mutex<Inner>>) {
        let should_run = self.state.is_playing() && !self.state.is_inert();
        if should_run && !self.clock.is_running() {
            let shared = Arc::clone(shared);
            let heartbeat_every = self.heartbeat_every_ticks;
            self.clock
                .start(move |ticket| run_ticks(shared, ticket, heartbeat_every));
        } else if !should_run && self.clock.is_running() {
            self.clock.stop();
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.clock.stop();
        if let Some(mut driver) = self.driver.take() {
            driver.dispose();
        }
        self.publish();
        info!("session {} closed", self.session_id);
    }
}

fn replay_intent(driver: &mut DriverHandle, state: &PlaybackState) {
    if state.is_playing() {
        driver.play();
    } else {
        driver.pause();
    }
    if state.is_muted() {
        driver.mute();
    } else {
        driver.unmute();
    }
}

fn build_snapshot(
    session_id: &str,
    state: &PlaybackState,
    clock: &SegmentClock,
    driver: Option<&DriverHandle>,
) -> PlayerSnapshot {
    let (media_kind, media_status) = driver
        .map(|d| (d.kind(), d.status()))
        .unwrap_or((MediaKind::None, MediaStatus::None));

    PlayerSnapshot {
        session_id: session_id.to_string(),
        title: state.plan().title.clone(),
        current_segment_index: state.current_index(),
        segment_count: state.segment_count(),
        current_segment: state.current_segment().cloned(),
        segment_time_left_secs: state.segment_time_left_secs(),
        total_time_left_secs: state.total_time_left_secs(),
        segment_progress: state.segment_progress(),
        total_progress: state.total_progress(),
        is_playing: state.is_playing(),
        is_muted: state.is_muted(),
        is_finished: state.is_finished(),
        has_previous: state.has_previous(),
        has_next: state.has_next(),
        media_kind,
        media_status,
        clock: clock.status(),
    }
}

async fn run_ticks(shared: Arc<Mutex<Inner>>, ticket: ClockTicket, heartbeat_every: u32) {
    let mut interval = ticket.interval();
    let mut ticks: u32 = 0;

    loop {
        tokio::select! {
            _ = ticket.cancelled() => break,
            _ = interval.tick() => {}
        }

        let mut guard = shared.lock().await;
        if guard.closed || !guard.clock.is_current(ticket.epoch()) {
            break;
        }

        let before = guard.state.intent();
        let advance = guard.clock.advance_fn();
        if apply_tick(&mut guard.state, &advance) == TickOutcome::SegmentExpired {
            info!(
                "segment {} of {} expired; now at {}",
                before.index + 1,
                guard.state.segment_count(),
                guard.state.current_index() + 1
            );
        }
        guard.sync(&shared, before);
        let snapshot = guard.publish();

        ticks = ticks.wrapping_add(1);
        if ticks % heartbeat_every == 0 {
            debug!(
                "heartbeat {}: segment {:.0}s left, total {:.0}s left",
                guard.session_id, snapshot.segment_time_left_secs, snapshot.total_time_left_secs
            );
        }

        if !guard.clock.is_current(ticket.epoch()) {
            break;
        }
    }
}
