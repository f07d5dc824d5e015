//! The segment clock: the only source of spontaneous state change in a session.
//!
//! At most one ticker task is live. Starting a run cancels the previous one
//! first, and every run carries an epoch; a tick that wakes up after its run
//! was stopped sees a different epoch and exits without touching the state.
//!
//! The function applied when a segment runs out sits in a slot on the clock.
//! The ticker reads the slot on every tick, so rebinding it takes effect on
//! the next tick without restarting the timer.

use std::{future::Future, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{
    task::JoinHandle,
    time::{self, Instant, Interval},
};
use tokio_util::sync::CancellationToken;

use super::state::PlaybackState;

const ENABLE_LOGS: bool = true;

use crate::log_debug;

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Applied to the state when the current segment's countdown is used up.
pub type AdvanceFn = Arc<dyn Fn(&mut PlaybackState) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AdvancePolicy {
    /// Advance like a manual "next": the new segment starts paused.
    #[default]
    PauseAtBoundary,
    /// Keep playing into the next segment. The last segment still stops.
    ContinueAcrossSegments,
}

impl AdvancePolicy {
    pub fn from_continue_flag(continue_on_advance: bool) -> Self {
        if continue_on_advance {
            AdvancePolicy::ContinueAcrossSegments
        } else {
            AdvancePolicy::PauseAtBoundary
        }
    }

    pub fn continues(self) -> bool {
        self == AdvancePolicy::ContinueAcrossSegments
    }

    pub fn advance_fn(self) -> AdvanceFn {
        match self {
            AdvancePolicy::PauseAtBoundary => Arc::new(PlaybackState::next_segment),
            AdvancePolicy::ContinueAcrossSegments => Arc::new(|state: &mut PlaybackState| {
                let was_playing = state.is_playing();
                state.next_segment();
                if !state.is_finished() {
                    state.set_playing(was_playing);
                }
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ClockStatus {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to count down.
    Inert,
    Counted,
    /// The segment ran out and the advance function was applied.
    SegmentExpired,
}

/// One second of session time.
///
/// The total countdown goes first so that an advance, which re-syncs the total
/// to the new segment boundary, has the last word on that tick.
pub fn apply_tick(state: &mut PlaybackState, advance: &AdvanceFn) -> TickOutcome {
    if state.is_inert() {
        return TickOutcome::Inert;
    }
    state.count_down_total();
    if state.count_down_segment() {
        advance(state);
        state.reset_segment_countdown();
        TickOutcome::SegmentExpired
    } else {
        TickOutcome::Counted
    }
}

/// Handed to a ticker task when its run starts.
pub struct ClockTicket {
    epoch: u64,
    period: Duration,
    cancel: CancellationToken,
}

impl ClockTicket {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// First tick fires one full period after the run starts.
    pub fn interval(&self) -> Interval {
        time::interval_at(Instant::now() + self.period, self.period)
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

struct ClockRun {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

pub struct SegmentClock {
    period: Duration,
    epoch: u64,
    run: Option<ClockRun>,
    policy: AdvancePolicy,
    advance: AdvanceFn,
    /// Session-wide token; every run listens on a child of it.
    session: CancellationToken,
}

impl SegmentClock {
    pub fn new(period: Duration, policy: AdvancePolicy, session: CancellationToken) -> Self {
        Self {
            period,
            epoch: 0,
            run: None,
            policy,
            advance: policy.advance_fn(),
            session,
        }
    }

    pub fn status(&self) -> ClockStatus {
        if self.run.is_some() {
            ClockStatus::Running
        } else {
            ClockStatus::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Whether a ticker started with `epoch` is still the live one.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.run.is_some() && self.epoch == epoch
    }

    pub fn policy(&self) -> AdvancePolicy {
        self.policy
    }

    pub fn advance_fn(&self) -> AdvanceFn {
        Arc::clone(&self.advance)
    }

    /// Swaps the advance function. A running ticker picks it up on its next tick.
    pub fn rebind(&mut self, policy: AdvancePolicy) {
        self.policy = policy;
        self.advance = policy.advance_fn();
    }

    /// Cancels any live run, then spawns `tick_loop` as the new one.
    pub fn start<F, Fut>(&mut self, tick_loop: F) -> u64
    where
        F: FnOnce(ClockTicket) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop();
        self.epoch += 1;

        let cancel = self.session.child_token();
        let ticket = ClockTicket {
            epoch: self.epoch,
            period: self.period,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(tick_loop(ticket));
        self.run = Some(ClockRun { handle, cancel });
        log_debug!("clock running (epoch {})", self.epoch);
        self.epoch
    }

    /// Cancels the live run, if any. Returns whether there was one.
    pub fn stop(&mut self) -> bool {
        match self.run.take() {
            Some(run) => {
                run.cancel.cancel();
                run.handle.abort();
                self.epoch += 1;
                log_debug!("clock stopped (epoch {})", self.epoch);
                true
            }
            None => false,
        }
    }
}

impl Drop for SegmentClock {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Plan, Segment};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn state(minutes: f64, segments: usize) -> PlaybackState {
        PlaybackState::new(Arc::new(Plan {
            id: "plan".into(),
            title: "Offsite".into(),
            total_duration_minutes: minutes,
            segments: (0..segments)
                .map(|i| Segment {
                    id: format!("seg-{i}"),
                    ..Segment::default()
                })
                .collect(),
        }))
    }

    #[test]
    fn expiry_happens_on_exactly_the_last_whole_tick() {
        let mut state = state(30.0, 3);
        let advance = AdvancePolicy::PauseAtBoundary.advance_fn();
        state.toggle_play();

        for _ in 0..599 {
            assert_eq!(apply_tick(&mut state, &advance), TickOutcome::Counted);
        }
        assert_eq!(state.segment_time_left_secs(), 1.0);
        assert_eq!(state.total_time_left_secs(), 1201.0);

        assert_eq!(apply_tick(&mut state, &advance), TickOutcome::SegmentExpired);
        assert_eq!(state.current_index(), 1);
        assert_eq!(state.segment_time_left_secs(), 600.0);
        assert_eq!(state.total_time_left_secs(), 1200.0);
        assert!(!state.is_playing());
    }

    #[test]
    fn full_session_runs_down_to_zero_on_last_segment() {
        let mut state = state(30.0, 3);
        let advance = AdvancePolicy::ContinueAcrossSegments.advance_fn();
        state.toggle_play();

        let mut expiries = 0;
        for _ in 0..1800 {
            if apply_tick(&mut state, &advance) == TickOutcome::SegmentExpired {
                expiries += 1;
                match expiries {
                    1 => assert_eq!(state.total_time_left_secs(), 1200.0),
                    2 => assert_eq!(state.total_time_left_secs(), 600.0),
                    _ => {}
                }
            }
        }

        assert_eq!(expiries, 3);
        assert_eq!(state.current_index(), 2);
        assert_eq!(state.total_time_left_secs(), 0.0);
        assert_eq!(state.segment_time_left_secs(), 600.0);
        assert!(!state.is_playing());
        assert!(state.is_finished());
    }

    #[test]
    fn fractional_segments_expire_without_going_negative() {
        // 60s over 7 segments: ~8.57s each
        let mut state = state(1.0, 7);
        let advance = AdvancePolicy::ContinueAcrossSegments.advance_fn();
        state.toggle_play();

        for tick in 1..=9 {
            let outcome = apply_tick(&mut state, &advance);
            assert!(state.segment_time_left_secs() > 0.0);
            if tick < 9 {
                assert_eq!(outcome, TickOutcome::Counted);
            } else {
                assert_eq!(outcome, TickOutcome::SegmentExpired);
            }
            if tick == 8 {
                let left = 60.0 / 7.0 - 8.0;
                assert!((state.segment_time_left_secs() - left).abs() < 1e-9);
                assert_eq!(state.current_index(), 0);
            }
        }
        assert_eq!(state.current_index(), 1);
        assert_eq!(state.segment_time_left_secs(), 60.0 / 7.0);
    }

    #[test]
    fn inert_state_never_ticks() {
        let mut state = state(30.0, 0);
        let advance = AdvancePolicy::PauseAtBoundary.advance_fn();
        assert_eq!(apply_tick(&mut state, &advance), TickOutcome::Inert);
        assert_eq!(state.total_time_left_secs(), 1800.0);
    }

    #[test]
    fn rebinding_swaps_the_advance_function() {
        let mut clock = SegmentClock::new(
            TICK_INTERVAL,
            AdvancePolicy::PauseAtBoundary,
            CancellationToken::new(),
        );
        let mut state = state(30.0, 3);
        state.toggle_play();
        (clock.advance_fn())(&mut state);
        assert!(!state.is_playing());

        clock.rebind(AdvancePolicy::ContinueAcrossSegments);
        assert_eq!(clock.policy(), AdvancePolicy::ContinueAcrossSegments);
        state.toggle_play();
        (clock.advance_fn())(&mut state);
        assert_eq!(state.current_index(), 2);
        assert!(state.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn starting_again_cancels_the_previous_run() {
        let mut clock = SegmentClock::new(
            TICK_INTERVAL,
            AdvancePolicy::PauseAtBoundary,
            CancellationToken::new(),
        );
        let first_ticks = Arc::new(AtomicU32::new(0));
        let second_ticks = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&first_ticks);
        let first = clock.start(move |ticket| async move {
            let mut interval = ticket.interval();
            loop {
                interval.tick().await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(first_ticks.load(Ordering::SeqCst), 2);

        let counter = Arc::clone(&second_ticks);
        let second = clock.start(move |ticket| async move {
            let mut interval = ticket.interval();
            loop {
                interval.tick().await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(!clock.is_current(first));
        assert!(clock.is_current(second));

        time::sleep(Duration::from_millis(3_200)).await;
        assert_eq!(first_ticks.load(Ordering::SeqCst), 2);
        assert_eq!(second_ticks.load(Ordering::SeqCst), 3);

        assert!(clock.stop());
        assert!(!clock.stop());
        assert_eq!(clock.status(), ClockStatus::Stopped);
        time::sleep(Duration::from_millis(5_000)).await;
        assert_eq!(second_ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn session_cancellation_reaches_the_ticker() {
        let session = CancellationToken::new();
        let mut clock = SegmentClock::new(TICK_INTERVAL, AdvancePolicy::default(), session.clone());
        let exited = Arc::new(AtomicU32::new(0));

        let flag = Arc::clone(&exited);
        clock.start(move |ticket| async move {
            ticket.cancelled().await;
            flag.store(1, Ordering::SeqCst);
        });

        session.cancel();
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(exited.load(Ordering::SeqCst), 1);
    }
}
