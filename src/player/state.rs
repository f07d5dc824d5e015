use std::sync::Arc;

use crate::models::{Plan, Segment};

/// The part of the state a mounted driver has to follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intent {
    pub index: usize,
    pub is_playing: bool,
    pub is_muted: bool,
}

/// Session-scoped playback state derived from a [`Plan`].
///
/// Both countdowns are in seconds. The segment countdown stays within
/// `0..=segment_duration`, the total countdown within `0..=total_duration`.
/// Navigation always pauses and re-syncs the total countdown to the start of
/// the target segment.
#[derive(Debug, Clone)]
pub struct PlaybackState {
    plan: Arc<Plan>,
    segment_duration_secs: f64,
    total_duration_secs: f64,
    current_index: usize,
    is_playing: bool,
    is_muted: bool,
    segment_left_secs: f64,
    total_left_secs: f64,
    /// Set when the clock runs out on the last segment.
    finished: bool,
}

impl PlaybackState {
    pub fn new(plan: Arc<Plan>) -> Self {
        let segment_duration_secs = plan.segment_duration_secs();
        let total_duration_secs = plan.total_duration_secs();
        Self {
            plan,
            segment_duration_secs,
            total_duration_secs,
            current_index: 0,
            is_playing: false,
            is_muted: false,
            segment_left_secs: segment_duration_secs,
            total_left_secs: total_duration_secs,
            finished: false,
        }
    }

    pub fn with_muted(mut self, muted: bool) -> Self {
        self.is_muted = muted;
        self
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn segment_count(&self) -> usize {
        self.plan.segments.len()
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn current_segment(&self) -> Option<&Segment> {
        self.plan.segments.get(self.current_index)
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn is_muted(&self) -> bool {
        self.is_muted
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn segment_duration_secs(&self) -> f64 {
        self.segment_duration_secs
    }

    pub fn total_duration_secs(&self) -> f64 {
        self.total_duration_secs
    }

    pub fn segment_time_left_secs(&self) -> f64 {
        self.segment_left_secs
    }

    pub fn total_time_left_secs(&self) -> f64 {
        self.total_left_secs
    }

    /// No segments or no time: nothing ticks and every command is ignored.
    pub fn is_inert(&self) -> bool {
        self.plan.segments.is_empty() || self.segment_duration_secs <= 0.0
    }

    pub fn has_previous(&self) -> bool {
        !self.is_inert() && self.current_index > 0
    }

    pub fn has_next(&self) -> bool {
        !self.is_inert() && self.current_index + 1 < self.segment_count()
    }

    pub fn intent(&self) -> Intent {
        Intent {
            index: self.current_index,
            is_playing: self.is_playing,
            is_muted: self.is_muted,
        }
    }

    /// Jumps to `index` and pauses. Out-of-range targets are ignored.
    pub fn go_to_segment(&mut self, index: usize) -> bool {
        if self.is_inert() || index >= self.segment_count() {
            return false;
        }
        self.current_index = index;
        self.segment_left_secs = self.segment_duration_secs;
        self.total_left_secs =
            (self.total_duration_secs - index as f64 * self.segment_duration_secs).max(0.0);
        self.is_playing = false;
        self.finished = false;
        true
    }

    /// Moves on one segment; on the last one it only stops playback.
    pub fn next_segment(&mut self) {
        if self.is_inert() {
            return;
        }
        if self.current_index + 1 < self.segment_count() {
            self.go_to_segment(self.current_index + 1);
        } else {
            self.is_playing = false;
            self.finished = true;
        }
    }

    pub fn previous_segment(&mut self) -> bool {
        match self.current_index.checked_sub(1) {
            Some(index) => self.go_to_segment(index),
            None => false,
        }
    }

    pub fn set_playing(&mut self, playing: bool) {
        if !self.is_inert() {
            self.is_playing = playing;
        }
    }

    pub fn toggle_play(&mut self) {
        self.set_playing(!self.is_playing);
    }

    pub fn toggle_mute(&mut self) {
        if !self.is_inert() {
            self.is_muted = !self.is_muted;
        }
    }

    pub fn segment_progress(&self) -> f64 {
        progress(self.segment_duration_secs, self.segment_left_secs)
    }

    pub fn total_progress(&self) -> f64 {
        progress(self.total_duration_secs, self.total_left_secs)
    }

    pub(crate) fn count_down_total(&mut self) {
        self.total_left_secs = (self.total_left_secs - 1.0).max(0.0);
    }

    /// Takes one second off the segment countdown. Returns `true` when the
    /// segment is used up; the countdown is then left for the caller to reset.
    pub(crate) fn count_down_segment(&mut self) -> bool {
        if self.segment_left_secs <= 1.0 {
            true
        } else {
            self.segment_left_secs -= 1.0;
            false
        }
    }

    pub(crate) fn reset_segment_countdown(&mut self) {
        self.segment_left_secs = self.segment_duration_secs;
    }
}

fn progress(duration: f64, left: f64) -> f64 {
    if duration > 0.0 {
        ((duration - left) / duration).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(minutes: f64, segments: usize) -> Arc<Plan> {
        Arc::new(Plan {
            id: "plan".into(),
            title: "Town hall".into(),
            total_duration_minutes: minutes,
            segments: (0..segments)
                .map(|i| Segment {
                    id: format!("seg-{i}"),
                    title: format!("Segment {}", i + 1),
                    ..Segment::default()
                })
                .collect(),
        })
    }

    #[test]
    fn starts_paused_at_first_segment_with_full_countdowns() {
        let state = PlaybackState::new(plan(30.0, 3));
        assert_eq!(state.current_index(), 0);
        assert!(!state.is_playing());
        assert!(!state.is_muted());
        assert_eq!(state.segment_duration_secs(), 600.0);
        assert_eq!(state.segment_time_left_secs(), 600.0);
        assert_eq!(state.total_time_left_secs(), 1800.0);
        assert_eq!(state.segment_progress(), 0.0);
        assert_eq!(state.total_progress(), 0.0);
        assert!(!state.has_previous());
        assert!(state.has_next());
    }

    #[test]
    fn go_to_segment_resyncs_total_and_pauses() {
        let mut state = PlaybackState::new(plan(30.0, 3));
        state.toggle_play();
        assert!(state.is_playing());

        assert!(state.go_to_segment(2));
        assert_eq!(state.current_index(), 2);
        assert_eq!(state.segment_time_left_secs(), 600.0);
        assert_eq!(state.total_time_left_secs(), 600.0);
        assert!(!state.is_playing());
        assert!(!state.has_next());
    }

    #[test]
    fn out_of_range_targets_change_nothing() {
        let mut state = PlaybackState::new(plan(30.0, 3));
        state.toggle_play();
        state.count_down_total();
        let before = format!("{state:?}");

        assert!(!state.go_to_segment(3));
        assert!(!state.go_to_segment(usize::MAX));
        assert_eq!(format!("{state:?}"), before);

        state.go_to_segment(0);
        assert!(!state.previous_segment());
        assert_eq!(state.current_index(), 0);
    }

    #[test]
    fn next_segment_at_last_index_only_stops() {
        let mut state = PlaybackState::new(plan(30.0, 3));
        state.go_to_segment(2);
        state.toggle_play();
        state.count_down_total();

        state.next_segment();
        assert_eq!(state.current_index(), 2);
        assert!(!state.is_playing());
        assert!(state.is_finished());
        assert_eq!(state.total_time_left_secs(), 599.0);
    }

    #[test]
    fn previous_segment_goes_back_one() {
        let mut state = PlaybackState::new(plan(10.0, 4));
        state.go_to_segment(3);
        assert!(state.previous_segment());
        assert_eq!(state.current_index(), 2);
        assert_eq!(state.total_time_left_secs(), 600.0 - 2.0 * 150.0);
    }

    #[test]
    fn toggles_flip_intent() {
        let mut state = PlaybackState::new(plan(5.0, 1));
        state.toggle_mute();
        assert!(state.is_muted());
        state.toggle_mute();
        assert!(!state.is_muted());

        state.toggle_play();
        state.toggle_play();
        assert!(!state.is_playing());
    }

    #[test]
    fn degenerate_plans_are_inert() {
        for mut state in [
            PlaybackState::new(plan(30.0, 0)),
            PlaybackState::new(plan(0.0, 3)),
        ] {
            assert!(state.is_inert());
            state.toggle_play();
            state.toggle_mute();
            state.next_segment();
            assert!(!state.go_to_segment(0));
            assert!(!state.is_playing());
            assert!(!state.is_muted());
            assert!(!state.is_finished());
            assert_eq!(state.segment_progress(), 0.0);
        }
    }

    #[test]
    fn zero_segment_plan_keeps_no_segment_and_no_division() {
        let state = PlaybackState::new(plan(30.0, 0));
        assert!(state.current_segment().is_none());
        assert_eq!(state.segment_duration_secs(), 0.0);
        assert_eq!(state.segment_progress(), 0.0);
        assert_eq!(state.total_progress(), 0.0);
    }

    #[test]
    fn progress_tracks_countdowns() {
        let mut state = PlaybackState::new(plan(30.0, 3));
        for _ in 0..150 {
            state.count_down_total();
            assert!(!state.count_down_segment());
        }
        assert_eq!(state.segment_progress(), 0.25);
        assert!((state.total_progress() - 150.0 / 1800.0).abs() < 1e-12);
    }

    #[test]
    fn segment_countdown_reports_expiry_on_last_second() {
        let mut state = PlaybackState::new(plan(1.0, 30));
        assert_eq!(state.segment_time_left_secs(), 2.0);
        assert!(!state.count_down_segment());
        assert_eq!(state.segment_time_left_secs(), 1.0);
        assert!(state.count_down_segment());
        state.reset_segment_countdown();
        assert_eq!(state.segment_time_left_secs(), 2.0);
    }

    #[test]
    fn total_countdown_floors_at_zero() {
        let mut state = PlaybackState::new(plan(0.01, 1));
        state.count_down_total();
        assert_eq!(state.total_time_left_secs(), 0.0);
        state.count_down_total();
        assert_eq!(state.total_time_left_secs(), 0.0);
    }
}
