use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::info;
use uuid::Uuid;

use crate::{
    media::MediaDriverFactory,
    models::{Plan, SessionStatus, SessionSummary},
    player::{ControllerOptions, PlaybackController},
};

/// Where the operator goes once the session is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterSession {
    /// Back to the planner.
    Planning,
    Summary,
}

#[derive(Debug, Clone)]
pub enum SessionExit {
    Planning,
    Summary(SessionSummary),
}

/// A running presentation. Ending it, or dropping the handle, stops the
/// clock and releases the mounted media before control returns.
pub struct SessionHandle {
    session_id: String,
    plan: Arc<Plan>,
    started_at: DateTime<Utc>,
    controller: PlaybackController,
    ended: bool,
}

/// Starts a session paused at the first segment. Must be called from inside a
/// tokio runtime.
pub fn start_session(
    plan: Plan,
    factory: Arc<dyn MediaDriverFactory>,
    options: ControllerOptions,
) -> SessionHandle {
    let session_id = Uuid::new_v4().to_string();
    let plan = Arc::new(plan);
    let controller =
        PlaybackController::new(session_id.clone(), Arc::clone(&plan), factory, options);

    info!(
        "Started session {} for plan \"{}\" ({} segments)",
        session_id,
        plan.title,
        plan.segment_count()
    );

    SessionHandle {
        session_id,
        plan,
        started_at: Utc::now(),
        controller,
        ended: false,
    }
}

impl SessionHandle {
    pub fn controller(&self) -> &PlaybackController {
        &self.controller
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub async fn end(mut self, after: AfterSession) -> SessionExit {
        self.ended = true;
        let final_state = self.controller.shutdown().await;
        let status = if final_state.is_finished() {
            SessionStatus::Completed
        } else {
            SessionStatus::Cancelled
        };
        info!("Ended session {} ({})", self.session_id, status.as_str());

        match after {
            AfterSession::Planning => SessionExit::Planning,
            AfterSession::Summary => SessionExit::Summary(SessionSummary {
                session_id: self.session_id.clone(),
                plan: self.plan.as_ref().clone(),
                started_at: self.started_at,
                ended_at: Utc::now(),
                status,
                final_segment_index: final_state.current_index(),
                total_time_left_secs: final_state.total_time_left_secs(),
            }),
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if !self.ended {
            self.controller.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{media::placeholder::PlaceholderFactory, models::Segment};

    fn plan() -> Plan {
        Plan {
            id: "plan".into(),
            title: "Demo day".into(),
            total_duration_minutes: 2.0,
            segments: vec![Segment {
                id: "only".into(),
                ..Segment::default()
            }],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn summary_reports_completion_only_when_the_clock_ran_out() {
        let session = start_session(
            plan(),
            Arc::new(PlaceholderFactory::new()),
            ControllerOptions::default(),
        );
        session.controller().toggle_play().await;
        tokio::time::sleep(std::time::Duration::from_millis(30_500)).await;

        let SessionExit::Summary(summary) = session.end(AfterSession::Summary).await else {
            panic!("expected a summary");
        };
        assert_eq!(summary.status, SessionStatus::Cancelled);
        assert_eq!(summary.total_time_left_secs, 90.0);
        assert_eq!(summary.plan.title, "Demo day");

        let session = start_session(
            plan(),
            Arc::new(PlaceholderFactory::new()),
            ControllerOptions::default(),
        );
        session.controller().toggle_play().await;
        tokio::time::sleep(std::time::Duration::from_millis(120_500)).await;

        let SessionExit::Summary(summary) = session.end(AfterSession::Summary).await else {
            panic!("expected a summary");
        };
        assert_eq!(summary.status, SessionStatus::Completed);
        assert_eq!(summary.final_segment_index, 0);
        assert_eq!(summary.total_time_left_secs, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn ending_for_planning_carries_no_summary() {
        let session = start_session(
            plan(),
            Arc::new(PlaceholderFactory::new()),
            ControllerOptions::default(),
        );
        assert!(Uuid::parse_str(session.session_id()).is_ok());
        assert!(matches!(
            session.end(AfterSession::Planning).await,
            SessionExit::Planning
        ));
    }
}
