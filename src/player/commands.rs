use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Error};

use crate::session::AfterSession;

use super::{AdvancePolicy, PlaybackController, PlayerSnapshot};

/// One line of operator input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCommand {
    TogglePlay,
    Pause,
    ToggleMute,
    Next,
    Previous,
    /// Zero-based target.
    GoTo(usize),
    AutoAdvance(AdvancePolicy),
    Link,
    Status,
    Help,
    Summary,
    Quit,
}

impl FromStr for TransportCommand {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut words = input.split_whitespace();
        let Some(head) = words.next() else {
            return Ok(TransportCommand::TogglePlay);
        };
        let arg = words.next();
        if words.next().is_some() {
            bail!("Too many arguments: {}", input.trim());
        }

        let command = match (head.to_ascii_lowercase().as_str(), arg) {
            ("play" | "p", None) => TransportCommand::TogglePlay,
            ("pause", None) => TransportCommand::Pause,
            ("mute" | "m", None) => TransportCommand::ToggleMute,
            ("next" | "n", None) => TransportCommand::Next,
            ("prev" | "previous" | "b", None) => TransportCommand::Previous,
            ("go" | "g", Some(number)) => {
                let position: usize = number
                    .parse()
                    .with_context(|| format!("Not a segment number: {number}"))?;
                let index = position
                    .checked_sub(1)
                    .ok_or_else(|| anyhow!("Segments are numbered from 1"))?;
                TransportCommand::GoTo(index)
            }
            ("go" | "g", None) => bail!("Usage: go <segment number>"),
            ("auto", Some(flag)) => match flag.to_ascii_lowercase().as_str() {
                "on" => TransportCommand::AutoAdvance(AdvancePolicy::ContinueAcrossSegments),
                "off" => TransportCommand::AutoAdvance(AdvancePolicy::PauseAtBoundary),
                other => bail!("Usage: auto on|off (got {other})"),
            },
            ("auto", None) => bail!("Usage: auto on|off"),
            ("link" | "l", None) => TransportCommand::Link,
            ("status" | "s", None) => TransportCommand::Status,
            ("help" | "h" | "?", None) => TransportCommand::Help,
            ("summary", None) => TransportCommand::Summary,
            ("quit" | "q" | "exit", None) => TransportCommand::Quit,
            (_, Some(_)) if is_known(head) => bail!("{head} takes no argument"),
            _ => bail!("Unknown command: {}", input.trim()),
        };
        Ok(command)
    }
}

fn is_known(word: &str) -> bool {
    matches!(
        word.to_ascii_lowercase().as_str(),
        "play" | "p" | "pause" | "mute" | "m" | "next" | "n" | "prev" | "previous" | "b"
            | "link" | "l" | "status" | "s" | "help" | "h" | "?" | "summary" | "quit" | "q"
            | "exit"
    )
}

pub const HELP: &str = "\
commands:
  play, p, <enter>   toggle play/pause
  pause              pause
  mute, m            toggle mute
  next, n            next segment
  prev, b            previous segment
  go <N>             jump to segment N
  auto on|off        keep playing across segment boundaries
  link, l            show the segment's related link
  status, s          show the current status
  summary            end the session and print a summary
  quit, q            end the session";

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Snapshot(PlayerSnapshot),
    Link(Option<String>),
    Help,
    End(AfterSession),
}

pub async fn dispatch(controller: &PlaybackController, command: TransportCommand) -> CommandOutcome {
    match command {
        TransportCommand::TogglePlay => CommandOutcome::Snapshot(controller.toggle_play().await),
        TransportCommand::Pause => CommandOutcome::Snapshot(controller.pause().await),
        TransportCommand::ToggleMute => CommandOutcome::Snapshot(controller.toggle_mute().await),
        TransportCommand::Next => CommandOutcome::Snapshot(controller.next_segment().await),
        TransportCommand::Previous => CommandOutcome::Snapshot(controller.previous_segment().await),
        TransportCommand::GoTo(index) => {
            CommandOutcome::Snapshot(controller.go_to_segment(index).await)
        }
        TransportCommand::AutoAdvance(policy) => {
            CommandOutcome::Snapshot(controller.set_advance_policy(policy).await)
        }
        TransportCommand::Status => CommandOutcome::Snapshot(controller.snapshot().await),
        TransportCommand::Link => {
            let snapshot = controller.snapshot().await;
            CommandOutcome::Link(
                snapshot
                    .current_segment
                    .as_ref()
                    .and_then(|segment| segment.related_link())
                    .map(str::to_string),
            )
        }
        TransportCommand::Help => CommandOutcome::Help,
        TransportCommand::Summary => CommandOutcome::End(AfterSession::Summary),
        TransportCommand::Quit => CommandOutcome::End(AfterSession::Planning),
    }
}
