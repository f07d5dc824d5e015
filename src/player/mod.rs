pub mod clock;
pub mod commands;
pub mod controller;
pub mod state;

pub use clock::{AdvancePolicy, ClockStatus, SegmentClock, TickOutcome, TICK_INTERVAL};
pub use commands::{dispatch, CommandOutcome, TransportCommand};
pub use controller::{ControllerOptions, PlaybackController, PlayerSnapshot};
pub use state::PlaybackState;
