pub mod plan;
pub mod session;

pub use plan::{Plan, Segment};
pub use session::{SessionStatus, SessionSummary};
