//! Flush scheduling and the tracking session that drives it.

pub mod scheduler;
pub mod session;
pub mod throttle;

pub use scheduler::{FlushPermit, Phase, SyncScheduler, SyncState};
pub use session::{Connectivity, SessionSettings, SessionStats, SyncSession};
pub use throttle::{ThrottleController, ThrottleSignal};
