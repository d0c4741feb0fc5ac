//! fixsync: durable location fix queue with throttled, time-bounded upload.
//!
//! ```text
//! RawSample -> capture -> queue (fjall) -> sync::scheduler -> upload::worker -> endpoint
//!                                               ^
//!                                  sync::throttle (power saving)
//! ```
//!
//! Delivery is at-least-once: a record is marked sent only after the endpoint
//! accepted the batch containing it, and unsent records are never dropped.

pub mod capture;
pub mod config;
pub mod error;
pub mod queue;
pub mod replay;
pub mod sync;
pub mod upload;

pub use capture::{FixCapture, RawSample};
pub use config::SessionConfig;
pub use error::{ConfigError, EndpointError, FlushError, SessionError, StorageError};
pub use queue::{Durability, FixId, FixQueue, FixRecord, NewFix};
pub use sync::{Connectivity, SessionSettings, SessionStats, SyncSession, ThrottleController};
pub use upload::{DeadlineGrants, FlushOutcome, FlushReport, HttpEndpoint, RemoteEndpoint};
