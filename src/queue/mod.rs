//! Durable fix queue.
//!
//! Records are keyed by an append sequence id and carry a `sent` flag that
//! only ever goes from false to true. Unsent records are never removed.

pub mod record;
pub mod store;

pub use record::{FixId, FixRecord, NewFix};
pub use store::{Durability, FixQueue};
