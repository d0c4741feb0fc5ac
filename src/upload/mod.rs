//! Batch delivery.
//!
//! One flush = one `UploadWorker::run` inside one execution grant, sending at
//! most `max_batch_size` of the oldest unsent fixes to a `RemoteEndpoint`.

pub mod endpoint;
pub mod grant;
pub mod worker;

pub use endpoint::{FixUpload, HttpEndpoint, RemoteEndpoint, WireFix};
pub use grant::{DeadlineGrants, ExecutionGrant, GrantProvider, GrantRelease};
pub use worker::{FlushOutcome, FlushReport, UploadWorker};
