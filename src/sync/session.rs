//! Tracking session.
//!
//! Owns one queue, scheduler, throttle and upload worker for the lifetime of
//! a tracking run and wires them together:
//!
//! ```text
//! sample -> FixCapture -> FixQueue.append -> SyncScheduler --(due)--> UploadWorker
//!                                                ^                        |
//!               ThrottleController --accelerate--+---- completion --------+
//! ```
//!
//! Flushes run as tasks on the runtime the session was started on, so
//! `ingest` may be called from any thread.

use crate::capture::{FixCapture, RawSample};
use crate::error::{ConfigError, FlushError, SessionError};
use crate::queue::{FixId, FixQueue};
use crate::sync::scheduler::{FlushPermit, SyncScheduler, SyncState};
use crate::sync::throttle::{ThrottleController, ThrottleSignal};
use crate::upload::{FlushOutcome, FlushReport, GrantProvider, RemoteEndpoint, UploadWorker};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Capacity of the flush report channel; slow subscribers miss old reports
const REPORT_CHANNEL_SIZE: usize = 64;

/// Outcome of the most recent transmission, for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
    #[default]
    NoAttempt,
    TransmissionSuccess,
    TransmissionError,
}

/// Counters for one session
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    /// Samples queued
    pub fixes_captured: u64,
    /// Samples dropped as invalid
    pub fixes_rejected: u64,
    /// Records acknowledged by the endpoint
    pub fixes_delivered: u64,
    pub flushes_ok: u64,
    pub flushes_failed: u64,
    pub grants_expired: u64,
    /// Endpoint rejections that will not succeed on retry
    pub permanent_rejections: u64,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub device_id: String,
    pub max_batch_size: usize,
}

struct Shared {
    queue: Arc<FixQueue>,
    scheduler: Arc<SyncScheduler>,
    throttle: Arc<ThrottleController>,
    worker: UploadWorker,
    runtime: Handle,
    in_flight: Mutex<Option<JoinHandle<()>>>,
    reports: broadcast::Sender<FlushReport>,
    stats: Mutex<SessionStats>,
    connectivity: Mutex<Connectivity>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    /// Start a flush if the scheduler grants one
    fn maybe_flush(self: &Arc<Self>, permit: Option<FlushPermit>) -> bool {
        let Some(permit) = permit else {
            return false;
        };

        // `stop` flips the scheduler under this lock, so a permit issued
        // just before a stop is handed back instead of spawning unobserved.
        let mut in_flight = lock(&self.in_flight);
        if self.scheduler.is_stopped() {
            self.scheduler.on_flush_complete(permit, Instant::now());
            return false;
        }
        let shared = self.clone();
        *in_flight = Some(self.runtime.spawn(async move {
            shared.run_flush(permit).await;
        }));
        true
    }

    async fn run_flush(&self, permit: FlushPermit) {
        let report = self.worker.run().await;
        self.scheduler.on_flush_complete(permit, Instant::now());
        self.record(&report);

        // No subscribers is fine
        let _ = self.reports.send(report);
    }

    fn record(&self, report: &FlushReport) {
        let unsent = self.queue.unsent_count();
        let mut stats = lock(&self.stats);

        let connectivity = match &report.outcome {
            FlushOutcome::Delivered { count } => {
                stats.flushes_ok += 1;
                stats.fixes_delivered += *count as u64;
                tracing::info!(
                    "Delivered {} fixes in {:?} ({} unsent)",
                    count,
                    report.elapsed,
                    unsent
                );
                Some(Connectivity::TransmissionSuccess)
            }
            FlushOutcome::Empty => {
                stats.flushes_ok += 1;
                tracing::debug!("Flush found nothing to send");
                None
            }
            FlushOutcome::Failed { error } => {
                stats.flushes_failed += 1;
                match error.as_ref() {
                    FlushError::Storage(e) => {
                        tracing::error!("Flush aborted by storage failure: {}", e);
                        None
                    }
                    FlushError::Endpoint(e) if e.is_permanent() => {
                        stats.permanent_rejections += 1;
                        tracing::error!(
                            "Batch of {} fixes rejected, will retry unchanged: {}",
                            report.batch_len,
                            e
                        );
                        Some(Connectivity::TransmissionError)
                    }
                    FlushError::Endpoint(e) => {
                        tracing::warn!(
                            "Batch of {} fixes not delivered ({} unsent): {}",
                            report.batch_len,
                            unsent,
                            e
                        );
                        Some(Connectivity::TransmissionError)
                    }
                    FlushError::GrantExpired => {
                        stats.grants_expired += 1;
                        tracing::warn!(
                            "Execution grant expired with {} fixes in flight",
                            report.batch_len
                        );
                        Some(Connectivity::TransmissionError)
                    }
                }
            }
        };

        if let Some(connectivity) = connectivity {
            *lock(&self.connectivity) = connectivity;
        }
    }
}

pub struct SyncSession {
    shared: Arc<Shared>,
    capture: FixCapture,
    signal_task: JoinHandle<()>,
}

impl SyncSession {
    /// Start a session on the current Tokio runtime.
    ///
    /// Must be called from within a runtime context.
    pub fn start(
        queue: Arc<FixQueue>,
        throttle: Arc<ThrottleController>,
        endpoint: Arc<dyn RemoteEndpoint>,
        grants: Arc<dyn GrantProvider>,
        settings: SessionSettings,
    ) -> Result<Self, ConfigError> {
        let worker = UploadWorker::new(
            queue.clone(),
            endpoint,
            grants,
            settings.device_id.as_str(),
            settings.max_batch_size,
        )?;
        let runtime = Handle::current();
        let scheduler = Arc::new(SyncScheduler::new(throttle.clone(), Instant::now()));
        let capture = FixCapture::new(settings.device_id.clone(), queue.clone());
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_SIZE);

        let mut signals = throttle.subscribe();
        let signal_task = runtime.spawn({
            let scheduler = scheduler.clone();
            async move {
                while let Some(signal) = signals.recv().await {
                    match signal {
                        ThrottleSignal::Accelerate => {
                            scheduler.accelerate(Instant::now());
                        }
                    }
                }
            }
        });

        tracing::info!(
            "Tracking session started for device {} ({} fixes waiting)",
            settings.device_id,
            queue.unsent_count()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                queue,
                scheduler,
                throttle,
                worker,
                runtime,
                in_flight: Mutex::new(None),
                reports,
                stats: Mutex::new(SessionStats::default()),
                connectivity: Mutex::new(Connectivity::default()),
            }),
            capture,
            signal_task,
        })
    }

    /// Feed one location sample. Returns the id it was queued under, or
    /// `None` if the sample was invalid.
    pub fn ingest(&self, raw: &RawSample) -> Result<Option<FixId>, SessionError> {
        let id = self.capture.capture(raw)?;

        {
            let mut stats = lock(&self.shared.stats);
            match id {
                Some(_) => stats.fixes_captured += 1,
                None => stats.fixes_rejected += 1,
            }
        }

        if id.is_some() {
            let permit = self.shared.scheduler.on_fix_appended(Instant::now());
            self.shared.maybe_flush(permit);
        }
        Ok(id)
    }

    /// Run the due-time check without a new fix. Returns whether a flush
    /// was started.
    pub fn check_now(&self) -> bool {
        let permit = self.shared.scheduler.check(Instant::now());
        self.shared.maybe_flush(permit)
    }

    /// Forward a power-policy change to the throttle. Leaving power saving
    /// takes effect before this returns, so the next sample is already due.
    pub fn set_power_saving(&self, enabled: bool) {
        if let Some(ThrottleSignal::Accelerate) = self.shared.throttle.set_power_saving(enabled) {
            self.shared.scheduler.accelerate(Instant::now());
        }
    }

    /// Wait for the flush currently in flight, if any
    pub async fn wait_idle(&self) {
        let handle = lock(&self.shared.in_flight).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Flush task failed: {}", e);
            }
        }
    }

    /// Stop capture and scheduling. An in-flight flush is allowed to finish
    /// and is awaited before returning.
    pub async fn stop(&self) -> SessionStats {
        self.capture.stop();
        {
            let _in_flight = lock(&self.shared.in_flight);
            self.shared.scheduler.stop();
        }
        self.signal_task.abort();
        self.wait_idle().await;

        let stats = self.stats();
        tracing::info!(
            "Tracking session stopped: {} captured, {} delivered, {} unsent",
            stats.fixes_captured,
            stats.fixes_delivered,
            self.shared.queue.unsent_count()
        );
        stats
    }

    pub fn subscribe_reports(&self) -> broadcast::Receiver<FlushReport> {
        self.shared.reports.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        lock(&self.shared.stats).clone()
    }

    pub fn connectivity(&self) -> Connectivity {
        *lock(&self.shared.connectivity)
    }

    pub fn sync_state(&self) -> SyncState {
        self.shared.scheduler.snapshot()
    }

    pub fn unsent_count(&self) -> usize {
        self.shared.queue.unsent_count()
    }

    pub fn queue(&self) -> &Arc<FixQueue> {
        &self.shared.queue
    }

    pub fn throttle(&self) -> &Arc<ThrottleController> {
        &self.shared.throttle
    }

    pub fn device_id(&self) -> &str {
        self.capture.device_id()
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.signal_task.abort();
    }
}
