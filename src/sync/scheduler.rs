//! Flush scheduling state machine.
//!
//! `Idle -> Running` happens only through `FlushPermit`, and only one permit
//! can exist at a time. The permit is consumed when the flush completes,
//! which is the only way back to `Idle`.

use crate::sync::throttle::ThrottleController;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
}

/// Scheduling state of one tracking session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncState {
    pub next_allowed_sync: Instant,
    pub phase: Phase,
    /// Interval applied at the last completion
    pub current_interval: Duration,
}

/// Proof that the caller owns the single running flush
#[derive(Debug)]
#[must_use = "a flush permit must be returned through on_flush_complete"]
pub struct FlushPermit {
    attempt: u64,
    started: Instant,
}

impl FlushPermit {
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn started(&self) -> Instant {
        self.started
    }
}

struct SchedulerInner {
    sync: SyncState,
    stopped: bool,
    attempts: u64,
}

pub struct SyncScheduler {
    throttle: Arc<ThrottleController>,
    inner: Mutex<SchedulerInner>,
}

impl SyncScheduler {
    /// A new session is due immediately, so its first fix is flushed.
    pub fn new(throttle: Arc<ThrottleController>, now: Instant) -> Self {
        let current_interval = throttle.current_interval();
        Self {
            throttle,
            inner: Mutex::new(SchedulerInner {
                sync: SyncState {
                    next_allowed_sync: now,
                    phase: Phase::Idle,
                    current_interval,
                },
                stopped: false,
                attempts: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A fix was durably appended. Returns a permit if a flush should start.
    pub fn on_fix_appended(&self, now: Instant) -> Option<FlushPermit> {
        self.try_start(now, "new fix")
    }

    /// Same decision as a new fix, without one having arrived
    pub fn check(&self, now: Instant) -> Option<FlushPermit> {
        self.try_start(now, "explicit check")
    }

    fn try_start(&self, now: Instant, trigger: &str) -> Option<FlushPermit> {
        let mut inner = self.lock();

        if inner.stopped {
            return None;
        }
        if inner.sync.phase == Phase::Running {
            tracing::trace!("{}: flush already running", trigger);
            return None;
        }
        if now < inner.sync.next_allowed_sync {
            tracing::trace!(
                "{}: next flush allowed in {:?}",
                trigger,
                inner.sync.next_allowed_sync - now
            );
            return None;
        }

        inner.sync.phase = Phase::Running;
        inner.attempts += 1;
        tracing::debug!("{}: starting flush attempt {}", trigger, inner.attempts);

        Some(FlushPermit {
            attempt: inner.attempts,
            started: now,
        })
    }

    /// Record the end of a flush, successful or not. Returns the next time a
    /// flush is allowed.
    pub fn on_flush_complete(&self, permit: FlushPermit, now: Instant) -> Instant {
        let mut inner = self.lock();
        let interval = self.throttle.current_interval();

        inner.sync.phase = Phase::Idle;
        inner.sync.current_interval = interval;
        inner.sync.next_allowed_sync = now + interval;

        tracing::debug!(
            "Flush attempt {} finished after {:?}; next allowed in {:?}",
            permit.attempt,
            now.saturating_duration_since(permit.started),
            interval
        );

        inner.sync.next_allowed_sync
    }

    /// Make the next check due immediately. Has no effect while a flush is
    /// running, since completion recomputes the due time anyway.
    pub fn accelerate(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        if inner.stopped || inner.sync.phase != Phase::Idle {
            return false;
        }

        if inner.sync.next_allowed_sync > now {
            inner.sync.next_allowed_sync = now;
            tracing::debug!("Flush schedule accelerated");
        }
        true
    }

    /// Stop making scheduling decisions. A running flush may still complete.
    pub fn stop(&self) {
        self.lock().stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    pub fn snapshot(&self) -> SyncState {
        self.lock().sync
    }
}
