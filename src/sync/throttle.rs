//! Flush throttling.
//!
//! Two configured intervals, chosen by the power-saving flag. Leaving power
//! saving emits an accelerate signal so the scheduler does not sit out the
//! long interval; entering it never delays a flush that is already due.

use crate::error::ConfigError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleSignal {
    /// Power saving was switched off; the next due check should happen now
    Accelerate,
}

pub type ThrottleSignalReceiver = mpsc::UnboundedReceiver<ThrottleSignal>;

pub struct ThrottleController {
    normal_interval: Duration,
    power_saving_interval: Duration,
    /// Written by the power-policy observer, read by the scheduler
    power_saving: AtomicBool,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ThrottleSignal>>>,
}

impl ThrottleController {
    pub fn new(
        normal_interval: Duration,
        power_saving_interval: Duration,
    ) -> Result<Self, ConfigError> {
        if power_saving_interval <= normal_interval {
            return Err(ConfigError::Invalid(format!(
                "power saving interval ({:?}) must be longer than normal interval ({:?})",
                power_saving_interval, normal_interval
            )));
        }

        Ok(Self {
            normal_interval,
            power_saving_interval,
            power_saving: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn normal_interval(&self) -> Duration {
        self.normal_interval
    }

    pub fn power_saving_interval(&self) -> Duration {
        self.power_saving_interval
    }

    pub fn is_power_saving(&self) -> bool {
        self.power_saving.load(Ordering::Acquire)
    }

    /// Minimum spacing between flush attempts under the current power policy
    pub fn current_interval(&self) -> Duration {
        if self.is_power_saving() {
            self.power_saving_interval
        } else {
            self.normal_interval
        }
    }

    /// Apply a power-policy change. Returns the signal emitted, if any.
    pub fn set_power_saving(&self, enabled: bool) -> Option<ThrottleSignal> {
        let was_enabled = self.power_saving.swap(enabled, Ordering::AcqRel);
        if was_enabled == enabled {
            return None;
        }

        tracing::debug!(
            "Power saving {}; flush interval now {:?}",
            if enabled { "enabled" } else { "disabled" },
            self.current_interval()
        );

        if enabled {
            return None;
        }

        self.emit(ThrottleSignal::Accelerate);
        Some(ThrottleSignal::Accelerate)
    }

    /// Register for throttle signals. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> ThrottleSignalReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn emit(&self, signal: ThrottleSignal) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(signal).is_ok());
    }
}
