//! Fix capture.
//!
//! Turns raw location samples into queued fix records. One valid sample
//! produces exactly one append; there is no batching at this layer.

use crate::error::SessionError;
use crate::queue::{FixId, FixQueue, NewFix};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// One sample as delivered by the location source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSample {
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
    /// Metres per second
    pub speed: f64,
    /// Course over ground in degrees
    pub course: f64,
    pub is_valid: bool,
}

/// Normalize a raw sample, or `None` if it must be dropped.
///
/// Samples flagged invalid are dropped, as are samples whose position or time
/// is not a finite number.
pub fn normalize(raw: &RawSample, device_id: &str) -> Option<NewFix> {
    if !raw.is_valid {
        return None;
    }
    if !(raw.timestamp.is_finite() && raw.latitude.is_finite() && raw.longitude.is_finite()) {
        return None;
    }

    Some(NewFix {
        device_id: device_id.to_string(),
        timestamp_ms: (raw.timestamp * 1000.0).trunc() as i64,
        latitude: raw.latitude,
        longitude: raw.longitude,
        speed: raw.speed,
        bearing: raw.course,
    })
}

pub struct FixCapture {
    device_id: String,
    queue: Arc<FixQueue>,
    active: AtomicBool,
    last_timestamp_ms: AtomicI64,
}

impl FixCapture {
    pub fn new(device_id: impl Into<String>, queue: Arc<FixQueue>) -> Self {
        Self {
            device_id: device_id.into(),
            queue,
            active: AtomicBool::new(true),
            last_timestamp_ms: AtomicI64::new(i64::MIN),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Latest timestamp among samples actually queued
    pub fn last_queued_ms(&self) -> Option<i64> {
        match self.last_timestamp_ms.load(Ordering::Acquire) {
            i64::MIN => None,
            ms => Some(ms),
        }
    }

    /// Validate and queue one sample.
    ///
    /// Returns `Ok(None)` when the sample was dropped. A storage failure is
    /// returned as-is and the sample is not queued.
    pub fn capture(&self, raw: &RawSample) -> Result<Option<FixId>, SessionError> {
        if !self.active.load(Ordering::Acquire) {
            return Err(SessionError::Stopped);
        }

        let Some(fix) = normalize(raw, &self.device_id) else {
            tracing::trace!("Dropped invalid sample at {}", raw.timestamp);
            return Ok(None);
        };

        let timestamp_ms = fix.timestamp_ms;
        let id = self.queue.append(fix)?;

        // The queue keeps append order; callers are expected to feed samples
        // chronologically. Only queued samples move the mark.
        let previous = self
            .last_timestamp_ms
            .fetch_max(timestamp_ms, Ordering::AcqRel);
        if timestamp_ms < previous {
            tracing::warn!(
                "Sample at {} ms arrived after {} ms; queued out of order",
                timestamp_ms,
                previous
            );
        }

        Ok(Some(id))
    }

    /// Refuse all further samples
    pub fn stop(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}
