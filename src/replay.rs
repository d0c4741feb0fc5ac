//! JSON-lines event feed.
//!
//! Stands in for the device's location source and power-policy observer.
//! Each non-blank line is one event:
//!
//! ```text
//! {"kind":"fix","timestamp":1414000000.5,"latitude":54.43,"longitude":10.19,"speed":3.1,"course":270.0,"isValid":true}
//! {"kind":"power_saving","enabled":true}
//! ```

use crate::capture::RawSample;
use crate::sync::SyncSession;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceEvent {
    Fix(RawSample),
    PowerSaving { enabled: bool },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayStats {
    pub lines: u64,
    pub fixes: u64,
    pub power_changes: u64,
    pub malformed: u64,
}

/// Parse one line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Option<serde_json::Result<SourceEvent>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(serde_json::from_str(line))
}

/// Feed every event from `reader` into `session` until end of input.
///
/// Malformed lines are skipped. A storage failure stops the replay and is
/// returned, leaving the decision to the caller.
pub async fn replay<R>(reader: R, session: &SyncSession) -> Result<ReplayStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = ReplayStats::default();

    while let Some(line) = lines.next_line().await.context("Failed to read event")? {
        stats.lines += 1;

        let event = match parse_line(&line) {
            None => continue,
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                stats.malformed += 1;
                tracing::warn!("Skipping malformed event on line {}: {}", stats.lines, e);
                continue;
            }
        };

        match event {
            SourceEvent::Fix(sample) => {
                stats.fixes += 1;
                session
                    .ingest(&sample)
                    .with_context(|| format!("Failed to queue fix on line {}", stats.lines))?;
            }
            SourceEvent::PowerSaving { enabled } => {
                stats.power_changes += 1;
                session.set_power_saving(enabled);
            }
        }
    }

    Ok(stats)
}
