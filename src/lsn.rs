//! Log sequence numbers and stream position tracking.
//!
//! [`Lsn`] is the 64-bit WAL position PostgreSQL reports on every replication
//! frame, rendered as two 32-bit hex groups (`16/B374D848`).
//!
//! [`LsnTracker`] holds the positions a session shares between its read loop
//! and its acknowledgment scheduler. Each field has a single writer: the read
//! loop advances the last-seen position, and only the acknowledgment path
//! advances the acknowledged position and its timestamp.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::time::Instant;
use tracing::debug;

use crate::{Error, Result};

/// A position in the write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// `0/0`, which PostgreSQL uses as "no position".
    pub const ZERO: Lsn = Lsn(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (high, low) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidLsn(s.to_string()))?;

        let high = u32::from_str_radix(high, 16).map_err(|_| Error::InvalidLsn(s.to_string()))?;
        let low = u32::from_str_radix(low, 16).map_err(|_| Error::InvalidLsn(s.to_string()))?;

        Ok(Lsn(((high as u64) << 32) | low as u64))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Shared last-seen / last-acknowledged positions of one session.
#[derive(Debug)]
pub struct LsnTracker {
    epoch: Instant,
    last_seen: AtomicU64,
    acknowledged: AtomicU64,
    /// Milliseconds after `epoch` of the last successful acknowledgment.
    last_ack_millis: AtomicU64,
}

impl LsnTracker {
    /// Creates a tracker whose acknowledgment clock starts now.
    pub fn new() -> Self {
        Self::starting_at(Lsn::ZERO)
    }

    /// Creates a tracker that treats `start` as already acknowledged, used
    /// when resuming a slot from a known position.
    pub fn starting_at(start: Lsn) -> Self {
        Self {
            epoch: Instant::now(),
            last_seen: AtomicU64::new(start.0),
            acknowledged: AtomicU64::new(start.0),
            last_ack_millis: AtomicU64::new(0),
        }
    }

    /// Records a position read off the wire. Positions behind the current
    /// last-seen value are ignored.
    pub fn observe(&self, lsn: Lsn) {
        let previous = self.last_seen.fetch_max(lsn.0, Ordering::AcqRel);
        if lsn.0 < previous {
            debug!(lsn = %lsn, last_seen = %Lsn(previous), "Ignoring LSN behind last seen position");
        }
    }

    /// Records a successful acknowledgment of `lsn` at `at`.
    pub fn record_ack(&self, lsn: Lsn, at: Instant) {
        self.acknowledged.fetch_max(lsn.0, Ordering::AcqRel);
        self.touch(at);
    }

    /// Restarts the staleness clock without moving the acknowledged position.
    pub fn touch(&self, at: Instant) {
        let millis = at.saturating_duration_since(self.epoch).as_millis() as u64;
        self.last_ack_millis.store(millis, Ordering::Release);
    }

    /// The highest position read so far, or `None` before the first frame.
    pub fn last_seen(&self) -> Option<Lsn> {
        match self.last_seen.load(Ordering::Acquire) {
            0 => None,
            value => Some(Lsn(value)),
        }
    }

    pub fn acknowledged(&self) -> Lsn {
        Lsn(self.acknowledged.load(Ordering::Acquire))
    }

    pub fn last_ack_at(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_ack_millis.load(Ordering::Acquire))
    }

    pub fn elapsed_since_ack(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_ack_at())
    }

    /// Whether at least `timeout` has passed since the last acknowledgment.
    ///
    /// Ticks land on a discrete grid, so the comparison is inclusive: a one
    /// second timeout is stale on the one second tick.
    pub fn is_stale(&self, timeout: Duration, now: Instant) -> bool {
        self.elapsed_since_ack(now) >= timeout
    }
}

impl Default for LsnTracker {
    fn default() -> Self {
        Self::new()
    }
}
