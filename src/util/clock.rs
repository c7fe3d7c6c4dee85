use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Seconds since 2000-01-01T00:00:00Z, the epoch used for bundle timestamps
pub type DtnTime = u64;

const DTN_EPOCH_OFFSET_SECS: u64 = 946_684_800;

/// Timers further out than this (about 30 years) are armed at this offset instead
const MAX_TIMER_OFFSET_SECS: u64 = 30 * 365 * 24 * 3600;

/// Wall clock in [DtnTime] seconds, anchored to [SystemTime] once and advanced from the tokio
///  clock afterwards. This keeps expiration arithmetic consistent with tokio timers (including
///  paused time in tests).
#[derive(Clone, Copy, Debug)]
pub struct DtnClock {
    anchor_instant: Instant,
    anchor_secs: DtnTime,
}

impl DtnClock {
    pub fn new() -> DtnClock {
        let unix_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(DTN_EPOCH_OFFSET_SECS);
        Self::starting_at(unix_secs.saturating_sub(DTN_EPOCH_OFFSET_SECS))
    }

    pub fn starting_at(anchor_secs: DtnTime) -> DtnClock {
        DtnClock {
            anchor_instant: Instant::now(),
            anchor_secs,
        }
    }

    pub fn now(&self) -> DtnTime {
        self.anchor_secs.saturating_add(self.anchor_instant.elapsed().as_secs())
    }

    /// Maps an absolute [DtnTime] to the corresponding tokio instant, clamped to 'now' for
    ///  points in the past
    pub fn instant_at(&self, at: DtnTime) -> Instant {
        let elapsed_now = self.anchor_instant.elapsed().as_secs();
        let offset = at.saturating_sub(self.anchor_secs);
        if offset <= elapsed_now {
            return Instant::now();
        }
        //NB: lifetimes come from remote peers and are unbounded
        self.anchor_instant.checked_add(Duration::from_secs(offset.min(MAX_TIMER_OFFSET_SECS)))
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(MAX_TIMER_OFFSET_SECS))
    }
}

impl Default for DtnClock {
    fn default() -> Self {
        Self::new()
    }
}
