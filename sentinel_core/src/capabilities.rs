//! Clock and id-generator capabilities consumed by the context.

use crate::constants::{ENT_ID_NONE, FIRST_ENT_ID, USEC_PER_SEC};
use crate::errors::{Error, Result};
use crate::types::{EntId, ObjectType, Time};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Current monotonic time in microseconds.
    fn now(&self) -> Time;

    fn diff(&self, later: Time, earlier: Time) -> Time {
        later.saturating_sub(earlier)
    }

    fn add(&self, start: Time, interval: Time) -> Time {
        start.saturating_add(interval)
    }

    /// Converts a clock reading to (seconds, nanoseconds) since the Unix epoch.
    fn to_epoch(&self, when: Time) -> (i64, i32);

    fn interval_to_seconds(&self, howlong: Time) -> (i64, i32) {
        (howlong / USEC_PER_SEC, ((howlong % USEC_PER_SEC) * 1000) as i32)
    }

    fn interval_from_seconds(&self, secs: i64, nsecs: i32) -> Time {
        secs.saturating_mul(USEC_PER_SEC)
            .saturating_add(nsecs as i64 / 1000)
    }
}

/// `Instant`-based clock anchored to the wall clock at construction.
pub struct MonotonicClock {
    origin: Instant,
    origin_epoch_usecs: i64,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        let origin_epoch_usecs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Self {
            origin: Instant::now(),
            origin_epoch_usecs,
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Time {
        self.origin.elapsed().as_micros() as Time
    }

    fn to_epoch(&self, when: Time) -> (i64, i32) {
        let usecs = self.origin_epoch_usecs.saturating_add(when);
        (usecs.div_euclid(USEC_PER_SEC), (usecs.rem_euclid(USEC_PER_SEC) * 1000) as i32)
    }
}

pub trait IdGenerator: Send + Sync {
    /// Produces an id never handed out before by this generator.
    fn make_id(&self, kind: ObjectType) -> Result<EntId>;
}

/// Process-lifetime counter starting at [`FIRST_ENT_ID`].
pub struct SequentialIds {
    next: AtomicU64,
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new()
    }
}

impl SequentialIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(FIRST_ENT_ID),
        }
    }
}

impl IdGenerator for SequentialIds {
    fn make_id(&self, _kind: ObjectType) -> Result<EntId> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        if id == ENT_ID_NONE {
            // Wrapped: every id has been used.
            return Err(Error::SysResourceFailed);
        }
        Ok(id)
    }
}
