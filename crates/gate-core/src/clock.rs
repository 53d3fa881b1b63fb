//! Injectable time and identifier sources.
//!
//! Engines never read the wall clock directly, so expiry and renewal-window
//! behavior can be tested with [`ManualClock`].

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::Rng;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current time in Unix seconds.
    fn unix(&self) -> i64 {
        self.now().timestamp()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    secs: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            secs: AtomicI64::new(start.timestamp()),
        }
    }

    pub fn at_unix(secs: i64) -> Self {
        Self {
            secs: AtomicI64::new(secs),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.secs.store(at.timestamp(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.secs.fetch_add(by.num_seconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let secs = self.secs.load(Ordering::SeqCst);
        Utc.timestamp_opt(secs, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// Source of new application identifiers.
pub trait IdGenerator: Send + Sync {
    fn next_app_id(&self) -> u64;
}

/// Sequence-based ids of the form `1 SSSSSSS RRRR`: a leading 1, a seven
/// digit sequence, and four random digits. Strictly increasing per generator.
#[derive(Debug)]
pub struct SequenceIdGenerator {
    seq: AtomicU64,
}

impl SequenceIdGenerator {
    const BASE: u64 = 100_000_000_000;
    const SEQ_LIMIT: u64 = 10_000_000;

    pub fn new(start: u64) -> Self {
        Self {
            seq: AtomicU64::new(start),
        }
    }
}

impl Default for SequenceIdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}

impl IdGenerator for SequenceIdGenerator {
    fn next_app_id(&self) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) % Self::SEQ_LIMIT;
        let salt: u64 = rand::thread_rng().gen_range(0..10_000);
        Self::BASE + seq * 10_000 + salt
    }
}
