//! Gateway statistics.
//!
//! A ring of the most recent received messages plus cumulative counters.
//! Everything sits behind one mutex so that a reader (the admin page, the
//! periodic `stat` report) always sees a snapshot taken between two events,
//! never halfway through one.

use crate::lora::SpreadingFactor;
use log::warn;
use std::sync::{Mutex, MutexGuard};

/// Default number of records kept in the ring.
pub const DEFAULT_STAT_RECORDS: usize = 20;

/// One received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatRecord {
    pub timestamp_ms: i64,
    pub node_address: [u8; 4],
    pub channel_index: u8,
    pub spreading_factor: SpreadingFactor,
    pub rssi_dbm: i16,
}

/// Fixed-capacity ring of records, oldest overwritten first.
#[derive(Debug, Clone)]
pub struct StatRing {
    records: Vec<StatRecord>,
    capacity: usize,
    count: u64,
}

impl StatRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
            count: 0,
        }
    }

    pub fn push(&mut self, record: StatRecord) {
        let index = (self.count % self.capacity as u64) as usize;
        if index < self.records.len() {
            self.records[index] = record;
        } else {
            self.records.push(record);
        }
        self.count += 1;
    }

    /// Records in arrival order, oldest first.
    pub fn snapshot(&self) -> Vec<StatRecord> {
        if self.records.len() < self.capacity {
            return self.records.clone();
        }
        let start = (self.count % self.capacity as u64) as usize;
        let mut out = Vec::with_capacity(self.capacity);
        out.extend_from_slice(&self.records[start..]);
        out.extend_from_slice(&self.records[..start]);
        out
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total records ever pushed.
    pub fn total(&self) -> u64 {
        self.count
    }

    fn clear(&mut self) {
        self.records.clear();
        self.count = 0;
    }
}

/// Cumulative counters. All saturate instead of wrapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatCounters {
    /// Received messages per spreading factor, SF7 first.
    pub per_sf: [u64; 6],
    pub boots: u64,
    pub resets: u64,

    pub rx_ok: u64,
    pub rx_crc_errors: u64,
    pub rx_bad_header: u64,
    pub rx_timeouts: u64,
    pub uplinks_dropped: u64,
    pub cad_no_activity: u64,
    pub cad_detected: u64,

    pub downlinks_received: u64,
    pub downlinks_rejected: u64,
    pub missed_downlinks: u64,
    pub tx_ok: u64,
    pub tx_failed: u64,

    pub bus_errors: u64,

    pub push_sent: u64,
    pub push_acked: u64,
    pub pull_sent: u64,
    pub pull_acked: u64,
    pub token_timeouts: u64,
    pub push_retries: u64,
    pub push_discarded: u64,
}

impl StatCounters {
    pub fn sf_count(&self, sf: SpreadingFactor) -> u64 {
        self.per_sf[(sf.value() - 7) as usize]
    }

    /// Uplinks received, any spreading factor.
    pub fn received(&self) -> u64 {
        self.per_sf.iter().fold(0u64, |acc, n| acc.saturating_add(*n))
    }

    /// Percentage of PUSH_DATA acknowledged by the backend.
    pub fn ack_ratio(&self) -> f64 {
        if self.push_sent == 0 {
            return 0.0;
        }
        self.push_acked as f64 * 100.0 / self.push_sent as f64
    }
}

/// Increment a counter without wrapping.
pub fn bump(counter: &mut u64) {
    *counter = counter.saturating_add(1);
}

/// Consistent copy of the statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub records: Vec<StatRecord>,
    pub counters: StatCounters,
}

struct Inner {
    ring: StatRing,
    counters: StatCounters,
}

/// Shared statistics store.
pub struct Statistics {
    inner: Mutex<Inner>,
}

impl Statistics {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: StatRing::new(capacity),
                counters: StatCounters::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Statistics mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn record(&self, record: StatRecord) {
        self.lock().ring.push(record);
    }

    /// Count a received message on `sf`.
    pub fn bump_sf(&self, sf: SpreadingFactor) {
        bump(&mut self.lock().counters.per_sf[(sf.value() - 7) as usize]);
    }

    /// Record an uplink in one step: ring entry, per-SF counter and `rx_ok`.
    pub fn record_uplink(&self, record: StatRecord) {
        let mut inner = self.lock();
        let sf = record.spreading_factor;
        inner.ring.push(record);
        bump(&mut inner.counters.per_sf[(sf.value() - 7) as usize]);
        bump(&mut inner.counters.rx_ok);
    }

    pub fn bump_reboot(&self) {
        bump(&mut self.lock().counters.boots);
    }

    pub fn bump_reset(&self) {
        bump(&mut self.lock().counters.resets);
    }

    /// Mutate counters under the lock.
    pub fn update(&self, f: impl FnOnce(&mut StatCounters)) {
        f(&mut self.lock().counters);
    }

    pub fn counters(&self) -> StatCounters {
        self.lock().counters
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.lock();
        StatsSnapshot {
            records: inner.ring.snapshot(),
            counters: inner.counters,
        }
    }

    /// Operator reset: clears records and event counters, keeps the boot
    /// count and counts the reset.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.ring.clear();
        let boots = inner.counters.boots;
        let resets = inner.counters.resets.saturating_add(1);
        inner.counters = StatCounters {
            boots,
            resets,
            ..StatCounters::default()
        };
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new(DEFAULT_STAT_RECORDS)
    }
}
