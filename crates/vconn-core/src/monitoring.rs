//! Dispatch Monitoring and Diagnostics
//!
//! Per-tier latency counters and a bounded ring of slow-message samples.
//! None of this affects dispatch outcome; it only feeds the diagnostics
//! report.

use crate::message::Message;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds since the UNIX epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ----------------------------------------------------------------------------
// Dispatch Tiers
// ----------------------------------------------------------------------------

/// Stage of the inbound pipeline being measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DispatchTier {
    FastPreprocess,
    FastDispatch,
    Dispatch,
}

impl DispatchTier {
    pub const ALL: [DispatchTier; 3] = [
        DispatchTier::FastPreprocess,
        DispatchTier::FastDispatch,
        DispatchTier::Dispatch,
    ];

    fn index(self) -> usize {
        match self {
            DispatchTier::FastPreprocess => 0,
            DispatchTier::FastDispatch => 1,
            DispatchTier::Dispatch => 2,
        }
    }

    pub fn tier_name(self) -> &'static str {
        match self {
            DispatchTier::FastPreprocess => "fast_preprocess",
            DispatchTier::FastDispatch => "fast_dispatch",
            DispatchTier::Dispatch => "dispatch",
        }
    }
}

#[derive(Debug, Default)]
struct LatencyCounter {
    sum_us: AtomicU64,
    count: AtomicU64,
    max_us: AtomicU64,
}

impl LatencyCounter {
    fn record(&self, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencyStats {
        let count = self.count.load(Ordering::Relaxed);
        let sum_us = self.sum_us.load(Ordering::Relaxed);
        LatencyStats {
            count,
            sum_us,
            max_us: self.max_us.load(Ordering::Relaxed),
            avg_us: if count > 0 { sum_us / count } else { 0 },
        }
    }

    fn clear(&self) {
        self.sum_us.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
        self.max_us.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct TierCounters {
    /// Whole tier including lookups
    total: LatencyCounter,
    /// Time spent inside dispatcher handlers only
    handlers: LatencyCounter,
}

/// Aggregate latency figures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: u64,
    pub sum_us: u64,
    pub max_us: u64,
    pub avg_us: u64,
}

/// Latency figures for one tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStats {
    pub tier: DispatchTier,
    pub total: LatencyStats,
    pub handlers: LatencyStats,
}

// ----------------------------------------------------------------------------
// Slow Message Samples
// ----------------------------------------------------------------------------

/// Stage timings of one slow message, as offsets from receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlowMessageSample {
    pub tier: DispatchTier,
    pub summary: String,
    pub src: String,
    pub dst: String,
    pub captured_at: u64,
    pub throttle_us: Option<u64>,
    pub recv_complete_us: Option<u64>,
    pub preprocess_end_us: Option<u64>,
    pub handler_begin_us: u64,
    pub handler_end_us: u64,
    /// Receipt to end of the sampled tier
    pub total_ms: u64,
}

impl SlowMessageSample {
    pub fn capture(tier: DispatchTier, msg: &Message, begin: Instant, end: Instant) -> Self {
        let recv = msg.stamps.recv.unwrap_or(begin);
        let offset = |at: Instant| at.saturating_duration_since(recv).as_micros() as u64;
        Self {
            tier,
            summary: msg.summary(),
            src: msg.src().to_string(),
            dst: msg.dst().to_string(),
            captured_at: current_timestamp(),
            throttle_us: msg.stamps.throttle.map(offset),
            recv_complete_us: msg.stamps.recv_complete.map(offset),
            preprocess_end_us: msg.stamps.preprocess_end.map(offset),
            handler_begin_us: offset(begin),
            handler_end_us: offset(end),
            total_ms: end.saturating_duration_since(recv).as_millis() as u64,
        }
    }
}

/// Fixed-capacity ring; the oldest sample is evicted when full
#[derive(Debug)]
pub struct SlowSampleRing {
    capacity: usize,
    samples: Mutex<VecDeque<SlowMessageSample>>,
}

impl SlowSampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, sample: SlowMessageSample) {
        if self.capacity == 0 {
            return;
        }
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    pub fn snapshot(&self) -> Vec<SlowMessageSample> {
        self.samples.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
    }
}

// ----------------------------------------------------------------------------
// Dispatch Monitor
// ----------------------------------------------------------------------------

/// Collects tier latencies and slow samples for one messenger
#[derive(Debug)]
pub struct DispatchMonitor {
    tiers: [TierCounters; 3],
    slow_threshold: Duration,
    ring: SlowSampleRing,
}

impl DispatchMonitor {
    pub fn new(slow_threshold: Duration, sample_capacity: usize) -> Self {
        Self {
            tiers: Default::default(),
            slow_threshold,
            ring: SlowSampleRing::new(sample_capacity),
        }
    }

    /// Record a tier run. `handlers` is the part spent inside dispatchers.
    pub fn record(&self, tier: DispatchTier, total: Duration, handlers: Duration) {
        let counters = &self.tiers[tier.index()];
        counters.total.record(total);
        counters.handlers.record(handlers);
    }

    /// Sample the message if receipt-to-end latency reached the threshold
    pub fn observe(&self, tier: DispatchTier, msg: &Message, begin: Instant, end: Instant) {
        let recv = msg.stamps.recv.unwrap_or(begin);
        if end.saturating_duration_since(recv) < self.slow_threshold {
            return;
        }
        let sample = SlowMessageSample::capture(tier, msg, begin, end);
        tracing::warn!(
            tier = tier.tier_name(),
            total_ms = sample.total_ms,
            msg = %sample.summary,
            "slow message dispatch"
        );
        self.ring.push(sample);
    }

    pub fn tier_stats(&self) -> Vec<TierStats> {
        DispatchTier::ALL
            .iter()
            .map(|&tier| {
                let counters = &self.tiers[tier.index()];
                TierStats {
                    tier,
                    total: counters.total.snapshot(),
                    handlers: counters.handlers.snapshot(),
                }
            })
            .collect()
    }

    pub fn slow_samples(&self) -> Vec<SlowMessageSample> {
        self.ring.snapshot()
    }

    pub fn clear(&self) {
        for counters in &self.tiers {
            counters.total.clear();
            counters.handlers.clear();
        }
        self.ring.clear();
    }
}

// ----------------------------------------------------------------------------
// Diagnostics Report
// ----------------------------------------------------------------------------

/// Number of live connections per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStateCounts {
    pub connecting: usize,
    pub connected: usize,
    pub mark_downing: usize,
    pub stopped: usize,
    /// Entries still waiting for the local address
    pub pending_source: usize,
    /// Connections bound to a physical address
    pub physically_bound: usize,
}

impl ConnectionStateCounts {
    pub fn total(&self) -> usize {
        self.connecting + self.connected + self.mark_downing + self.stopped
    }
}

/// Read-only snapshot of a messenger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub messenger_id: uuid::Uuid,
    pub name: String,
    pub local: String,
    pub generated_at: u64,
    pub connections: ConnectionStateCounts,
    pub dispatcher_owners: usize,
    pub reset_queue_depth: usize,
    pub resets_delivered: u64,
    pub tiers: Vec<TierStats>,
    pub slow_samples: Vec<SlowMessageSample>,
}
