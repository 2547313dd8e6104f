use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Counters shared by every stage of one run.
#[derive(Debug)]
pub struct PipelineStats {
    bytes_read: AtomicU64,
    raw_ranges: AtomicU64,
    source_stalls: AtomicU64,
    peak_in_flight: AtomicUsize,
    fragments_emitted: AtomicU64,
    carry_spills: AtomicU64,
    header_bytes: AtomicU64,
    body_bytes: AtomicU64,
    bytes_written: AtomicU64,
    shards_sealed: AtomicU64,
    shards_discarded: AtomicU64,
    workers_spawned: AtomicUsize,
    start_time: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub bytes_read: u64,
    pub raw_ranges: u64,
    pub source_stalls: u64,
    pub peak_in_flight: usize,
    pub fragments_emitted: u64,
    pub carry_spills: u64,
    pub header_bytes: u64,
    /// Fragment bytes handed to shard writers, before compression.
    pub body_bytes: u64,
    /// Bytes written to shard streams, after compression, headers included.
    pub bytes_written: u64,
    pub shards_sealed: u64,
    pub shards_discarded: u64,
    pub workers_spawned: usize,
    pub elapsed_ms: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            bytes_read: AtomicU64::new(0),
            raw_ranges: AtomicU64::new(0),
            source_stalls: AtomicU64::new(0),
            peak_in_flight: AtomicUsize::new(0),
            fragments_emitted: AtomicU64::new(0),
            carry_spills: AtomicU64::new(0),
            header_bytes: AtomicU64::new(0),
            body_bytes: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            shards_sealed: AtomicU64::new(0),
            shards_discarded: AtomicU64::new(0),
            workers_spawned: AtomicUsize::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_read(&self, bytes: usize, in_flight: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
        self.raw_ranges.fetch_add(1, Ordering::Relaxed);
        self.peak_in_flight.fetch_max(in_flight, Ordering::Relaxed);
    }

    pub fn record_stall(&self) {
        self.source_stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fragment(&self) {
        self.fragments_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spill(&self) {
        self.carry_spills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_header(&self, bytes: usize) {
        self.header_bytes.store(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_write(&self, body_bytes: usize, written: u64) {
        self.body_bytes.fetch_add(body_bytes as u64, Ordering::Relaxed);
        self.bytes_written.fetch_add(written, Ordering::Relaxed);
    }

    pub fn record_shard_bytes(&self, written: u64) {
        self.bytes_written.fetch_add(written, Ordering::Relaxed);
    }

    pub fn record_sealed(&self) {
        self.shards_sealed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self) {
        self.shards_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker(&self) {
        self.workers_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            raw_ranges: self.raw_ranges.load(Ordering::Relaxed),
            source_stalls: self.source_stalls.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
            fragments_emitted: self.fragments_emitted.load(Ordering::Relaxed),
            carry_spills: self.carry_spills.load(Ordering::Relaxed),
            header_bytes: self.header_bytes.load(Ordering::Relaxed),
            body_bytes: self.body_bytes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            shards_sealed: self.shards_sealed.load(Ordering::Relaxed),
            shards_discarded: self.shards_discarded.load(Ordering::Relaxed),
            workers_spawned: self.workers_spawned.load(Ordering::Relaxed),
            elapsed_ms: self.elapsed().as_millis() as u64,
        }
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}
