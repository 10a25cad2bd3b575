//! Pipeline counters, surfaced through the admin stats endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub samples_ingested: AtomicU64,
    pub parse_failures: AtomicU64,
    pub queue_drops: AtomicU64,
    pub spikes_replaced: AtomicU64,
    pub signal_losses: AtomicU64,
    pub subscriber_drops: AtomicU64,
    pub batch_drops: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub points_flushed: AtomicU64,
    pub flush_failures: AtomicU64,
    pub sessions_exported: AtomicU64,
    pub export_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CountersSnapshot {
    pub samples_ingested: u64,
    pub parse_failures: u64,
    pub queue_drops: u64,
    pub spikes_replaced: u64,
    pub signal_losses: u64,
    pub subscriber_drops: u64,
    pub batch_drops: u64,
    pub batches_flushed: u64,
    pub points_flushed: u64,
    pub flush_failures: u64,
    pub sessions_exported: u64,
    pub export_failures: u64,
}

impl PipelineCounters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            samples_ingested: self.samples_ingested.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            queue_drops: self.queue_drops.load(Ordering::Relaxed),
            spikes_replaced: self.spikes_replaced.load(Ordering::Relaxed),
            signal_losses: self.signal_losses.load(Ordering::Relaxed),
            subscriber_drops: self.subscriber_drops.load(Ordering::Relaxed),
            batch_drops: self.batch_drops.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            points_flushed: self.points_flushed.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            sessions_exported: self.sessions_exported.load(Ordering::Relaxed),
            export_failures: self.export_failures.load(Ordering::Relaxed),
        }
    }
}
