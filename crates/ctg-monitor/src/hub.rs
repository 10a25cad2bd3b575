//! Fan-out hub: immediate per-sample streams plus a per-device batch
//! accumulator drained to batch subscribers on a fixed period.
//!
//! All sends are non-blocking. A full subscriber channel drops that
//! subscriber's copy; a closed channel removes the subscriber.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ctg_grpc::ctg::{CtgBatchResponse, CtgDataResponse};
use ctg_protocol::sample::SIGNAL_LOSS;

use crate::metrics::PipelineCounters;

/// Capacity of one stream subscriber's channel, in samples.
const STREAM_CHANNEL_CAPACITY: usize = 2000;
/// Capacity of one batch subscriber's channel, in batches.
const BATCH_CHANNEL_CAPACITY: usize = 1000;
/// Batch accumulator drain period.
pub const BATCH_INTERVAL: Duration = Duration::from_secs(240);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberKind {
    Stream,
    Batch,
}

#[derive(Debug, Clone, Default)]
pub struct SubscriberFilter {
    pub device_ids: Vec<String>,
    pub data_types: Vec<String>,
}

impl SubscriberFilter {
    fn admits_device(&self, device_id: &str) -> bool {
        self.device_ids.is_empty() || self.device_ids.iter().any(|d| d == device_id)
    }

    fn admits(&self, sample: &CtgDataResponse) -> bool {
        self.admits_device(&sample.device_id)
            && (self.data_types.is_empty()
                || self.data_types.iter().any(|t| *t == sample.data_type))
    }
}

struct StreamSubscriber {
    filter: SubscriberFilter,
    tx: mpsc::Sender<CtgDataResponse>,
    dropped: u64,
}

struct BatchSubscriber {
    filter: SubscriberFilter,
    tx: mpsc::Sender<CtgBatchResponse>,
    dropped: u64,
}

pub struct FanoutHub {
    next_id: AtomicU64,
    stream_subs: Mutex<HashMap<u64, StreamSubscriber>>,
    batch_subs: Mutex<HashMap<u64, BatchSubscriber>>,
    accumulator: Mutex<HashMap<String, Vec<CtgDataResponse>>>,
    counters: Arc<PipelineCounters>,
}

impl FanoutHub {
    pub fn new(counters: Arc<PipelineCounters>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            stream_subs: Mutex::new(HashMap::new()),
            batch_subs: Mutex::new(HashMap::new()),
            accumulator: Mutex::new(HashMap::new()),
            counters,
        }
    }

    pub async fn subscribe_stream(
        &self,
        filter: SubscriberFilter,
    ) -> (u64, mpsc::Receiver<CtgDataResponse>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        self.stream_subs.lock().await.insert(
            id,
            StreamSubscriber {
                filter,
                tx,
                dropped: 0,
            },
        );
        info!(subscriber = id, "stream subscriber registered");
        (id, rx)
    }

    pub async fn subscribe_batch(
        &self,
        filter: SubscriberFilter,
    ) -> (u64, mpsc::Receiver<CtgBatchResponse>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        self.batch_subs.lock().await.insert(
            id,
            BatchSubscriber {
                filter,
                tx,
                dropped: 0,
            },
        );
        info!(subscriber = id, "batch subscriber registered");
        (id, rx)
    }

    /// Remove a subscriber entry; dropping its sender closes the channel
    /// exactly once. Safe to call twice (the send path also prunes closed
    /// subscribers).
    pub async fn unsubscribe(&self, kind: SubscriberKind, id: u64) {
        let removed = match kind {
            SubscriberKind::Stream => self.stream_subs.lock().await.remove(&id).is_some(),
            SubscriberKind::Batch => self.batch_subs.lock().await.remove(&id).is_some(),
        };
        if removed {
            info!(subscriber = id, "subscriber deregistered");
        }
    }

    /// Deliver one sample to every matching stream subscriber and append it
    /// to the batch accumulator. Signal-loss samples skip the live streams
    /// but still reach batches.
    pub async fn broadcast(&self, sample: CtgDataResponse) {
        if sample.value != SIGNAL_LOSS {
            let mut subs = self.stream_subs.lock().await;
            let mut closed = Vec::new();
            for (id, sub) in subs.iter_mut() {
                if !sub.filter.admits(&sample) {
                    continue;
                }
                match sub.tx.try_send(sample.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        if sub.dropped == 0 {
                            warn!(subscriber = *id, "stream subscriber channel full, dropping");
                        }
                        sub.dropped += 1;
                        self.counters.subscriber_drops.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
            for id in closed {
                subs.remove(&id);
                debug!(subscriber = id, "pruned closed stream subscriber");
            }
        }

        self.accumulator
            .lock()
            .await
            .entry(sample.device_id.clone())
            .or_default()
            .push(sample);
    }

    /// Swap the accumulator for an empty map and deliver each device's slice
    /// to the matching batch subscribers. An empty accumulator is a no-op,
    /// not a skipped tick.
    pub async fn drain_batches(&self) {
        let drained = std::mem::take(&mut *self.accumulator.lock().await);
        if drained.is_empty() {
            return;
        }

        let timestamp = unix_nanos();
        let mut subs = self.batch_subs.lock().await;
        let mut closed = Vec::new();

        for (device_id, points) in &drained {
            for (id, sub) in subs.iter_mut() {
                if !sub.filter.admits_device(device_id) {
                    continue;
                }
                let batch = CtgBatchResponse {
                    data: points.clone(),
                    timestamp,
                    count: points.len() as i32,
                };
                match sub.tx.try_send(batch) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        if sub.dropped == 0 {
                            warn!(subscriber = *id, "batch subscriber channel full, dropping");
                        }
                        sub.dropped += 1;
                        self.counters.batch_drops.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        for id in closed {
            subs.remove(&id);
            debug!(subscriber = id, "pruned closed batch subscriber");
        }

        debug!(devices = drained.len(), "batch accumulator drained");
    }

    /// Drain the accumulator on every batch tick until cancelled, then
    /// deliver whatever accumulated since the last tick.
    pub async fn run_batch_ticker(self: Arc<Self>, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + BATCH_INTERVAL;
        let mut tick = tokio::time::interval_at(start, BATCH_INTERVAL);
        info!(interval_s = BATCH_INTERVAL.as_secs(), "batch ticker started");
        loop {
            tokio::select! {
                _ = tick.tick() => self.drain_batches().await,
                _ = cancel.cancelled() => {
                    // Last drain so shutdown never swallows a partial batch.
                    self.drain_batches().await;
                    info!("batch ticker stopped");
                    return;
                }
            }
        }
    }

    pub async fn stream_subscriber_count(&self) -> usize {
        self.stream_subs.lock().await.len()
    }

    pub async fn batch_subscriber_count(&self) -> usize {
        self.batch_subs.lock().await.len()
    }
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> FanoutHub {
        FanoutHub::new(Arc::new(PipelineCounters::default()))
    }

    fn sample(device_id: &str, data_type: &str, value: f64, time_sec: f64) -> CtgDataResponse {
        CtgDataResponse {
            device_id: device_id.to_string(),
            data_type: data_type.to_string(),
            value,
            time_sec,
        }
    }

    #[tokio::test]
    async fn test_broadcast_respects_filters() {
        let hub = hub();
        let (_, mut all) = hub.subscribe_stream(SubscriberFilter::default()).await;
        let (_, mut fhr_only) = hub
            .subscribe_stream(SubscriberFilter {
                device_ids: vec![],
                data_types: vec!["fetal_heart_rate".to_string()],
            })
            .await;
        let (_, mut other_device) = hub
            .subscribe_stream(SubscriberFilter {
                device_ids: vec!["CTG-B".to_string()],
                data_types: vec![],
            })
            .await;

        hub.broadcast(sample("CTG-A", "uterine_contractions", 25.0, 1.0))
            .await;

        assert_eq!(all.try_recv().unwrap().data_type, "uterine_contractions");
        assert!(fhr_only.try_recv().is_err());
        assert!(other_device.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_signal_loss_suppressed_on_stream_but_batched() {
        let hub = hub();
        let (_, mut rx) = hub.subscribe_stream(SubscriberFilter::default()).await;

        hub.broadcast(sample("CTG-A", "fetal_heart_rate", SIGNAL_LOSS, 1.0))
            .await;
        assert!(rx.try_recv().is_err());

        let acc = hub.accumulator.lock().await;
        assert_eq!(acc.get("CTG-A").map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_stream_delivery_preserves_order() {
        let hub = hub();
        let (_, mut rx) = hub.subscribe_stream(SubscriberFilter::default()).await;
        for i in 0..50 {
            hub.broadcast(sample("CTG-A", "fetal_heart_rate", 140.0, i as f64))
                .await;
        }
        for i in 0..50 {
            assert_eq!(rx.try_recv().unwrap().time_sec, i as f64);
        }
    }

    #[tokio::test]
    async fn test_closed_subscriber_pruned_on_broadcast() {
        let hub = hub();
        let (_, rx) = hub.subscribe_stream(SubscriberFilter::default()).await;
        drop(rx);
        assert_eq!(hub.stream_subscriber_count().await, 1);
        hub.broadcast(sample("CTG-A", "fetal_heart_rate", 140.0, 0.0))
            .await;
        assert_eq!(hub.stream_subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_drain_delivers_per_device_batches() {
        let hub = hub();
        let (_, mut rx) = hub
            .subscribe_batch(SubscriberFilter {
                device_ids: vec!["CTG-A".to_string()],
                data_types: vec![],
            })
            .await;

        for i in 0..3 {
            hub.broadcast(sample("CTG-A", "fetal_heart_rate", 140.0, i as f64))
                .await;
        }
        hub.broadcast(sample("CTG-B", "fetal_heart_rate", 150.0, 0.0))
            .await;
        hub.drain_batches().await;

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.count, 3);
        assert_eq!(batch.data.len(), 3);
        assert!(batch.data.iter().all(|s| s.device_id == "CTG-A"));
        assert!(batch.timestamp > 0);
        // Only the matching device's batch arrives.
        assert!(rx.try_recv().is_err());

        // Accumulator was swapped out; a second drain delivers nothing.
        hub.drain_batches().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channel_once() {
        let hub = hub();
        let (id, mut rx) = hub.subscribe_stream(SubscriberFilter::default()).await;
        hub.unsubscribe(SubscriberKind::Stream, id).await;
        assert_eq!(hub.stream_subscriber_count().await, 0);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        // Second deregistration is a no-op.
        hub.unsubscribe(SubscriberKind::Stream, id).await;
    }
}
