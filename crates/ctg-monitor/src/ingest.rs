//! MQTT ingest: decode incoming telemetry, run it through the per-device
//! signal pipelines, auto-open sessions, and route the released samples into
//! the fan-out hub and the write-behind buffer.
//!
//! Two tasks: the broker reader feeds a bounded queue with non-blocking
//! sends (a full queue drops the message), and a single worker consumes the
//! queue so per-device processing stays in arrival order.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ctg_grpc::ctg::CtgDataResponse;
use ctg_protocol::filter::{Emitted, SignalPipeline};
use ctg_protocol::sample::{decode_message, Sample, SignalKind};
use ctg_protocol::MQTT_TOPIC_FILTER;

use crate::buffer::WriteBuffer;
use crate::config::MqttSection;
use crate::hub::FanoutHub;
use crate::metrics::PipelineCounters;
use crate::sessions::{CloseNotice, SessionError, SessionManager};

/// Queue between the broker reader and the ingest worker.
pub const INGEST_QUEUE_CAPACITY: usize = 1000;
/// Backoff after an MQTT event-loop error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Broker reader: polls the event loop, decodes publishes, and hands
/// samples to the worker queue without ever blocking the broker path.
pub async fn run_mqtt(
    config: MqttSection,
    tx: mpsc::Sender<Sample>,
    counters: Arc<PipelineCounters>,
    cancel: CancellationToken,
) {
    let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    options.set_keep_alive(MQTT_KEEP_ALIVE);
    if !config.username.is_empty() {
        options.set_credentials(config.username.clone(), config.password.clone());
    }

    let (client, mut eventloop) = AsyncClient::new(options, 64);
    info!(host = %config.host, port = config.port, "MQTT reader started");

    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(topic = MQTT_TOPIC_FILTER, "MQTT connected, subscribing");
                    if let Err(e) = client.subscribe(MQTT_TOPIC_FILTER, QoS::AtLeastOnce).await {
                        warn!(error = %e, "MQTT subscribe failed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match decode_message(&publish.topic, &publish.payload) {
                        Ok(sample) => {
                            if tx.try_send(sample).is_err() {
                                counters.queue_drops.fetch_add(1, Ordering::Relaxed);
                                warn!("ingest queue full, dropping sample");
                            }
                        }
                        Err(e) => {
                            counters.parse_failures.fetch_add(1, Ordering::Relaxed);
                            warn!(topic = %publish.topic, error = %e, "dropping unparseable message");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "MQTT event loop error, reconnecting");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            },
            _ = cancel.cancelled() => {
                info!("MQTT reader stopping");
                return;
            }
        }
    }
}

pub struct IngestWorker {
    sessions: Arc<SessionManager>,
    buffer: WriteBuffer,
    hub: Arc<FanoutHub>,
    counters: Arc<PipelineCounters>,
    pipelines: HashMap<(String, SignalKind), SignalPipeline>,
}

impl IngestWorker {
    pub fn new(
        sessions: Arc<SessionManager>,
        buffer: WriteBuffer,
        hub: Arc<FanoutHub>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            sessions,
            buffer,
            hub,
            counters,
            pipelines: HashMap::new(),
        }
    }

    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<Sample>,
        mut close_rx: mpsc::Receiver<CloseNotice>,
        cancel: CancellationToken,
    ) {
        info!("ingest worker started");
        let mut closes_open = true;
        loop {
            tokio::select! {
                sample = rx.recv() => match sample {
                    Some(sample) => self.process(sample).await,
                    None => {
                        self.flush_all_pending().await;
                        info!("ingest queue closed, worker exiting");
                        return;
                    }
                },
                notice = close_rx.recv(), if closes_open => match notice {
                    Some(notice) => self.handle_close(notice).await,
                    None => closes_open = false,
                },
                _ = cancel.cancelled() => {
                    // Drain whatever made it into the queue before the
                    // broker reader stopped, then release parked samples.
                    let mut drained = 0usize;
                    while let Ok(sample) = rx.try_recv() {
                        self.process(sample).await;
                        drained += 1;
                    }
                    self.flush_all_pending().await;
                    info!(drained, "ingest worker stopped");
                    return;
                }
            }
        }
    }

    async fn process(&mut self, sample: Sample) {
        self.counters.samples_ingested.fetch_add(1, Ordering::Relaxed);

        // Look up or auto-open the session. Auto-open synthesises a card id;
        // operators re-associate it through the admin surface later.
        let session = match self.sessions.get_active(&sample.device_id).await {
            Some(session) => session,
            None => {
                let card_id = Uuid::new_v4();
                match self.sessions.start_session(card_id, &sample.device_id).await {
                    Ok(session) => {
                        info!(
                            device_id = %sample.device_id,
                            session_id = %session.id,
                            "auto-opened session"
                        );
                        session
                    }
                    Err(SessionError::AlreadyActive(_)) => {
                        // Raced an operator start; retry the lookup.
                        match self.sessions.get_active(&sample.device_id).await {
                            Some(session) => session,
                            None => return,
                        }
                    }
                    Err(e) => {
                        warn!(device_id = %sample.device_id, error = %e, "auto-open failed");
                        return;
                    }
                }
            }
        };

        let key = (sample.device_id.clone(), sample.kind);
        let pipeline = self
            .pipelines
            .entry(key)
            .or_insert_with(|| SignalPipeline::new(sample.kind));

        for (time_sec, value, disposition) in pipeline.push(sample.time_sec, sample.value) {
            match disposition {
                Emitted::Interpolated => {
                    self.counters.spikes_replaced.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        device_id = %sample.device_id,
                        kind = %sample.kind,
                        time_sec,
                        value,
                        "spike replaced with interpolated value"
                    );
                }
                Emitted::SignalLoss => {
                    self.counters.signal_losses.fetch_add(1, Ordering::Relaxed);
                }
                Emitted::Passed => {}
            }
            self.emit(session.id, &sample.device_id, sample.kind, time_sec, value)
                .await;
        }
    }

    async fn emit(
        &self,
        session_id: Uuid,
        device_id: &str,
        kind: SignalKind,
        time_sec: f64,
        value: f64,
    ) {
        self.hub
            .broadcast(CtgDataResponse {
                device_id: device_id.to_string(),
                data_type: kind.as_str().to_string(),
                value,
                time_sec,
            })
            .await;
        self.buffer
            .add_point(session_id, kind, value, time_sec)
            .await;
    }

    /// A session closed: push the device's parked samples into the buffer
    /// (and hub) before the caller runs the final flush, then ack.
    async fn handle_close(&mut self, notice: CloseNotice) {
        for kind in [SignalKind::FetalHeartRate, SignalKind::UterineContractions] {
            let key = (notice.device_id.clone(), kind);
            if let Some(pipeline) = self.pipelines.get_mut(&key) {
                if let Some((time_sec, value)) = pipeline.flush() {
                    self.emit(notice.session_id, &notice.device_id, kind, time_sec, value)
                        .await;
                }
            }
        }
        let _ = notice.ack.send(());
    }

    /// Shutdown path: release every parked sample whose device still has an
    /// open session.
    async fn flush_all_pending(&mut self) {
        let keys: Vec<(String, SignalKind)> = self.pipelines.keys().cloned().collect();
        for (device_id, kind) in keys {
            let released = self
                .pipelines
                .get_mut(&(device_id.clone(), kind))
                .and_then(|p| p.flush());
            if let Some((time_sec, value)) = released {
                match self.sessions.get_active(&device_id).await {
                    Some(session) => {
                        self.emit(session.id, &device_id, kind, time_sec, value).await;
                    }
                    None => debug!(%device_id, "dropping parked sample with no open session"),
                }
            }
        }
    }
}
