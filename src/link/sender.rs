use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::batching::batch_state::BatchTuning;
use crate::batching::smart_batcher::{Batch, FlushTrigger, SmartBatcher};
use crate::bus::SentenceFilter;
use crate::codec::pipeline::CodecPipeline;
use crate::config::LinkConfig;
use crate::connectivity::ConnectivitySnapshot;
use crate::error::{PipelineError, PipelineStage};
use crate::metrics::MetricsCollector;
use crate::model::Delta;
use crate::transport::PacketTransport;

/// What a completed flush reports back to the sender loop
struct FlushOutcome {
    packet_len: usize,
    delta_count: usize,
}

fn periodic(period: Duration) -> Interval {
    let mut result = interval_at(Instant::now() + period, period);
    result.set_missed_tick_behavior(MissedTickBehavior::Delay);
    result
}

/// The sender's state that is derived from configuration, and replaced when the configuration
///  changes
struct SenderSettings {
    pipeline: Arc<CodecPipeline>,
    transport: Arc<PacketTransport>,
    filter: SentenceFilter,
    destination: SocketAddr,
}
impl SenderSettings {
    fn new(config: &LinkConfig, transport: Arc<PacketTransport>) -> anyhow::Result<SenderSettings> {
        Ok(SenderSettings {
            pipeline: Arc::new(CodecPipeline::new(config)?),
            transport,
            filter: SentenceFilter::new(&config.excluded_sentences),
            destination: config.destination,
        })
    }
}

/// Runs the sending side of the link until a cancellation signal arrives or the inbound channel
///  is closed: deltas arriving from the telemetry bus are filtered, batched and flushed through
///  the codec pipeline to the transport.
///
/// While the link is not ready to send, deltas are dropped rather than buffered, and a timer
///  tick discards whatever was buffered before the link went down.
///
/// Each flush takes the batcher's buffer, so flushes running concurrently (e.g. an early send
///  followed by a timer send) always work on disjoint sets of deltas. Flush results are fed
///  back into the batcher as they complete, in whatever order that is.
pub async fn run_sender(
    mut inbound: mpsc::Receiver<Delta>,
    transport: PacketTransport,
    connectivity: watch::Receiver<ConnectivitySnapshot>,
    mut config: watch::Receiver<Arc<LinkConfig>>,
    metrics: Arc<MetricsCollector>,
    mut cancel: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let initial_config = config.borrow_and_update().clone();

    let mut settings = SenderSettings::new(&initial_config, Arc::new(transport))?;
    let mut batcher = SmartBatcher::new(BatchTuning::new(initial_config.safe_mtu));
    metrics.update_batch_state(batcher.state());

    let mut batch_interval = initial_config.batch_interval;
    let mut batch_timer = periodic(batch_interval);
    let mut metrics_interval = initial_config.metrics_interval;
    let mut metrics_timer = periodic(metrics_interval);

    let mut in_flight: JoinSet<Option<FlushOutcome>> = JoinSet::new();
    let mut config_open = true;

    info!("starting sender to {:?}", settings.destination);

    loop {
        select! {
            _ = cancel.recv() => break,
            delta = inbound.recv() => {
                let Some(delta) = delta else {
                    debug!("inbound delta channel closed");
                    break;
                };

                if !connectivity.borrow().ready_to_send {
                    trace!("link not ready - dropping delta for {}", delta.context);
                    metrics.record_dropped_not_ready(1);
                    continue;
                }

                let Some(delta) = settings.filter.apply(delta) else {
                    metrics.record_filtered();
                    continue;
                };

                if let Some(batch) = batcher.push(delta) {
                    spawn_flush(&mut in_flight, &settings, &metrics, batch);
                }
            }
            _ = batch_timer.tick() => {
                if !connectivity.borrow().ready_to_send {
                    let discarded = batcher.discard();
                    if discarded > 0 {
                        debug!("link not ready - discarding {} buffered deltas", discarded);
                        metrics.record_dropped_not_ready(discarded);
                    }
                    continue;
                }

                if let Some(batch) = batcher.on_timer() {
                    spawn_flush(&mut in_flight, &settings, &metrics, batch);
                }
            }
            Some(result) = in_flight.join_next() => {
                match result {
                    Ok(Some(outcome)) => {
                        batcher.on_batch_sent(outcome.packet_len, outcome.delta_count);
                        metrics.update_batch_state(batcher.state());
                    }
                    Ok(None) => {}
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => error!("flush task failed: {}", e),
                }
            }
            _ = metrics_timer.tick() => {
                metrics.sample_rates();
            }
            changed = config.changed(), if config_open => {
                if changed.is_err() {
                    debug!("configuration channel closed - keeping the current configuration");
                    config_open = false;
                    continue;
                }
                let new_config = config.borrow_and_update().clone();

                let transport = Arc::new(settings.transport.with_safe_mtu(new_config.safe_mtu, new_config.retry.clone()));
                match SenderSettings::new(&new_config, transport) {
                    Ok(new_settings) => {
                        info!("applying updated configuration to sender");
                        settings = new_settings;
                    }
                    Err(e) => {
                        error!("rejected configuration update, keeping the previous configuration: {}", e);
                        continue;
                    }
                }

                batcher.set_safe_mtu(new_config.safe_mtu);
                metrics.update_batch_state(batcher.state());

                if new_config.batch_interval != batch_interval {
                    batch_interval = new_config.batch_interval;
                    batch_timer = periodic(batch_interval);
                }
                if new_config.metrics_interval != metrics_interval {
                    metrics_interval = new_config.metrics_interval;
                    metrics_timer = periodic(metrics_interval);
                }
            }
        }
    }

    if batcher.buffered() > 0 {
        debug!("discarding {} buffered deltas on shutdown", batcher.discard());
    }
    in_flight.abort_all();
    info!("sender stopped");
    Ok(())
}

fn spawn_flush(in_flight: &mut JoinSet<Option<FlushOutcome>>, settings: &SenderSettings, metrics: &Arc<MetricsCollector>, batch: Batch) {
    match batch.trigger {
        FlushTrigger::BatchFull => metrics.record_early_send(),
        FlushTrigger::Timer => metrics.record_timer_send(),
    }

    let pipeline = settings.pipeline.clone();
    let transport = settings.transport.clone();
    let destination = settings.destination;
    let metrics = metrics.clone();

    in_flight.spawn(async move {
        let delta_count = batch.deltas.len();
        match flush(pipeline, &transport, destination, &metrics, batch.deltas).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                if e.stage() != PipelineStage::Send {
                    metrics.record_encode_error();
                }
                warn!(stage = ?e.stage(), "dropping batch of {} deltas: {}", delta_count, e);
                None
            }
        }
    });
}

/// encode -> send. Encoding is CPU bound, so it does not run on the async worker threads.
async fn flush(pipeline: Arc<CodecPipeline>, transport: &PacketTransport, destination: SocketAddr, metrics: &Arc<MetricsCollector>, deltas: Vec<Delta>) -> Result<FlushOutcome, PipelineError> {
    let metrics_for_encoding = metrics.clone();
    let encoded = tokio::task::spawn_blocking(move || {
        let encoded = pipeline.encode_batch(&deltas)?;
        for (delta, &len) in deltas.iter().zip(&encoded.delta_lens) {
            metrics_for_encoding.record_path_usage(delta, len);
        }
        Ok::<_, PipelineError>(encoded)
    })
        .await
        .map_err(|e| PipelineError::Serialization(e.into()))??;

    transport.send(&encoded.packet, destination).await?;
    metrics.record_packet_sent(encoded.packet.len(), encoded.raw_len, encoded.delta_count);
    trace!("sent {} deltas in a packet of {} bytes", encoded.delta_count, encoded.packet.len());

    Ok(FlushOutcome {
        packet_len: encoded.packet.len(),
        delta_count: encoded.delta_count,
    })
}


#[cfg(test)]
mod tests {
    use std::io;
    use async_trait::async_trait;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
    use super::*;
    use crate::codec::path_dictionary::PathDictionary;
    use crate::codec::serializer::SerializationFormat;
    use crate::connectivity::ConnectivityState;
    use crate::test_util::config::test_config;
    use crate::test_util::delta::{gsv_delta, sample_delta};
    use crate::transport::retry::RetryConfig;
    use crate::transport::SendSocket;

    /// hands every sent packet to the test
    struct CapturingSocket(UnboundedSender<Vec<u8>>);
    #[async_trait]
    impl SendSocket for CapturingSocket {
        async fn send_to(&self, packet: &[u8], _to: SocketAddr) -> io::Result<usize> {
            let _ = self.0.send(packet.to_vec());
            Ok(packet.len())
        }
    }

    fn ready(ready_to_send: bool) -> ConnectivitySnapshot {
        ConnectivitySnapshot {
            state: if ready_to_send { ConnectivityState::Up } else { ConnectivityState::Down },
            ready_to_send,
            last_rtt_millis: None,
        }
    }

    struct Harness {
        deltas: mpsc::Sender<Delta>,
        packets: UnboundedReceiver<Vec<u8>>,
        connectivity: watch::Sender<ConnectivitySnapshot>,
        config: watch::Sender<Arc<LinkConfig>>,
        metrics: Arc<MetricsCollector>,
        cancel: broadcast::Sender<()>,
        task: tokio::task::JoinHandle<anyhow::Result<()>>,
    }
    impl Harness {
        fn start(config: LinkConfig, ready_to_send: bool) -> Harness {
            let (deltas, inbound) = mpsc::channel(1024);
            let (packet_sender, packets) = mpsc::unbounded_channel();
            let (connectivity, connectivity_receiver) = watch::channel(ready(ready_to_send));
            let (config, config_receiver) = watch::channel(Arc::new(config));
            let (cancel, cancel_receiver) = broadcast::channel(1);
            let metrics = Arc::new(MetricsCollector::default());

            let transport = PacketTransport::new(Arc::new(CapturingSocket(packet_sender)), 1400, RetryConfig::default(), metrics.clone());
            let task = tokio::spawn(run_sender(inbound, transport, connectivity_receiver, config_receiver, metrics.clone(), cancel_receiver));

            Harness { deltas, packets, connectivity, config, metrics, cancel, task }
        }

        async fn send_deltas(&self, deltas: impl IntoIterator<Item = Delta>) {
            for delta in deltas {
                self.deltas.send(delta).await.unwrap();
            }
        }

        async fn next_batch(&mut self, format: SerializationFormat) -> Vec<Delta> {
            let packet = self.packets.recv().await.unwrap();
            let mut config = test_config();
            config.serialization = format;
            CodecPipeline::new(&config).unwrap()
                .decode_packet(&packet).unwrap()
        }

        async fn stop(self) -> Arc<MetricsCollector> {
            self.cancel.send(()).unwrap();
            self.task.await.unwrap().unwrap();
            self.metrics
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_send() {
        let mut harness = Harness::start(test_config(), true);

        harness.send_deltas((0..5).map(sample_delta)).await;
        let batch = harness.next_batch(SerializationFormat::Json).await;
        assert_eq!(batch, (0..5).map(sample_delta).collect::<Vec<_>>());

        let snapshot = harness.stop().await.snapshot(10);
        assert_eq!(snapshot.batching.early_sends, 1);
        assert_eq!(snapshot.packets_out, 1);
        assert_eq!(snapshot.deltas_out, 5);
        assert!(snapshot.compression_ratio > 0.0);
        assert_eq!(snapshot.top_paths.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_send() {
        let mut harness = Harness::start(test_config(), true);
        let started = Instant::now();

        harness.send_deltas((0..2).map(sample_delta)).await;
        let batch = harness.next_batch(SerializationFormat::Json).await;
        assert_eq!(batch.len(), 2);
        assert!(started.elapsed() >= test_config().batch_interval);

        let snapshot = harness.stop().await.snapshot(0);
        assert_eq!(snapshot.batching.timer_sends, 1);
        assert_eq!(snapshot.batching.early_sends, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feedback_updates_batch_state() {
        let mut harness = Harness::start(test_config(), true);

        harness.send_deltas((0..5).map(sample_delta)).await;
        harness.next_batch(SerializationFormat::Json).await;

        let metrics = harness.stop().await;
        let batching = metrics.snapshot(0).batching;
        assert!(batching.avg_bytes_per_delta.unwrap() < 200.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_while_not_ready() {
        let mut harness = Harness::start(test_config(), false);

        harness.send_deltas((0..20).map(sample_delta)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(harness.packets.try_recv().is_err());
        assert_eq!(harness.metrics.snapshot(0).dropped_not_ready, 20);

        harness.connectivity.send_replace(ready(true));
        harness.send_deltas((20..22).map(sample_delta)).await;
        let batch = harness.next_batch(SerializationFormat::Json).await;
        assert_eq!(batch, (20..22).map(sample_delta).collect::<Vec<_>>());

        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_is_discarded_when_link_goes_down() {
        let mut harness = Harness::start(test_config(), true);

        harness.send_deltas((0..3).map(sample_delta)).await;
        tokio::task::yield_now().await;
        harness.connectivity.send_replace(ready(false));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(harness.packets.try_recv().is_err());

        let snapshot = harness.stop().await.snapshot(0);
        assert_eq!(snapshot.dropped_not_ready, 3);
        assert_eq!(snapshot.packets_out, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_excluded_sentences_are_filtered() {
        let mut config = test_config();
        config.excluded_sentences.insert("GSV".to_string());
        let mut harness = Harness::start(config, true);

        harness.send_deltas([gsv_delta(), sample_delta(0)]).await;
        let batch = harness.next_batch(SerializationFormat::Json).await;
        assert_eq!(batch, vec![sample_delta(0)]);

        assert_eq!(harness.stop().await.snapshot(0).filtered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_path_usage_uses_each_deltas_own_size() {
        let mut harness = Harness::start(test_config(), true);

        harness.send_deltas([gsv_delta(), sample_delta(0)]).await;
        harness.next_batch(SerializationFormat::Json).await;

        let encoded_len = |delta: &Delta| serde_json::to_vec(&PathDictionary::standard().encode(delta)).unwrap().len() as f64;
        let top_paths = harness.stop().await.snapshot(10).top_paths;
        let bytes_for = |path: &str| top_paths.iter()
            .find(|usage| usage.path == path)
            .unwrap()
            .bytes;

        assert_eq!(bytes_for("navigation.gnss.satellitesInView"), encoded_len(&gsv_delta()));
        assert_eq!(bytes_for("navigation.speedOverGround"), encoded_len(&sample_delta(0)) / 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfiguration() {
        let mut harness = Harness::start(test_config(), true);

        harness.send_deltas([sample_delta(0)]).await;
        assert_eq!(harness.next_batch(SerializationFormat::Json).await, vec![sample_delta(0)]);

        let mut config = test_config();
        config.serialization = SerializationFormat::Msgpack;
        config.excluded_sentences.insert("GSV".to_string());
        config.batch_interval = Duration::from_secs(5);
        harness.config.send_replace(Arc::new(config));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let before = Instant::now();
        harness.send_deltas([gsv_delta(), sample_delta(1)]).await;
        assert_eq!(harness.next_batch(SerializationFormat::Msgpack).await, vec![sample_delta(1)]);
        assert!(before.elapsed() >= Duration::from_secs(4));

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_stops_when_inbound_channel_closes() {
        let harness = Harness::start(test_config(), true);
        drop(harness.deltas);
        harness.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_initial_config() {
        let mut config = test_config();
        config.encryption_key = b"too short".to_vec();
        let harness = Harness::start(config, true);
        assert!(harness.task.await.unwrap().is_err());
    }
}
