//! The two ends of a link, wiring configuration, connectivity monitoring, batching, the codec
//!  pipeline and the transport together.
//!
//! Both ends run as a set of tokio tasks that share a cancellation signal. Stopping a link
//!  cancels all of its timers and loops; it is safe to stop a link more than once.

pub mod receiver;
pub mod sender;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::TelemetryBus;
use crate::config::LinkConfig;
use crate::connectivity::driver::run_connectivity_monitor;
use crate::connectivity::probe::ReachabilityProbe;
use crate::connectivity::ConnectivitySnapshot;
use crate::link::receiver::DeltaReceiver;
use crate::link::sender::run_sender;
use crate::metrics::MetricsCollector;
use crate::model::Delta;
use crate::transport::{recv_loop, PacketTransport};

const INBOUND_QUEUE_LEN: usize = 4096;

/// Controls the tasks of a running link
pub struct LinkHandle {
    cancel_sender: broadcast::Sender<()>,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LinkHandle {
    fn new(cancel_sender: broadcast::Sender<()>, tasks: Vec<JoinHandle<()>>) -> LinkHandle {
        LinkHandle {
            cancel_sender,
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(tasks),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Signals all tasks to stop, without waiting for them. Calling this repeatedly is harmless.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            debug!("link already stopped");
            return;
        }
        info!("stopping link");
        // there are no receivers left if all tasks terminated on their own
        let _ = self.cancel_sender.send(());
    }

    /// Stops the link and waits for all of its tasks to terminate
    pub async fn shutdown(&self) {
        self.stop();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("link task failed: {}", e);
                }
            }
        }
    }
}


/// The sending end: deltas handed to it are batched, encoded and sent to the configured
///  destination while the connectivity monitor considers the link ready.
pub struct SenderLink {
    handle: LinkHandle,
    deltas: mpsc::Sender<Delta>,
    connectivity: watch::Receiver<ConnectivitySnapshot>,
    metrics: Arc<MetricsCollector>,
    local_addr: SocketAddr,
}

impl SenderLink {
    pub async fn start(
        config: watch::Receiver<Arc<LinkConfig>>,
        bus: Arc<dyn TelemetryBus>,
        probe: Arc<dyn ReachabilityProbe>,
        metrics: Arc<MetricsCollector>,
    ) -> anyhow::Result<SenderLink> {
        let initial_config = config.borrow().clone();
        initial_config.validate()?;

        let socket = UdpSocket::bind(initial_config.bind_addr).await
            .with_context(|| format!("binding sender socket to {:?}", initial_config.bind_addr))?;
        let local_addr = socket.local_addr()?;
        let transport = PacketTransport::new(Arc::new(socket), initial_config.safe_mtu, initial_config.retry.clone(), metrics.clone());

        let (delta_sender, inbound) = mpsc::channel(INBOUND_QUEUE_LEN);
        let (state_sender, connectivity) = watch::channel(ConnectivitySnapshot::default());
        let (cancel_sender, _) = broadcast::channel(1);

        let sender_loop = run_sender(inbound, transport, connectivity.clone(), config.clone(), metrics.clone(), cancel_sender.subscribe());
        let tasks = vec![
            tokio::spawn(run_connectivity_monitor(probe, bus, config, state_sender, cancel_sender.subscribe())),
            tokio::spawn(async move {
                if let Err(e) = sender_loop.await {
                    error!("sender terminated: {}", e);
                }
            }),
        ];
        let handle = LinkHandle::new(cancel_sender, tasks);

        info!("started sender link on {:?}", local_addr);
        Ok(SenderLink {
            handle,
            deltas: delta_sender,
            connectivity,
            metrics,
            local_addr,
        })
    }

    /// Entry point for deltas from the telemetry bus. Deltas are dropped if the inbound queue is
    ///  full or the link is stopped.
    pub fn on_delta(&self, delta: Delta) {
        if let Err(e) = self.deltas.try_send(delta) {
            warn!("dropping delta: {}", e);
        }
    }

    pub fn delta_sender(&self) -> mpsc::Sender<Delta> {
        self.deltas.clone()
    }

    pub fn connectivity(&self) -> watch::Receiver<ConnectivitySnapshot> {
        self.connectivity.clone()
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    pub async fn shutdown(&self) {
        self.handle.shutdown().await;
    }
}


/// The receiving end: listens on the configured address and publishes every delta it decodes
///  to the telemetry bus.
pub struct ReceiverLink {
    handle: LinkHandle,
    metrics: Arc<MetricsCollector>,
    local_addr: SocketAddr,
}

impl ReceiverLink {
    pub async fn start(
        mut config: watch::Receiver<Arc<LinkConfig>>,
        bus: Arc<dyn TelemetryBus>,
        metrics: Arc<MetricsCollector>,
    ) -> anyhow::Result<ReceiverLink> {
        let initial_config = config.borrow_and_update().clone();
        initial_config.validate()?;

        let receiver = Arc::new(DeltaReceiver::new(&initial_config, bus, metrics.clone())?);
        let socket = UdpSocket::bind(initial_config.bind_addr).await
            .with_context(|| format!("binding receiver socket to {:?}", initial_config.bind_addr))?;
        let local_addr = socket.local_addr()?;

        let (cancel_sender, _) = broadcast::channel(1);

        let handler = receiver.clone();
        let recv_cancel = cancel_sender.subscribe();
        let mut cancel = cancel_sender.subscribe();
        let bind_addr = initial_config.bind_addr;
        let tasks = vec![
            tokio::spawn(async move {
                recv_loop(&socket, handler, recv_cancel).await;
            }),
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.recv() => break,
                        changed = config.changed() => {
                            if changed.is_err() {
                                debug!("configuration channel closed - keeping the current configuration");
                                break;
                            }
                            let new_config = config.borrow_and_update().clone();
                            if new_config.bind_addr != bind_addr {
                                warn!("changing the receiver's bind address requires a restart - still listening on {:?}", bind_addr);
                            }
                            if let Err(e) = receiver.reconfigure(&new_config).await {
                                error!("rejected configuration update, keeping the previous configuration: {}", e);
                            }
                        }
                    }
                }
            }),
        ];
        let handle = LinkHandle::new(cancel_sender, tasks);

        info!("started receiver link on {:?}", local_addr);
        Ok(ReceiverLink {
            handle,
            metrics,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    pub async fn shutdown(&self) {
        self.handle.shutdown().await;
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::time::timeout;
    use super::*;
    use crate::config::config_channel;
    use crate::connectivity::probe::MockReachabilityProbe;
    use crate::connectivity::ConnectivityState;
    use crate::test_util::bus::RecordingBus;
    use crate::test_util::config::test_config;
    use crate::test_util::delta::{gsv_delta, sample_delta};

    const TIMEOUT: Duration = Duration::from_secs(10);

    async fn start_receiver(bus: Arc<RecordingBus>) -> ReceiverLink {
        let (_publisher, config) = config_channel(test_config()).unwrap();
        ReceiverLink::start(config, bus, Arc::new(MetricsCollector::default())).await.unwrap()
    }

    fn sender_config(receiver: &ReceiverLink) -> LinkConfig {
        let mut config = test_config();
        config.destination = receiver.local_addr();
        config
    }

    fn sorted_json(deltas: impl Iterator<Item = Delta>) -> Vec<String> {
        let mut result = deltas
            .map(|d| serde_json::to_string(&d).unwrap())
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let receiving_bus = Arc::new(RecordingBus::new());
        let receiver = start_receiver(receiving_bus.clone()).await;

        let (_publisher, config) = config_channel(sender_config(&receiver)).unwrap();
        let sender = SenderLink::start(config, Arc::new(RecordingBus::new()), Arc::new(MockReachabilityProbe::new()), Arc::new(MetricsCollector::default())).await.unwrap();

        let mut connectivity = sender.connectivity();
        connectivity.wait_for(|s| s.ready_to_send).await.unwrap();

        let deltas: Vec<Delta> = (0..12).map(sample_delta).chain([gsv_delta()]).collect();
        for delta in &deltas {
            sender.on_delta(delta.clone());
        }

        // concurrent batches may arrive in any order
        let received = timeout(TIMEOUT, receiving_bus.wait_for(deltas.len())).await.unwrap();
        assert_eq!(sorted_json(received.into_iter().map(|(_, d)| d)), sorted_json(deltas.iter().cloned()));

        sender.shutdown().await;
        receiver.shutdown().await;

        assert_eq!(sender.metrics().snapshot(0).deltas_out, deltas.len() as u64);
        assert_eq!(receiver.metrics().snapshot(0).deltas_in, deltas.len() as u64);
        assert_eq!(connectivity.borrow().state, ConnectivityState::Stopped);
    }

    #[tokio::test]
    async fn test_garbage_does_not_stop_the_receiver() {
        let bus = Arc::new(RecordingBus::new());
        let receiver = start_receiver(bus.clone()).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&[0u8; 100], receiver.local_addr()).await.unwrap();
        client.send_to(b"", receiver.local_addr()).await.unwrap();

        let packet = crate::codec::pipeline::CodecPipeline::new(&test_config()).unwrap()
            .encode_batch(&[sample_delta(0)]).unwrap()
            .packet;
        client.send_to(&packet, receiver.local_addr()).await.unwrap();

        let received = timeout(TIMEOUT, bus.wait_for(1)).await.unwrap();
        assert_eq!(received[0].1, sample_delta(0));
        assert_eq!(receiver.metrics().snapshot(0).authentication_failures, 2);

        receiver.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let receiver = start_receiver(Arc::new(RecordingBus::new())).await;

        receiver.stop();
        receiver.stop();
        receiver.shutdown().await;
        receiver.shutdown().await;
        assert!(receiver.handle.is_stopped());
    }

    #[tokio::test]
    async fn test_invalid_config_refuses_to_start() {
        let mut config = test_config();
        config.encryption_key = vec![b'x'; 32];
        let (_, receiver) = watch::channel(Arc::new(config));

        assert!(ReceiverLink::start(receiver.clone(), Arc::new(RecordingBus::new()), Arc::new(MetricsCollector::default())).await.is_err());
        assert!(SenderLink::start(receiver, Arc::new(RecordingBus::new()), Arc::new(MockReachabilityProbe::new()), Arc::new(MetricsCollector::default())).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let blocker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut config = test_config();
        config.bind_addr = blocker.local_addr().unwrap();
        let (_, receiver) = watch::channel(Arc::new(config));

        assert!(ReceiverLink::start(receiver, Arc::new(RecordingBus::new()), Arc::new(MetricsCollector::default())).await.is_err());
    }
}
