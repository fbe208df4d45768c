use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::bus::TelemetryBus;
use crate::codec::pipeline::CodecPipeline;
use crate::config::LinkConfig;
use crate::error::PipelineError;
use crate::metrics::MetricsCollector;
use crate::transport::PacketHandler;

struct ReceiverSettings {
    pipeline: Arc<CodecPipeline>,
    source_id: String,
}

/// Decodes received packets and re-injects their deltas into the telemetry bus. Decoding is
///  CPU bound and runs on the blocking thread pool, like encoding on the sending side.
///
/// A packet that fails to decode is dropped as a whole and counted; it never affects other
///  packets. Authentication failures are logged separately since they point to a key mismatch
///  or to someone tampering with the link.
pub struct DeltaReceiver {
    settings: RwLock<Arc<ReceiverSettings>>,
    bus: Arc<dyn TelemetryBus>,
    metrics: Arc<MetricsCollector>,
}

impl DeltaReceiver {
    pub fn new(config: &LinkConfig, bus: Arc<dyn TelemetryBus>, metrics: Arc<MetricsCollector>) -> anyhow::Result<DeltaReceiver> {
        Ok(DeltaReceiver {
            settings: RwLock::new(Arc::new(Self::settings(config)?)),
            bus,
            metrics,
        })
    }

    fn settings(config: &LinkConfig) -> anyhow::Result<ReceiverSettings> {
        Ok(ReceiverSettings {
            pipeline: Arc::new(CodecPipeline::new(config)?),
            source_id: config.source_id.clone(),
        })
    }

    /// Swaps in a pipeline for the new configuration. Packets that are being decoded right now
    ///  finish with the previous one.
    pub async fn reconfigure(&self, config: &LinkConfig) -> anyhow::Result<()> {
        let settings = Self::settings(config)?;
        *self.settings.write().await = Arc::new(settings);
        info!("applied updated configuration to receiver");
        Ok(())
    }
}

#[async_trait]
impl PacketHandler for DeltaReceiver {
    async fn on_packet(&self, packet: &[u8], from: SocketAddr) {
        let settings = self.settings.read().await.clone();

        let pipeline = settings.pipeline.clone();
        let buf = packet.to_vec();
        let decoded = tokio::task::spawn_blocking(move || pipeline.decode_packet(&buf))
            .await
            .map_err(|e| PipelineError::Deserialization(e.into()))
            .and_then(|r| r);

        let deltas = match decoded {
            Ok(deltas) => deltas,
            Err(e) => {
                self.metrics.record_receive_error(&e);
                if e.is_authentication_failure() {
                    warn!("dropping packet from {:?} that failed authentication - wrong key or tampering?", from);
                }
                else {
                    warn!(stage = ?e.stage(), "dropping packet of {} bytes from {:?}: {}", packet.len(), from, e);
                }
                return;
            }
        };

        trace!("received {} deltas in {} bytes from {:?}", deltas.len(), packet.len(), from);
        self.metrics.record_packet_received(packet.len(), deltas.len());

        for delta in deltas {
            if let Err(e) = self.bus.publish(&settings.source_id, delta).await {
                debug!("publishing received delta failed: {}", e);
            }
        }
    }
}
