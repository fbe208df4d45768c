use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};

use crate::bus::TelemetryBus;
use crate::model::Delta;

/// A telemetry bus that keeps everything published to it
#[derive(Debug, Default)]
pub struct RecordingBus {
    published: RwLock<Vec<(String, Delta)>>,
    notify: Notify,
}
impl RecordingBus {
    pub fn new() -> Self {
        Default::default()
    }

    pub async fn published(&self) -> Vec<(String, Delta)> {
        self.published.read().await.clone()
    }

    pub async fn published_deltas(&self) -> Vec<Delta> {
        self.published.read().await
            .iter()
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// waits until at least `n` deltas were published, returning all of them
    pub async fn wait_for(&self, n: usize) -> Vec<(String, Delta)> {
        loop {
            {
                let published = self.published.read().await;
                if published.len() >= n {
                    return published.clone();
                }
            }
            self.notify.notified().await;
        }
    }
}

#[async_trait]
impl TelemetryBus for RecordingBus {
    async fn publish(&self, source_id: &str, delta: Delta) -> anyhow::Result<()> {
        self.published.write().await.push((source_id.to_string(), delta));
        self.notify.notify_one();
        Ok(())
    }
}
