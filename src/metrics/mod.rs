//! Counters and samples describing what the link is doing, for the host's metrics surface.
//!
//! The collector is shared between the sender, the transport and the receiver. Each of them
//!  records its own events through the `record_*` methods; everybody else only ever sees
//!  immutable [MetricsSnapshot]s.

pub mod ring_buffer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::trace;

use crate::batching::batch_state::BatchState;
use crate::error::PipelineError;
use crate::metrics::ring_buffer::RingBuffer;
use crate::model::Delta;

pub const DEFAULT_HISTORY_CAPACITY: usize = 60;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSample {
    pub timestamp: DateTime<Utc>,
    /// bytes per second sent since the previous sample
    pub rate_out: f64,
    /// bytes per second received since the previous sample
    pub rate_in: f64,
    /// percent saved on the wire compared to the serialized size, over the link's lifetime
    pub compression_ratio: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathUsage {
    pub path: String,
    pub count: u64,
    pub bytes: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchingSnapshot {
    pub early_sends: u64,
    pub timer_sends: u64,
    pub oversized_packets: u64,
    pub avg_bytes_per_delta: Option<f64>,
    pub max_deltas_per_batch: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub uptime_seconds: f64,
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub packets_out: u64,
    pub packets_in: u64,
    pub deltas_out: u64,
    pub deltas_in: u64,
    pub compression_ratio: f64,
    pub encode_errors: u64,
    pub send_errors: u64,
    pub authentication_failures: u64,
    pub decompression_failures: u64,
    pub decode_failures: u64,
    pub dropped_not_ready: u64,
    pub filtered: u64,
    pub batching: BatchingSnapshot,
    pub history: Vec<MetricsSample>,
    pub top_paths: Vec<PathUsage>,
}

pub struct MetricsCollector {
    started: Instant,

    bytes_out: AtomicU64,
    raw_bytes_out: AtomicU64,
    bytes_in: AtomicU64,
    packets_out: AtomicU64,
    packets_in: AtomicU64,
    deltas_out: AtomicU64,
    deltas_in: AtomicU64,

    encode_errors: AtomicU64,
    send_errors: AtomicU64,
    authentication_failures: AtomicU64,
    decompression_failures: AtomicU64,
    decode_failures: AtomicU64,
    dropped_not_ready: AtomicU64,
    filtered: AtomicU64,

    early_sends: AtomicU64,
    timer_sends: AtomicU64,
    oversized_packets: AtomicU64,

    inner: Mutex<Inner>,
}

struct Inner {
    history: RingBuffer<MetricsSample>,
    last_sample: RateBaseline,
    path_usage: FxHashMap<String, PathUsage>,
    batch_state: Option<BatchState>,
}

struct RateBaseline {
    at: Instant,
    bytes_out: u64,
    bytes_in: u64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        MetricsCollector::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl MetricsCollector {
    pub fn new(history_capacity: usize) -> MetricsCollector {
        let now = Instant::now();
        MetricsCollector {
            started: now,
            bytes_out: Default::default(),
            raw_bytes_out: Default::default(),
            bytes_in: Default::default(),
            packets_out: Default::default(),
            packets_in: Default::default(),
            deltas_out: Default::default(),
            deltas_in: Default::default(),
            encode_errors: Default::default(),
            send_errors: Default::default(),
            authentication_failures: Default::default(),
            decompression_failures: Default::default(),
            decode_failures: Default::default(),
            dropped_not_ready: Default::default(),
            filtered: Default::default(),
            early_sends: Default::default(),
            timer_sends: Default::default(),
            oversized_packets: Default::default(),
            inner: Mutex::new(Inner {
                history: RingBuffer::new(history_capacity),
                last_sample: RateBaseline { at: now, bytes_out: 0, bytes_in: 0 },
                path_usage: Default::default(),
                batch_state: None,
            }),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_packet_sent(&self, wire_len: usize, raw_len: usize, delta_count: usize) {
        self.bytes_out.fetch_add(wire_len as u64, Ordering::Relaxed);
        self.raw_bytes_out.fetch_add(raw_len as u64, Ordering::Relaxed);
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        self.deltas_out.fetch_add(delta_count as u64, Ordering::Relaxed);
    }

    pub fn record_oversized_packet(&self) {
        self.oversized_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// a batch that could not be serialized, compressed or encrypted
    pub fn record_encode_error(&self) {
        self.encode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_packet_received(&self, wire_len: usize, delta_count: usize) {
        self.bytes_in.fetch_add(wire_len as u64, Ordering::Relaxed);
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.deltas_in.fetch_add(delta_count as u64, Ordering::Relaxed);
    }

    /// Counts a packet that was received but could not be decoded, by failure category
    pub fn record_receive_error(&self, error: &PipelineError) {
        let counter = match error {
            PipelineError::Authentication | PipelineError::PacketTooShort { .. } => &self.authentication_failures,
            PipelineError::Decompression(_) => &self.decompression_failures,
            _ => &self.decode_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_early_send(&self) {
        self.early_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timer_send(&self) {
        self.timer_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_not_ready(&self, num_deltas: usize) {
        self.dropped_not_ready.fetch_add(num_deltas as u64, Ordering::Relaxed);
    }

    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    /// Attributes a delta's serialized size to its paths. The size is split evenly between all
    ///  values in the delta, which is an approximation rather than exact per-field accounting.
    pub fn record_path_usage(&self, delta: &Delta, serialized_len: usize) {
        let value_count = delta.value_count();
        if value_count == 0 {
            return;
        }
        let share = serialized_len as f64 / value_count as f64;

        let mut inner = self.inner();
        for value in delta.values() {
            let path = value.path.to_string();
            let usage = inner.path_usage.entry(path.clone())
                .or_insert_with(|| PathUsage { path, ..Default::default() });
            usage.count += 1;
            usage.bytes += share;
        }
    }

    pub fn update_batch_state(&self, state: BatchState) {
        self.inner().batch_state = Some(state);
    }

    fn compression_ratio(&self) -> f64 {
        let raw = self.raw_bytes_out.load(Ordering::Relaxed);
        if raw == 0 {
            return 0.0;
        }
        let wire = self.bytes_out.load(Ordering::Relaxed);
        100.0 * (1.0 - wire as f64 / raw as f64)
    }

    /// Computes transfer rates since the previous sample and appends them to the history
    pub fn sample_rates(&self) -> MetricsSample {
        self.sample_rates_at(Instant::now(), Utc::now())
    }

    fn sample_rates_at(&self, now: Instant, timestamp: DateTime<Utc>) -> MetricsSample {
        let bytes_out = self.bytes_out.load(Ordering::Relaxed);
        let bytes_in = self.bytes_in.load(Ordering::Relaxed);

        let mut inner = self.inner();
        let elapsed = now.saturating_duration_since(inner.last_sample.at).as_secs_f64();
        let (rate_out, rate_in) = if elapsed > 0.0 {
            (
                bytes_out.saturating_sub(inner.last_sample.bytes_out) as f64 / elapsed,
                bytes_in.saturating_sub(inner.last_sample.bytes_in) as f64 / elapsed,
            )
        }
        else {
            (0.0, 0.0)
        };

        let sample = MetricsSample {
            timestamp,
            rate_out,
            rate_in,
            compression_ratio: self.compression_ratio(),
        };
        trace!(?sample, "sampled transfer rates");

        inner.last_sample = RateBaseline { at: now, bytes_out, bytes_in };
        inner.history.push(sample.clone());
        sample
    }

    /// A consistent-enough view of all counters, with the `top_n` paths by attributed bytes
    pub fn snapshot(&self, top_n: usize) -> MetricsSnapshot {
        let inner = self.inner();

        let mut top_paths = inner.path_usage.values()
            .cloned()
            .collect::<Vec<_>>();
        top_paths.sort_by(|a, b| b.bytes.total_cmp(&a.bytes).then_with(|| a.path.cmp(&b.path)));
        top_paths.truncate(top_n);

        MetricsSnapshot {
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            packets_in: self.packets_in.load(Ordering::Relaxed),
            deltas_out: self.deltas_out.load(Ordering::Relaxed),
            deltas_in: self.deltas_in.load(Ordering::Relaxed),
            compression_ratio: self.compression_ratio(),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            authentication_failures: self.authentication_failures.load(Ordering::Relaxed),
            decompression_failures: self.decompression_failures.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            dropped_not_ready: self.dropped_not_ready.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            batching: BatchingSnapshot {
                early_sends: self.early_sends.load(Ordering::Relaxed),
                timer_sends: self.timer_sends.load(Ordering::Relaxed),
                oversized_packets: self.oversized_packets.load(Ordering::Relaxed),
                avg_bytes_per_delta: inner.batch_state.map(|s| s.avg_bytes_per_delta),
                max_deltas_per_batch: inner.batch_state.map(|s| s.max_deltas_per_batch),
            },
            history: inner.history.iter().cloned().collect(),
            top_paths,
        }
    }
}
