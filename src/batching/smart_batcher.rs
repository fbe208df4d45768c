use tracing::{debug, trace};

use crate::batching::batch_state::{BatchState, BatchTuning};
use crate::model::Delta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// the buffer reached the current batch limit
    BatchFull,
    /// the periodic batch timer elapsed
    Timer,
}

/// A batch taken out of the batcher, handed over to the pipeline
#[derive(Debug)]
pub struct Batch {
    pub deltas: Vec<Delta>,
    pub trigger: FlushTrigger,
}

/// Accumulates deltas and decides when to flush them, aiming for packets that fill (but do not
///  exceed) the MTU budget.
///
/// Taking a batch moves the buffered deltas out and leaves an empty buffer behind, so a flush
///  that is still in flight and deltas arriving in the meantime never share entries: nothing
///  is sent twice, and nothing is lost between two overlapping flushes.
pub struct SmartBatcher {
    tuning: BatchTuning,
    state: BatchState,
    buffer: Vec<Delta>,
}

impl SmartBatcher {
    pub fn new(tuning: BatchTuning) -> SmartBatcher {
        SmartBatcher {
            state: BatchState::initial(&tuning),
            tuning,
            buffer: Vec::new(),
        }
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Adds a delta to the buffer, returning the buffered batch if this delta filled it
    #[must_use]
    pub fn push(&mut self, delta: Delta) -> Option<Batch> {
        self.buffer.push(delta);

        if self.buffer.len() >= self.state.max_deltas_per_batch {
            trace!("batch full with {} deltas", self.buffer.len());
            return Some(self.take(FlushTrigger::BatchFull));
        }
        None
    }

    /// Called when the batch timer elapses: returns whatever is buffered, if anything
    #[must_use]
    pub fn on_timer(&mut self) -> Option<Batch> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.take(FlushTrigger::Timer))
    }

    /// Discards all buffered deltas, returning how many there were
    pub fn discard(&mut self) -> usize {
        let discarded = self.buffer.len();
        self.buffer.clear();
        discarded
    }

    pub fn on_batch_sent(&mut self, packet_len: usize, delta_count: usize) {
        self.state.on_packet_sent(&self.tuning, packet_len, delta_count);
        debug!("sent {} deltas in {} bytes - now {:.1} bytes per delta, up to {} deltas per batch",
            delta_count, packet_len, self.state.avg_bytes_per_delta, self.state.max_deltas_per_batch);
    }

    /// Applies a new MTU budget, keeping the learned size estimate
    pub fn set_safe_mtu(&mut self, safe_mtu: usize) {
        if safe_mtu == self.tuning.safe_mtu {
            return;
        }
        self.tuning.safe_mtu = safe_mtu;
        self.state.retune(&self.tuning);
    }

    fn take(&mut self, trigger: FlushTrigger) -> Batch {
        Batch {
            deltas: std::mem::take(&mut self.buffer),
            trigger,
        }
    }
}
