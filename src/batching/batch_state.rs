use serde::Serialize;

#[derive(Debug, Clone)]
pub struct BatchTuning {
    /// the packet size that batches aim to stay below
    pub safe_mtu: usize,
    /// fraction of the MTU that the size estimate is allowed to fill, leaving headroom for
    ///  packet-to-packet variance
    pub margin_factor: f64,
    /// weight of the newest sample in the moving average, > 0 and <= 1
    pub smoothing: f64,
    pub min_deltas: usize,
    pub max_deltas: usize,
    /// the size estimate before any packet was sent
    pub initial_bytes_per_delta: f64,
}
impl BatchTuning {
    pub fn new(safe_mtu: usize) -> BatchTuning {
        BatchTuning {
            safe_mtu,
            margin_factor: 0.85,
            smoothing: 0.2,
            min_deltas: 1,
            max_deltas: 50,
            initial_bytes_per_delta: 200.0,
        }
    }
}

/// The batcher's estimate of how many deltas fit into a packet, learned from the sizes of
///  packets actually sent
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchState {
    pub avg_bytes_per_delta: f64,
    pub max_deltas_per_batch: usize,
}

impl BatchState {
    pub fn initial(tuning: &BatchTuning) -> BatchState {
        let avg_bytes_per_delta = tuning.initial_bytes_per_delta;
        BatchState {
            avg_bytes_per_delta,
            max_deltas_per_batch: Self::deltas_per_batch(tuning, avg_bytes_per_delta),
        }
    }

    /// Feeds the size of a sent packet into the moving average and re-derives the batch limit.
    ///  Samples without deltas carry no information and are ignored.
    pub fn on_packet_sent(&mut self, tuning: &BatchTuning, packet_len: usize, delta_count: usize) {
        if delta_count == 0 {
            return;
        }

        let bytes_per_delta = packet_len as f64 / delta_count as f64;
        self.avg_bytes_per_delta = (1.0 - tuning.smoothing) * self.avg_bytes_per_delta + tuning.smoothing * bytes_per_delta;
        self.max_deltas_per_batch = Self::deltas_per_batch(tuning, self.avg_bytes_per_delta);
    }

    /// Re-derives the batch limit from the current estimate, e.g. after the MTU budget changed
    pub fn retune(&mut self, tuning: &BatchTuning) {
        self.max_deltas_per_batch = Self::deltas_per_batch(tuning, self.avg_bytes_per_delta);
    }

    fn deltas_per_batch(tuning: &BatchTuning, avg_bytes_per_delta: f64) -> usize {
        if avg_bytes_per_delta <= 0.0 {
            return tuning.max_deltas;
        }

        let raw = (tuning.safe_mtu as f64 * tuning.margin_factor / avg_bytes_per_delta).floor();
        (raw as usize).clamp(tuning.min_deltas, tuning.max_deltas)
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_initial() {
        let state = BatchState::initial(&BatchTuning::new(1400));
        assert_eq!(state.avg_bytes_per_delta, 200.0);
        assert_eq!(state.max_deltas_per_batch, 5);
    }

    #[test]
    fn test_single_update() {
        let tuning = BatchTuning::new(1400);
        let mut state = BatchState::initial(&tuning);

        state.on_packet_sent(&tuning, 500, 5);
        assert!((state.avg_bytes_per_delta - 180.0).abs() < 1e-9);
        assert_eq!(state.max_deltas_per_batch, 6);
    }

    #[test]
    fn test_empty_sample_is_ignored() {
        let tuning = BatchTuning::new(1400);
        let mut state = BatchState::initial(&tuning);
        state.on_packet_sent(&tuning, 100, 0);
        assert_eq!(state, BatchState::initial(&tuning));
    }

    #[rstest]
    #[case::small(100, 11)]
    #[case::medium(230, 5)]
    #[case::tiny_hits_upper_bound(10, 50)]
    #[case::huge_hits_lower_bound(5000, 1)]
    #[case::just_below_mtu_budget(1000, 1)]
    fn test_convergence(#[case] bytes_per_delta: usize, #[case] expected_max: usize) {
        let tuning = BatchTuning::new(1400);
        let mut state = BatchState::initial(&tuning);

        for _ in 0..200 {
            let n = state.max_deltas_per_batch;
            state.on_packet_sent(&tuning, n * bytes_per_delta, n);
        }

        assert!((state.avg_bytes_per_delta - bytes_per_delta as f64).abs() < 0.01);
        assert_eq!(state.max_deltas_per_batch, expected_max);
        assert_eq!(expected_max, ((1400.0 * 0.85 / bytes_per_delta as f64).floor() as usize).clamp(1, 50));
    }

    #[test]
    fn test_adapts_to_growing_payloads() {
        let tuning = BatchTuning::new(1400);
        let mut state = BatchState::initial(&tuning);

        for _ in 0..100 {
            state.on_packet_sent(&tuning, 50 * state.max_deltas_per_batch, state.max_deltas_per_batch);
        }
        assert_eq!(state.max_deltas_per_batch, 23);

        for _ in 0..100 {
            state.on_packet_sent(&tuning, 400 * state.max_deltas_per_batch, state.max_deltas_per_batch);
        }
        assert_eq!(state.max_deltas_per_batch, 2);
    }
}
