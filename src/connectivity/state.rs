use serde::Serialize;
use tracing::{debug, info, warn};

use crate::connectivity::probe::ProbeFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectivityState {
    /// no probe result yet
    Unknown,
    Up,
    Down,
    /// up again after a failure
    Restored,
    Timeout,
    Error,
    Stopped,
}
impl ConnectivityState {
    fn is_failure(&self) -> bool {
        matches!(self, ConnectivityState::Down | ConnectivityState::Timeout | ConnectivityState::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivitySnapshot {
    pub state: ConnectivityState,
    pub ready_to_send: bool,
    pub last_rtt_millis: Option<u64>,
}
impl Default for ConnectivitySnapshot {
    fn default() -> Self {
        ConnectivitySnapshot {
            state: ConnectivityState::Unknown,
            ready_to_send: false,
            last_rtt_millis: None,
        }
    }
}

/// The state machine deciding whether the link is ready to send. It is driven by probe results
///  and the watchdog; readiness is derived from the state, and only successful probes make
///  the link ready.
#[derive(Debug, Default)]
pub struct ConnectivityMonitor {
    snapshot: ConnectivitySnapshot,
}

impl ConnectivityMonitor {
    pub fn new() -> ConnectivityMonitor {
        Default::default()
    }

    pub fn snapshot(&self) -> ConnectivitySnapshot {
        self.snapshot
    }

    fn is_stopped(&self) -> bool {
        self.snapshot.state == ConnectivityState::Stopped
    }

    /// Without a probe target, the link is assumed to be up permanently
    pub fn assume_up(&mut self) -> ConnectivitySnapshot {
        if !self.is_stopped() {
            info!("no connectivity probe configured - assuming the link is up");
            self.snapshot.state = ConnectivityState::Up;
            self.snapshot.ready_to_send = true;
        }
        self.snapshot
    }

    pub fn on_probe_success(&mut self, rtt_millis: u64) -> ConnectivitySnapshot {
        if self.is_stopped() {
            return self.snapshot;
        }

        let state = if self.snapshot.state.is_failure() {
            info!("connectivity restored (RTT {} ms)", rtt_millis);
            ConnectivityState::Restored
        }
        else {
            debug!("connectivity probe succeeded (RTT {} ms)", rtt_millis);
            ConnectivityState::Up
        };

        self.snapshot = ConnectivitySnapshot {
            state,
            ready_to_send: true,
            last_rtt_millis: Some(rtt_millis),
        };
        self.snapshot
    }

    pub fn on_probe_failure(&mut self, failure: &ProbeFailure) -> ConnectivitySnapshot {
        let state = match failure {
            ProbeFailure::Unreachable(_) => ConnectivityState::Down,
            ProbeFailure::Timeout => ConnectivityState::Timeout,
            ProbeFailure::Other(_) => ConnectivityState::Error,
        };
        self.on_failure(state, failure)
    }

    /// No probe succeeded for longer than expected, so the probe itself may be stuck
    pub fn on_watchdog_expired(&mut self) -> ConnectivitySnapshot {
        self.on_failure(ConnectivityState::Timeout, &"watchdog expired")
    }

    fn on_failure(&mut self, state: ConnectivityState, reason: &dyn std::fmt::Display) -> ConnectivitySnapshot {
        if self.is_stopped() {
            return self.snapshot;
        }

        if self.snapshot.ready_to_send {
            warn!("link is down ({}) - dropping deltas until connectivity is restored", reason);
        }
        else {
            debug!("link still down: {}", reason);
        }
        self.snapshot.state = state;
        self.snapshot.ready_to_send = false;
        self.snapshot
    }

    pub fn stop(&mut self) -> ConnectivitySnapshot {
        self.snapshot.state = ConnectivityState::Stopped;
        self.snapshot.ready_to_send = false;
        self.snapshot
    }
}


#[cfg(test)]
mod tests {
    use std::io;
    use rstest::rstest;
    use super::*;
    use ConnectivityState::*;

    fn unreachable() -> ProbeFailure {
        ProbeFailure::Unreachable(io::ErrorKind::ConnectionRefused)
    }

    #[test]
    fn test_initial() {
        let monitor = ConnectivityMonitor::new();
        assert_eq!(monitor.snapshot(), ConnectivitySnapshot { state: Unknown, ready_to_send: false, last_rtt_millis: None });
    }

    #[rstest]
    #[case::unreachable(unreachable(), Down)]
    #[case::timeout(ProbeFailure::Timeout, Timeout)]
    #[case::other(ProbeFailure::Other("no route".to_string()), Error)]
    fn test_failure_then_restored(#[case] failure: ProbeFailure, #[case] expected: ConnectivityState) {
        let mut monitor = ConnectivityMonitor::new();

        let up = monitor.on_probe_success(120);
        assert_eq!((up.state, up.ready_to_send, up.last_rtt_millis), (Up, true, Some(120)));

        let down = monitor.on_probe_failure(&failure);
        assert_eq!((down.state, down.ready_to_send), (expected, false));
        assert_eq!(down.last_rtt_millis, Some(120));

        let restored = monitor.on_probe_success(80);
        assert_eq!((restored.state, restored.ready_to_send, restored.last_rtt_millis), (Restored, true, Some(80)));

        assert_eq!(monitor.on_probe_success(90).state, Up);
    }

    #[test]
    fn test_first_success_is_up() {
        let mut monitor = ConnectivityMonitor::new();
        assert_eq!(monitor.on_probe_success(10).state, Up);
    }

    #[test]
    fn test_watchdog() {
        let mut monitor = ConnectivityMonitor::new();
        monitor.on_probe_success(10);

        let snapshot = monitor.on_watchdog_expired();
        assert_eq!((snapshot.state, snapshot.ready_to_send), (Timeout, false));
        assert_eq!(monitor.on_probe_success(10).state, Restored);
    }

    #[test]
    fn test_assume_up() {
        let mut monitor = ConnectivityMonitor::new();
        let snapshot = monitor.assume_up();
        assert_eq!((snapshot.state, snapshot.ready_to_send), (Up, true));
    }

    #[test]
    fn test_stopped_is_final() {
        let mut monitor = ConnectivityMonitor::new();
        monitor.on_probe_success(10);
        assert_eq!(monitor.stop().state, Stopped);

        assert_eq!(monitor.on_probe_success(10).state, Stopped);
        assert_eq!(monitor.on_probe_failure(&unreachable()).state, Stopped);
        assert_eq!(monitor.on_watchdog_expired().state, Stopped);
        assert!(!monitor.assume_up().ready_to_send);
        assert_eq!(monitor.stop().state, Stopped);
    }
}
