use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::select;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bus::TelemetryBus;
use crate::config::{ConnectivityConfig, LinkConfig};
use crate::connectivity::probe::{ProbeFailure, ReachabilityProbe};
use crate::connectivity::state::{ConnectivityMonitor, ConnectivitySnapshot};
use crate::model::{Delta, PathValue, Update};

/// Added to the probe interval for the watchdog, so a probe that takes a while still counts
pub const WATCHDOG_BUFFER: Duration = Duration::from_secs(30);

pub const RTT_CONTEXT: &str = "vessels.self";
pub const RTT_PATH: &str = "networking.modem.rtt";

/// RTT samples waiting for the bus; newer samples are dropped while it is full
const RTT_QUEUE_LEN: usize = 4;

/// far enough in the future to never fire while the watchdog is disarmed
const DISARMED: Duration = Duration::from_secs(30 * 365 * 24 * 3600);

struct Probing {
    target: ConnectivityConfig,
    interval: Interval,
}
impl Probing {
    fn new(target: ConnectivityConfig) -> Probing {
        let mut interval = interval(target.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Probing { target, interval }
    }
}

/// Runs the connectivity monitor until a cancellation signal arrives, publishing every state
///  change to `state_sender` and every measured RTT to the telemetry bus.
///
/// Probes run as separate tasks, and a new probe is only started when the previous one
///  completed. A probe that hangs is caught by the watchdog: if no probe succeeds within the
///  probe interval plus [WATCHDOG_BUFFER], the link is considered down and the hanging probe
///  is abandoned so that the next tick probes again.
///
/// RTT samples are handed to a separate publishing task, so a slow telemetry bus never delays
///  the watchdog or shutdown.
pub async fn run_connectivity_monitor(
    probe: Arc<dyn ReachabilityProbe>,
    bus: Arc<dyn TelemetryBus>,
    mut config: watch::Receiver<Arc<LinkConfig>>,
    state_sender: watch::Sender<ConnectivitySnapshot>,
    mut cancel: broadcast::Receiver<()>,
) {
    let mut monitor = ConnectivityMonitor::new();
    let (mut target, mut source_id) = {
        let config = config.borrow_and_update();
        (config.connectivity.clone(), config.source_id.clone())
    };

    let mut probing = target.clone().map(Probing::new);
    if probing.is_none() {
        state_sender.send_replace(monitor.assume_up());
    }

    let mut in_flight: JoinSet<Result<Duration, ProbeFailure>> = JoinSet::new();

    let (rtt_sender, rtt_receiver) = mpsc::channel(RTT_QUEUE_LEN);
    let rtt_publisher = tokio::spawn(publish_rtts(bus, rtt_receiver));

    let mut config_open = true;

    let watchdog = sleep(DISARMED);
    tokio::pin!(watchdog);

    info!("starting connectivity monitor, probing {:?}", target);

    loop {
        select! {
            _ = cancel.recv() => break,
            _ = tick(&mut probing) => {
                if !in_flight.is_empty() {
                    debug!("previous connectivity probe still running - skipping");
                    continue;
                }
                if let Some(probing) = &probing {
                    let probe = probe.clone();
                    let target = probing.target.clone();
                    in_flight.spawn(async move {
                        probe.probe(&target).await
                    });
                }
            }
            Some(result) = in_flight.join_next() => {
                let result = match result {
                    Ok(r) => r,
                    Err(e) if e.is_cancelled() => continue,
                    Err(e) => {
                        error!("connectivity probe panicked: {}", e);
                        Err(ProbeFailure::Other(e.to_string()))
                    }
                };

                match result {
                    Ok(rtt) => {
                        let snapshot = monitor.on_probe_success(rtt.as_millis() as u64);
                        state_sender.send_replace(snapshot);

                        if let Some(probing) = &probing {
                            watchdog.as_mut().reset(Instant::now() + probing.target.interval + WATCHDOG_BUFFER);
                        }
                        if rtt_sender.try_send((source_id.clone(), rtt)).is_err() {
                            debug!("telemetry bus is busy - dropping RTT sample");
                        }
                    }
                    Err(failure) => {
                        state_sender.send_replace(monitor.on_probe_failure(&failure));
                        watchdog.as_mut().reset(Instant::now() + DISARMED);
                    }
                }
            }
            _ = &mut watchdog => {
                warn!("no successful connectivity probe for longer than expected");
                state_sender.send_replace(monitor.on_watchdog_expired());
                watchdog.as_mut().reset(Instant::now() + DISARMED);
                in_flight.abort_all();
            }
            changed = config.changed(), if config_open => {
                if changed.is_err() {
                    debug!("configuration channel closed - keeping the current probe target");
                    config_open = false;
                    continue;
                }
                let (new_target, new_source_id) = {
                    let config = config.borrow_and_update();
                    (config.connectivity.clone(), config.source_id.clone())
                };
                source_id = new_source_id;
                if new_target == target {
                    continue;
                }

                info!("connectivity probe target changed to {:?}", new_target);
                in_flight.abort_all();
                watchdog.as_mut().reset(Instant::now() + DISARMED);
                target = new_target;
                probing = target.clone().map(Probing::new);
                if probing.is_none() {
                    state_sender.send_replace(monitor.assume_up());
                }
            }
        }
    }

    in_flight.abort_all();
    rtt_publisher.abort();
    state_sender.send_replace(monitor.stop());
    info!("connectivity monitor stopped");
}

async fn tick(probing: &mut Option<Probing>) {
    match probing {
        Some(probing) => { probing.interval.tick().await; }
        None => std::future::pending().await,
    }
}

async fn publish_rtts(bus: Arc<dyn TelemetryBus>, mut samples: mpsc::Receiver<(String, Duration)>) {
    while let Some((source_id, rtt)) = samples.recv().await {
        let delta = Delta::new(RTT_CONTEXT, vec![
            Update::new(Utc::now(), vec![PathValue::new(RTT_PATH, json!(rtt.as_secs_f64()))]),
        ]);
        if let Err(e) = bus.publish(&source_id, delta).await {
            warn!("publishing RTT failed: {}", e);
        }
    }
}
