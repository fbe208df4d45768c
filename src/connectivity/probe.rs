use std::io;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::trace;

use crate::config::ConnectivityConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    #[error("target unreachable: {0}")]
    Unreachable(io::ErrorKind),
    #[error("probe timed out")]
    Timeout,
    #[error("probe failed: {0}")]
    Other(String),
}

/// Checks whether the far end of the link can be reached, returning the round trip time
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReachabilityProbe: Send + Sync + 'static {
    async fn probe(&self, target: &ConnectivityConfig) -> Result<Duration, ProbeFailure>;
}

/// Probes by opening (and immediately closing) a TCP connection. The time to establish the
///  connection is taken as the round trip time.
pub struct TcpConnectProbe;

#[async_trait]
impl ReachabilityProbe for TcpConnectProbe {
    async fn probe(&self, target: &ConnectivityConfig) -> Result<Duration, ProbeFailure> {
        let started = Instant::now();
        match timeout(target.timeout, TcpStream::connect((target.host.as_str(), target.port))).await {
            Ok(Ok(_stream)) => {
                let rtt = started.elapsed();
                trace!("connected to {}:{} in {:?}", target.host, target.port, rtt);
                Ok(rtt)
            }
            Ok(Err(e)) => match e.kind() {
                io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset | io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                    Err(ProbeFailure::Unreachable(e.kind()))
                }
                io::ErrorKind::TimedOut => Err(ProbeFailure::Timeout),
                _ => Err(ProbeFailure::Other(e.to_string())),
            },
            Err(_) => Err(ProbeFailure::Timeout),
        }
    }
}
