//! UDP plumbing: sending sealed packets with a bounded retry on transient failures, and a
//!  receive loop dispatching each datagram to a handler.
//!
//! There is no fragmentation and no acknowledgement: delivery is best effort. Packets bigger than
//!  the configured MTU budget are still sent (and counted), since keeping them small is the
//!  batcher's job.

pub mod retry;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::error::PipelineError;
use crate::metrics::MetricsCollector;
use crate::transport::retry::{RetryBackoff, RetryConfig};

/// Maximum UDP payload; the receive buffer is sized so no datagram is ever truncated
const MAX_DATAGRAM_LEN: usize = 65_535;

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_to(&self, packet: &[u8], to: SocketAddr) -> io::Result<usize>;
}

#[async_trait]
impl SendSocket for UdpSocket {
    async fn send_to(&self, packet: &[u8], to: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, packet, to).await
    }
}

/// Errors that go away by themselves if the sender backs off for a moment, typically because
///  the OS ran out of socket buffer space
pub fn is_transient(e: &io::Error) -> bool {
    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut) {
        return true;
    }

    // errno values differ between platforms
    #[cfg(target_os = "linux")]
    {
        const EAGAIN: i32 = 11;
        const ENOBUFS: i32 = 105;
        if matches!(e.raw_os_error(), Some(EAGAIN) | Some(ENOBUFS)) {
            return true;
        }
    }

    false
}

pub struct PacketTransport {
    socket: Arc<dyn SendSocket>,
    safe_mtu: usize,
    retry: RetryConfig,
    metrics: Arc<MetricsCollector>,
}

impl PacketTransport {
    pub fn new(socket: Arc<dyn SendSocket>, safe_mtu: usize, retry: RetryConfig, metrics: Arc<MetricsCollector>) -> PacketTransport {
        PacketTransport {
            socket,
            safe_mtu,
            retry,
            metrics,
        }
    }

    pub fn with_safe_mtu(&self, safe_mtu: usize, retry: RetryConfig) -> PacketTransport {
        PacketTransport {
            socket: self.socket.clone(),
            safe_mtu,
            retry,
            metrics: self.metrics.clone(),
        }
    }

    pub fn safe_mtu(&self) -> usize {
        self.safe_mtu
    }

    pub async fn send(&self, packet: &[u8], to: SocketAddr) -> Result<(), PipelineError> {
        if packet.len() > self.safe_mtu {
            warn!("packet of {} bytes exceeds the MTU budget of {} bytes - sending anyway, it may be fragmented or dropped", packet.len(), self.safe_mtu);
            self.metrics.record_oversized_packet();
        }

        let mut backoff = RetryBackoff::new(&self.retry);
        loop {
            match self.socket.send_to(packet, to).await {
                Ok(_) => {
                    trace!("sent packet of {} bytes to {:?}", packet.len(), to);
                    return Ok(());
                }
                Err(e) if is_transient(&e) => {
                    match backoff.next_delay() {
                        Some(delay) => {
                            debug!("transient error sending to {:?}, retrying in {:?}: {}", to, delay, e);
                            sleep(delay).await;
                        }
                        None => {
                            warn!("giving up sending to {:?} after {} attempts: {}", to, backoff.attempts(), e);
                            self.metrics.record_send_error();
                            return Err(PipelineError::TransientSend { attempts: backoff.attempts(), source: e });
                        }
                    }
                }
                Err(e) => {
                    error!("error sending UDP packet to {:?}: {}", to, e);
                    self.metrics.record_send_error();
                    return Err(PipelineError::Send(e));
                }
            }
        }
    }
}


/// This trait decouples the receive loop from what happens to a packet once it is received.
///
/// A handler is responsible for isolating failures: whatever goes wrong with one packet must not
///  affect the next one.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn on_packet(&self, packet: &[u8], from: SocketAddr);
}

/// Receives datagrams until a cancellation signal arrives. Socket errors are logged and skipped.
pub async fn recv_loop(socket: &UdpSocket, handler: Arc<dyn PacketHandler>, mut cancel: broadcast::Receiver<()>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

    info!("starting UDP receive loop on {:?}", socket.local_addr());

    loop {
        tokio::select! {
            r = socket.recv_from(&mut buf) => {
                match r {
                    Ok((len, from)) => {
                        trace!("received {} bytes from {:?}", len, from);
                        handler.on_packet(&buf[..len], from).await;
                    }
                    Err(e) => {
                        error!(error = ?e, "error receiving from datagram socket");
                    }
                }
            }
            _ = cancel.recv() => break,
        }
    }

    info!("UDP receive loop stopped");
}
