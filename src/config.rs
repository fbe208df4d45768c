use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use rustc_hash::FxHashSet;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::info;

use crate::codec::encryption::{validate_key, ENCRYPTION_OVERHEAD};
use crate::codec::serializer::SerializationFormat;
use crate::transport::retry::RetryConfig;

/// the biggest payload that fits into a single IPv4 UDP datagram
const MAX_UDP_PAYLOAD: usize = 65_507;
const MIN_SAFE_MTU: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityConfig {
    pub host: String,
    pub port: u16,
    /// time between two reachability probes
    pub interval: Duration,
    /// a probe that takes longer than this is reported as a timeout
    pub timeout: Duration,
}
impl ConnectivityConfig {
    pub fn new(host: impl Into<String>, port: u16) -> ConnectivityConfig {
        ConnectivityConfig {
            host: host.into(),
            port,
            interval: Duration::from_secs(5 * 60),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct LinkConfig {
    pub serialization: SerializationFormat,
    pub use_path_dictionary: bool,
    /// shared secret of both ends of the link, exactly 32 bytes
    pub encryption_key: Vec<u8>,

    /// maximum time a delta waits in the batcher before its batch is sent
    pub batch_interval: Duration,
    /// packet size that batches aim to stay below
    pub safe_mtu: usize,
    pub retry: RetryConfig,

    /// where the sender sends its packets
    pub destination: SocketAddr,
    /// the local address: the receiver listens here, the sender sends from here
    pub bind_addr: SocketAddr,

    /// reachability probe for the link; without it, the link is considered up all the time
    pub connectivity: Option<ConnectivityConfig>,
    /// NMEA sentence tags (e.g. `GSV`) of updates that are not worth sending
    pub excluded_sentences: FxHashSet<String>,

    /// the source id under which deltas are published to the telemetry bus
    pub source_id: String,
    pub metrics_interval: Duration,
}

impl std::fmt::Debug for LinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkConfig")
            .field("serialization", &self.serialization)
            .field("use_path_dictionary", &self.use_path_dictionary)
            .field("encryption_key", &"<redacted>")
            .field("batch_interval", &self.batch_interval)
            .field("safe_mtu", &self.safe_mtu)
            .field("retry", &self.retry)
            .field("destination", &self.destination)
            .field("bind_addr", &self.bind_addr)
            .field("connectivity", &self.connectivity)
            .field("excluded_sentences", &self.excluded_sentences)
            .field("source_id", &self.source_id)
            .field("metrics_interval", &self.metrics_interval)
            .finish()
    }
}

impl LinkConfig {
    pub fn new(destination: SocketAddr, encryption_key: impl Into<Vec<u8>>) -> LinkConfig {
        LinkConfig {
            serialization: SerializationFormat::Json,
            use_path_dictionary: true,
            encryption_key: encryption_key.into(),
            batch_interval: Duration::from_secs(1),
            safe_mtu: 1400,
            retry: RetryConfig::default(),
            destination,
            bind_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            connectivity: None,
            excluded_sentences: FxHashSet::default(),
            source_id: "deltalink".to_string(),
            metrics_interval: Duration::from_secs(1),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_key(&self.encryption_key)?;

        if self.destination.port() == 0 {
            bail!("destination port must not be 0");
        }
        if self.safe_mtu < MIN_SAFE_MTU || self.safe_mtu > MAX_UDP_PAYLOAD {
            bail!("safe MTU must be between {} and {}, was {}", MIN_SAFE_MTU, MAX_UDP_PAYLOAD, self.safe_mtu);
        }
        if self.safe_mtu <= ENCRYPTION_OVERHEAD {
            bail!("safe MTU leaves no room for payload");
        }
        if self.batch_interval.is_zero() {
            bail!("batch interval must be positive");
        }
        if self.metrics_interval.is_zero() {
            bail!("metrics interval must be positive");
        }
        if self.retry.delay_factor_eighths < 8 {
            bail!("retry delay factor must not shrink the delay");
        }
        if self.source_id.is_empty() {
            bail!("source id must not be empty");
        }

        if let Some(connectivity) = &self.connectivity {
            if connectivity.host.trim().is_empty() {
                bail!("connectivity probe host must not be empty");
            }
            if connectivity.port == 0 {
                bail!("connectivity probe port must not be 0");
            }
            if connectivity.interval.is_zero() {
                bail!("connectivity probe interval must be positive");
            }
            if connectivity.timeout.is_zero() {
                bail!("connectivity probe timeout must be positive");
            }
        }

        Ok(())
    }

    /// Parses and validates the host's JSON settings document
    pub fn from_json(json: &str) -> anyhow::Result<LinkConfig> {
        let raw: RawSettings = serde_json::from_str(json)
            .context("malformed link settings")?;
        let config = raw.into_config();
        config.validate()?;
        Ok(config)
    }
}


#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSettings {
    #[serde(default = "default_serialization")]
    serialization_mode: SerializationFormat,
    #[serde(default = "default_true")]
    use_path_dictionary: bool,
    encryption_key: String,
    #[serde(default = "default_batch_interval_ms")]
    batch_interval_ms: u64,
    #[serde(default = "default_safe_mtu")]
    safe_mtu: usize,
    destination: SocketAddr,
    bind_address: Option<SocketAddr>,
    connectivity: Option<RawConnectivity>,
    #[serde(default)]
    excluded_sentences: Vec<String>,
    source_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConnectivity {
    host: String,
    port: u16,
    #[serde(default = "default_probe_interval_minutes")]
    interval_minutes: f64,
    #[serde(default = "default_probe_timeout_ms")]
    timeout_ms: u64,
}

fn default_serialization() -> SerializationFormat { SerializationFormat::Json }
fn default_true() -> bool { true }
fn default_batch_interval_ms() -> u64 { 1000 }
fn default_safe_mtu() -> usize { 1400 }
fn default_probe_interval_minutes() -> f64 { 5.0 }
fn default_probe_timeout_ms() -> u64 { 10_000 }

impl RawSettings {
    fn into_config(self) -> LinkConfig {
        let mut config = LinkConfig::new(self.destination, self.encryption_key.into_bytes());
        config.serialization = self.serialization_mode;
        config.use_path_dictionary = self.use_path_dictionary;
        config.batch_interval = Duration::from_millis(self.batch_interval_ms);
        config.safe_mtu = self.safe_mtu;
        if let Some(bind_addr) = self.bind_address {
            config.bind_addr = bind_addr;
        }
        config.connectivity = self.connectivity.map(|c| ConnectivityConfig {
            host: c.host,
            port: c.port,
            interval: Duration::try_from_secs_f64(c.interval_minutes * 60.0).unwrap_or(Duration::ZERO),
            timeout: Duration::from_millis(c.timeout_ms),
        });
        config.excluded_sentences = self.excluded_sentences.into_iter()
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if let Some(source_id) = self.source_id {
            config.source_id = source_id;
        }
        config
    }
}


/// The configuration store's side of hot reload: new configuration snapshots are validated
///  before they are published, so the link only ever sees valid configurations.
pub struct ConfigPublisher {
    sender: watch::Sender<Arc<LinkConfig>>,
}

impl ConfigPublisher {
    pub fn publish(&self, config: LinkConfig) -> anyhow::Result<()> {
        config.validate()
            .context("rejected configuration update")?;
        info!("publishing updated link configuration");
        self.sender.send_replace(Arc::new(config));
        Ok(())
    }

    pub fn publish_json(&self, json: &str) -> anyhow::Result<()> {
        let config = LinkConfig::from_json(json)
            .context("rejected configuration update")?;
        self.publish(config)
    }

    pub fn current(&self) -> Arc<LinkConfig> {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<LinkConfig>> {
        self.sender.subscribe()
    }
}

pub fn config_channel(initial: LinkConfig) -> anyhow::Result<(ConfigPublisher, watch::Receiver<Arc<LinkConfig>>)> {
    initial.validate()?;
    let (sender, receiver) = watch::channel(Arc::new(initial));
    Ok((ConfigPublisher { sender }, receiver))
}
