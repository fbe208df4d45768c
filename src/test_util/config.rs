use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::config::LinkConfig;

pub const TEST_KEY: &[u8; 32] = b"12345678901234567890123456789012";

/// A valid configuration without connectivity probe, sending to a local port
pub fn test_config() -> LinkConfig {
    let mut config = LinkConfig::new(SocketAddr::from_str("127.0.0.1:4446").unwrap(), TEST_KEY.to_vec());
    config.bind_addr = SocketAddr::from_str("127.0.0.1:0").unwrap();
    config.batch_interval = Duration::from_millis(100);
    config
}
