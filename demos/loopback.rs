use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use clap_derive::Parser;
use deltalink::bus::TelemetryBus;
use deltalink::codec::serializer::SerializationFormat;
use deltalink::config::{config_channel, LinkConfig};
use deltalink::connectivity::probe::TcpConnectProbe;
use deltalink::link::{ReceiverLink, SenderLink};
use deltalink::metrics::MetricsCollector;
use deltalink::model::Delta;
use deltalink::test_util::delta::sample_delta;
use tokio::time::sleep;
use tracing::{info, Level};

/// Runs a sender and a receiver on localhost and pushes synthetic navigation deltas through
///  the link
#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 100)]
    count: u32,

    /// pause between two deltas
    #[clap(long, default_value_t = 20)]
    delta_interval_ms: u64,

    #[clap(long, default_value_t = 1000)]
    batch_interval_ms: u64,

    #[clap(long, default_value_t = false)]
    msgpack: bool,

    #[clap(long, default_value_t = false)]
    no_dictionary: bool,

    #[clap(long, default_value = "12345678901234567890123456789012")]
    key: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

struct LoggingBus;

#[async_trait]
impl TelemetryBus for LoggingBus {
    async fn publish(&self, source_id: &str, delta: Delta) -> anyhow::Result<()> {
        info!("{} published {} values for {}", source_id, delta.value_count(), delta.context);
        Ok(())
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let localhost: SocketAddr = "127.0.0.1:0".parse()?;
    let mut config = LinkConfig::new(localhost, args.key.into_bytes());
    config.bind_addr = localhost;
    config.batch_interval = Duration::from_millis(args.batch_interval_ms);
    config.use_path_dictionary = !args.no_dictionary;
    if args.msgpack {
        config.serialization = SerializationFormat::Msgpack;
    }

    let bus = Arc::new(LoggingBus);

    let mut receiver_config = config.clone();
    receiver_config.destination = "127.0.0.1:9".parse()?;
    let (_receiver_publisher, receiver_config) = config_channel(receiver_config)?;
    let receiver = ReceiverLink::start(receiver_config, bus.clone(), Arc::new(MetricsCollector::default())).await?;

    config.destination = receiver.local_addr();
    let (_sender_publisher, sender_config) = config_channel(config)?;
    let sender = SenderLink::start(sender_config, bus, Arc::new(TcpConnectProbe), Arc::new(MetricsCollector::default())).await?;

    for i in 0..args.count {
        sender.on_delta(sample_delta(i));
        sleep(Duration::from_millis(args.delta_interval_ms)).await;
    }
    sleep(Duration::from_millis(args.batch_interval_ms * 2)).await;

    sender.shutdown().await;
    receiver.shutdown().await;

    println!("sender:   {}", serde_json::to_string_pretty(&sender.metrics().snapshot(5))?);
    println!("receiver: {}", serde_json::to_string_pretty(&receiver.metrics().snapshot(5))?);
    Ok(())
}
