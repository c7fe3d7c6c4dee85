use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use anyhow::bail;
use clap::Parser;
use clap_derive::Parser;
use dtpc::config::DtpcConfig;
use dtpc::daemon::DtpcDaemon;
use dtpc::endpoint::EndpointId;
use dtpc::profile::Profile;
use dtpc::store::MemoryStore;
use dtpc::test_util::transport::LoopbackTransport;
use dtpc::transport::OutboundBundle;
use std::sync::Arc;
use tracing::{info, Level};

/// Sends data items from one in-process DTPC node to another and prints what arrives
#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 20)]
    num_items: u32,

    #[clap(long, default_value_t = 7)]
    topic: u32,

    #[clap(long, default_value_t = 2)]
    retransmission_limit: u32,

    #[clap(long, default_value_t = 60)]
    expiration: u64,

    /// bytes, 0 for no aggregation
    #[clap(long, default_value_t = 64)]
    aggregation_size_limit: u64,

    /// seconds, 0 for no aggregation
    #[clap(long, default_value_t = 2)]
    aggregation_time_limit: u64,

    /// drop every n-th data bundle, 0 for none
    #[clap(long, default_value_t = 0)]
    drop_every: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let sender_eid = EndpointId::ipn(1, 129);
    let receiver_eid = EndpointId::ipn(2, 129);

    let loopback = LoopbackTransport::new();
    let sender = DtpcDaemon::start(DtpcConfig::new(sender_eid.clone()), loopback.clone(), Arc::new(MemoryStore::new()))?;
    let receiver = DtpcDaemon::start(DtpcConfig::new(receiver_eid.clone()), loopback.clone(), Arc::new(MemoryStore::new()))?;
    loopback.add_route(sender_eid, sender.clone()).await;
    loopback.add_route(receiver_eid.clone(), receiver.clone()).await;

    if args.drop_every > 0 {
        let drop_every = args.drop_every;
        let counter = AtomicU64::new(0);
        loopback.set_drop_filter(Some(Box::new(move |b: &OutboundBundle| {
            // data PDUs only, ACKs always get through
            b.payload.first() == Some(&0x00)
                && (counter.fetch_add(1, Ordering::AcqRel) + 1) % drop_every == 0
        }))).await;
    }

    sender.add_profile(Profile {
        retransmission_limit: args.retransmission_limit,
        aggregation_size_limit: args.aggregation_size_limit,
        aggregation_time_limit: args.aggregation_time_limit,
        ..Profile::new(1, args.expiration)
    }).await?;
    let mut registration = receiver.register_topic(args.topic, false).await?;

    for i in 0..args.num_items {
        sender.send_data_item(args.topic, receiver_eid.clone(), 1, format!("data item #{}", i).into_bytes()).await?;
    }

    let mut num_received = 0;
    while num_received < args.num_items {
        let Some(item) = registration.pop_next(Duration::from_secs(args.expiration)).await else {
            bail!("received {} of {} data items before timing out", num_received, args.num_items);
        };
        info!("received from {}: {}", item.remote_eid, String::from_utf8_lossy(&item.data));
        num_received += 1;
    }

    info!("sender: {:?}", sender.stats().await?);
    info!("receiver: {:?}", receiver.stats().await?);

    sender.shutdown().await?;
    receiver.shutdown().await?;
    Ok(())
}
