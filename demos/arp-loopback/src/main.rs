use arp_packets::{EthernetFrame, MacAddr};
use arp_resolver::{Arp, ArpConfig, ChannelTransport};
use clap::{App, Arg, ArgMatches};
use crossbeam::channel::{self, Receiver};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Carries every frame `wire` receives over to `host`, like a cable between two ports.
fn forward(name: &'static str, wire: Receiver<Vec<u8>>, host: Arp<ChannelTransport>) {
    thread::spawn(move || {
        for data in wire.iter() {
            match EthernetFrame::from_buffer(data, 0) {
                Ok(frame) => host.input_frame(frame),
                Err(e) => warn!(link = name, error = e, "dropping runt frame"),
            }
        }
    });
}

fn parse<T: FromStr>(matches: &ArgMatches, name: &str) -> T
where
    T::Err: std::fmt::Display,
{
    let value = matches.value_of(name).unwrap_or_default();
    value
        .parse()
        .unwrap_or_else(|e| clap::Error::value_validation_auto(format!("{}: {}", name, e)).exit())
}

fn is_parseable<T: FromStr>(value: String) -> Result<(), String> {
    value
        .parse::<T>()
        .map(|_| ())
        .map_err(|_| format!("{} is not a valid value", value))
}

#[tokio::main]
async fn main() {
    let matches = App::new("arp-loopback")
        .version("0.1.0")
        .about("Resolves addresses between two ARP engines joined by an in-memory link")
        .arg(
            Arg::with_name("local")
                .long("local-ip")
                .value_name("IP")
                .takes_value(true)
                .default_value("10.0.0.1")
                .validator(is_parseable::<Ipv4Addr>),
        )
        .arg(
            Arg::with_name("peer")
                .long("peer-ip")
                .value_name("IP")
                .takes_value(true)
                .default_value("10.0.0.2")
                .validator(is_parseable::<Ipv4Addr>),
        )
        .arg(
            Arg::with_name("local-mac")
                .long("local-mac")
                .value_name("MAC")
                .takes_value(true)
                .default_value("02:00:00:00:00:01")
                .validator(is_parseable::<MacAddr>),
        )
        .arg(
            Arg::with_name("peer-mac")
                .long("peer-mac")
                .value_name("MAC")
                .takes_value(true)
                .default_value("02:00:00:00:00:02")
                .validator(is_parseable::<MacAddr>),
        )
        .arg(
            Arg::with_name("missing")
                .long("missing-ip")
                .value_name("IP")
                .help("An address nobody owns, queried to show a timeout")
                .takes_value(true)
                .default_value("10.0.0.50")
                .validator(is_parseable::<Ipv4Addr>),
        )
        .arg(
            Arg::with_name("retry-delay")
                .long("retry-delay")
                .value_name("MILLIS")
                .takes_value(true)
                .default_value("500")
                .validator(is_parseable::<u64>),
        )
        .arg(
            Arg::with_name("retries")
                .long("retries")
                .value_name("COUNT")
                .takes_value(true)
                .default_value("3")
                .validator(is_parseable::<u32>),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log every packet the engines handle"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let local_ip: Ipv4Addr = parse(&matches, "local");
    let peer_ip: Ipv4Addr = parse(&matches, "peer");
    let missing_ip: Ipv4Addr = parse(&matches, "missing");
    let config = ArpConfig::new()
        .retry_delay(Duration::from_millis(parse(&matches, "retry-delay")))
        .max_retries(parse(&matches, "retries"));

    let (local_tx, local_rx) = channel::unbounded();
    let (peer_tx, peer_rx) = channel::unbounded();
    let local_mac: MacAddr = parse(&matches, "local-mac");
    let peer_mac: MacAddr = parse(&matches, "peer-mac");

    let local = Arp::connect_with_ip(
        ChannelTransport::new(local_mac, local_tx),
        Some(local_ip),
        config,
    );
    let peer = Arp::connect_with_ip(
        ChannelTransport::new(peer_mac, peer_tx),
        Some(peer_ip),
        config,
    );
    forward("local->peer", local_rx, peer.clone());
    forward("peer->local", peer_rx, local.clone());

    for ip in &[peer_ip, local_ip, missing_ip] {
        match local.query(*ip).await {
            Ok(mac) => info!(%ip, %mac, "resolved"),
            Err(e) => warn!(%ip, error = %e, "query failed"),
        }
    }

    // The peer learned our binding from the request it answered.
    match peer.query(local_ip).await {
        Ok(mac) => info!(ip = %local_ip, %mac, "peer resolved"),
        Err(e) => warn!(ip = %local_ip, error = %e, "peer query failed"),
    }

    println!("local\n{}\n", local);
    println!("peer\n{}", peer);

    local.disconnect();
    peer.disconnect();
}
