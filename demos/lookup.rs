use std::sync::Arc;
use std::time::{Duration, Instant};

use kadlookup::rpc::{Transport, UdpTransport};
use kadlookup::{Bytes, Dht, Key, PeerId};

use clap::Parser;

use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of nodes to run on localhost
    #[arg(short, long, default_value_t = 10)]
    nodes: usize,

    /// Key to store and look up
    #[arg(short, long, default_value = "hello")]
    key: String,

    /// Value to store
    #[arg(short, long, default_value = "world")]
    value: String,

    /// Print debug logs
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_thread_names(true)
        .init();

    let count = cli.nodes.max(2);

    let nodes = (0..count)
        .map(|_| {
            let transport = UdpTransport::bind(PeerId::random(), "127.0.0.1:0")
                .expect("failed to bind udp socket");

            let dht = Dht::builder()
                .build(Arc::new(transport))
                .expect("failed to build node");
            dht.start();

            dht
        })
        .collect::<Vec<_>>();

    // Everyone bootstraps from the first node.
    let (bootstrap, rest) = nodes.split_first().expect("at least two nodes");
    for node in rest {
        bootstrap.add_peer(node.local(), node.transport().listen_addresses());
        node.add_peer(bootstrap.local(), bootstrap.transport().listen_addresses());
    }

    let key = Key::from(cli.key.as_str());
    let value = Bytes::from(cli.value.clone());

    let putter = &nodes[1];
    let getter = &nodes[count - 1];

    println!("\nStoring {:?} under {:?} ...", cli.value, cli.key);

    let start = Instant::now();
    match putter.put_value(key.clone(), value, Duration::from_secs(5)) {
        Ok(stored) => println!(
            "Stored at {} peers in {:?} seconds",
            stored.len(),
            start.elapsed().as_secs_f32()
        ),
        Err(error) => println!("Put failed: {error}"),
    }

    println!("\nLooking up {:?} from another node ...", cli.key);

    let start = Instant::now();
    match getter.lookup_value(&key, Duration::from_secs(5)) {
        Ok(found) => println!(
            "Got {:?} from {} in {:?} seconds",
            String::from_utf8_lossy(&found.value),
            found.from,
            start.elapsed().as_secs_f32()
        ),
        Err(error) => println!("Lookup failed: {error}"),
    }

    let info = getter.info();
    println!(
        "\nRouting table size: {}, known peers: {}",
        info.routing_table_size(),
        info.known_peers()
    );

    for node in &nodes {
        node.shutdown();
    }
}
