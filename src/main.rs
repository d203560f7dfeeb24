use clap::Parser;
use color_eyre::Result;
use std::time::Duration;
use tessera::cluster::PeerData;
use tessera::config::ConsensusConfig;
use tessera::crypto::KeyPair;
use tessera::genesis::GenesisAllocation;
use tessera::network::SharedConsensusNetwork;
use tessera::node::ConsensusNode;
use tessera::types::PeerId;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "DAG checkpoint consensus node")]
struct Args {
    /// Number of nodes in the in-process demo cluster
    #[clap(long, value_name = "INT", default_value = "3")]
    cluster_size: u32,
    /// Cap on transactions pulled per round
    #[clap(long, value_name = "INT", default_value = "50")]
    max_transaction_threshold: u32,
    /// Whole-round timeout in seconds
    #[clap(long, value_name = "SECS", default_value = "45")]
    round_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    fmt().with_env_filter(filter).init();

    let args = Args::parse();
    if args.cluster_size < 2 {
        color_eyre::eyre::bail!("cluster needs at least two nodes for a round");
    }

    let config = ConsensusConfig {
        max_transaction_threshold: args.max_transaction_threshold,
        form_checkpoint_blocks_timeout: Duration::from_secs(args.round_timeout_secs),
        ..ConsensusConfig::default()
    };

    info!(cluster = args.cluster_size, "starting in-process cluster");

    let network = SharedConsensusNetwork::new();
    let keypairs: Vec<KeyPair> = (0..args.cluster_size).map(|_| KeyPair::generate()).collect();

    let mut nodes = Vec::new();
    let mut handles = Vec::new();
    for peer_id in 0..args.cluster_size {
        let (node, services) = ConsensusNode::in_memory(
            peer_id as PeerId,
            keypairs[peer_id as usize].clone(),
            config.clone(),
            network.clone(),
        );
        nodes.push(node);
        handles.push(services);
    }

    // Every node knows every other node as a ready-and-full peer.
    for (i, services) in handles.iter().enumerate() {
        for peer_id in 0..args.cluster_size {
            if peer_id as usize == i {
                continue;
            }
            services.cluster.add_peer(
                PeerData {
                    id: peer_id as PeerId,
                    alias: format!("node-{}", peer_id),
                    public_key: keypairs[peer_id as usize].verifying_key,
                },
                true,
            );
        }
    }

    let allocations = vec![
        GenesisAllocation {
            address: "alice".into(),
            balance: 1000,
        },
        GenesisAllocation {
            address: "bob".into(),
            balance: 500,
        },
    ];
    for node in &nodes {
        node.install_genesis(&allocations).await?;
    }

    let mut pumps = Vec::new();
    for node in &nodes {
        let incoming = network.register(node.peer_id);
        pumps.push(node.start(incoming));
    }

    // Submit a few transactions on the first node's chain and run a round.
    let alice = KeyPair::generate();
    for n in 0..5u64 {
        let tx = nodes[0].create_transaction("alice".into(), "bob".into(), 10 + n, &alice);
        handles[0].transactions.put_pending(tx);
    }

    let round_id = nodes[0].start_round().await?;
    info!(round = %round_id, "round started");

    tokio::time::sleep(Duration::from_secs(2)).await;

    for (i, services) in handles.iter().enumerate() {
        info!(
            node = i,
            accepted = services.checkpoints.accepted_hashes().len(),
            "checkpoint store state"
        );
    }
    println!("{}", nodes[0].metrics.gather());

    info!("cluster running, press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;
    for node in &nodes {
        node.shutdown().await;
    }
    Ok(())
}
