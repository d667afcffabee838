//! Koord Node
//!
//! - `run` - Election node over UDP with an optional write-ahead-log store
//! - `simulate` - In-process cluster: election, replication, voting, topology
//! - `hub` - WebSocket event hub with the coordination bridge

mod hub;

use clap::{Parser, Subcommand};
use koord_core::store::{recover, spawn_journal_writer, FileStoreConfig, SharedStore};
use koord_core::topology::{TaskSpec, TaskStrategy};
use koord_core::voting::Decision;
use koord_core::{
    CoordConfig, ElectionCore, ElectionNode, FileStore, LocalCluster, NodeHandle,
    ProposalSpec, Strategy, TopologyManager, UdpTransport, VotingEngine,
};
use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "koord-node")]
#[command(about = "Koord consensus and coordination node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an election node over UDP
    Run {
        /// Node identifier
        #[arg(short, long)]
        name: String,

        /// Address to bind
        #[arg(short, long, default_value = "0.0.0.0:9990")]
        bind: SocketAddr,

        /// Peer as `id=host:port`, repeatable
        #[arg(short, long = "peer", value_parser = parse_peer)]
        peers: Vec<(String, SocketAddr)>,

        /// Directory for the write-ahead log
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// Run an in-process cluster scenario
    Simulate {
        /// Number of nodes
        #[arg(short, long, default_value = "5")]
        nodes: usize,

        /// Values to replicate once a leader exists
        #[arg(short, long, default_value = "3")]
        proposals: usize,
    },

    /// Run the WebSocket event hub
    Hub {
        /// Address to listen on
        #[arg(short = 'a', long, default_value = "127.0.0.1:9980")]
        listen: SocketAddr,

        /// Directory for the durable core's write-ahead log
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },
}

fn parse_peer(s: &str) -> Result<(String, SocketAddr), String> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected id=host:port, got {:?}", s))?;
    let addr = addr.parse().map_err(|e| format!("bad address {:?}: {}", addr, e))?;
    Ok((id.to_string(), addr))
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let mut config = match &cli.config {
        Some(path) => CoordConfig::from_json_file(path)?,
        None => CoordConfig::default(),
    };

    match cli.command {
        Commands::Run {
            name,
            bind,
            peers,
            data_dir,
        } => {
            config.node_id = name;
            run_node(config, bind, peers, data_dir).await
        }
        Commands::Simulate { nodes, proposals } => simulate(config, nodes, proposals).await,
        Commands::Hub { listen, data_dir } => hub::run(config, listen, data_dir).await,
    }
}

async fn run_node(
    config: CoordConfig,
    bind: SocketAddr,
    peers: Vec<(String, SocketAddr)>,
    data_dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let name = config.node_id.clone();
    info!("Koord node \"{}\" starting", name);

    let transport = Arc::new(UdpTransport::bind(name.clone(), bind).await?);
    info!("Listening on {}", transport.local_addr()?);
    for (id, addr) in &peers {
        transport.add_peer(id.clone(), *addr);
    }

    let peer_ids = peers.iter().map(|(id, _)| id.clone()).collect();
    let mut core = ElectionCore::new(name.clone(), peer_ids, config.election.clone());
    let mut node_journal = None;
    let mut journal_writer = None;

    if let Some(dir) = data_dir {
        let store: SharedStore = Arc::new(FileStore::open(FileStoreConfig::new(dir))?);
        recover(&mut core, store.as_ref())?;
        let (journal, records) = mpsc::unbounded_channel();
        node_journal = Some(journal);
        journal_writer = Some(spawn_journal_writer(store, records));
    }

    let mut node = ElectionNode::new(core, transport.clone());
    if let Some(journal) = node_journal {
        node = node.with_journal(journal);
    }
    let (handle, task) = node.spawn();
    let receiver = transport.start_receive(handle.mailbox());

    let (command_tx, mut command_rx) = mpsc::channel::<String>(16);
    std::thread::spawn(move || {
        println!("\nCommands:");
        println!("  propose <key> <json>  - Replicate a value through the leader");
        println!("  status                - Show node status");
        println!("  quit                  - Exit\n");

        let stdin = io::stdin();
        for line in stdin.lock().lines().map_while(Result::ok) {
            if command_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            Some(line) = command_rx.recv() => {
                if !handle_command(&handle, line.trim()).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    handle.shutdown();
    let _ = task.await;
    receiver.abort();
    if let Some(writer) = journal_writer {
        let _ = writer.await;
    }
    info!("Node \"{}\" stopped", name);
    Ok(())
}

/// Returns false when the node should stop
async fn handle_command(handle: &NodeHandle, line: &str) -> bool {
    let parts: Vec<&str> = line.splitn(3, ' ').collect();
    match parts.as_slice() {
        ["propose", key, value] => {
            let value = serde_json::from_str(value)
                .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
            match handle.submit(*key, value).await {
                Ok(entry) => println!("Appended at index {} (term {})", entry.index, entry.term),
                Err(e) => println!("Rejected: {}", e),
            }
        }
        ["status"] => match handle.status().await {
            Ok(status) => match serde_json::to_string_pretty(&status) {
                Ok(json) => println!("{}", json),
                Err(e) => println!("Status unavailable: {}", e),
            },
            Err(e) => println!("Status unavailable: {}", e),
        },
        ["quit"] | ["exit"] => return false,
        [""] => {}
        _ => println!("Unknown command. Try: propose <key> <json>"),
    }
    true
}

async fn simulate(
    config: CoordConfig,
    nodes: usize,
    proposals: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Simulating {} nodes", nodes);
    let cluster = LocalCluster::start(nodes, config.election.clone());

    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await?;
    info!("Leader {} elected for term {}", leader.node_id, leader.term);

    for i in 0..proposals {
        let entry = cluster
            .submit(format!("key-{}", i), serde_json::json!(i))
            .await?;
        info!("Replicated key-{} at index {}", i, entry.index);
    }
    tokio::time::sleep(config.election.heartbeat_interval() * 4).await;
    cluster.sync_directory().await;

    let voting = VotingEngine::new(cluster.directory(), config.voting.clone());
    let proposal = voting.create_proposal(
        ProposalSpec::new("simulation", serde_json::json!({"action": "rollout"}), Strategy::SimpleMajority)
            .with_proposer(leader.node_id.clone()),
    )?;
    for (i, id) in cluster.ids().iter().enumerate() {
        let decision = if i % 3 == 2 {
            Decision::Reject
        } else {
            Decision::Approve
        };
        voting.submit_vote(&proposal.id, id, decision, None)?;
    }
    let resolved = voting.check_consensus(&proposal.id)?;
    info!("Proposal {} resolved as {:?}", proposal.id, resolved);

    let topology = TopologyManager::new(cluster.directory(), config.topology.clone());
    let task = topology.submit_task(TaskSpec::new("rollout", TaskStrategy::Consensus));
    info!(
        "Task {} planned on {} starting at {:?}",
        task.spec.name,
        task.plan.topology,
        task.plan.first_node()
    );

    let statuses = cluster.statuses().await;
    println!("{}", serde_json::to_string_pretty(&statuses)?);
    println!("{}", serde_json::to_string_pretty(&task.plan)?);

    cluster.shutdown().await;
    Ok(())
}
