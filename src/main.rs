use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use chronos_raft::config::{parse_peers, Config};
use chronos_raft::network::{RaftServer, TcpTransport};
use chronos_raft::raft::{CommitEntry, Raft};
use chronos_raft::storage::FileStorage;

#[derive(Parser)]
#[command(name = "chronos-raft")]
#[command(about = "A Raft consensus node built from scratch in Rust")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a node in a cluster. Each line read from stdin is submitted as a command.
    Node {
        /// Unique ID for this node
        #[arg(short, long)]
        id: Option<u64>,

        /// Address to listen on for peer RPCs
        #[arg(short, long)]
        address: Option<String>,

        /// Comma-separated list of peers (id=address)
        #[arg(short, long)]
        peers: Option<String>,

        /// Directory to store data
        #[arg(short, long)]
        data_dir: Option<String>,

        /// Clean this node's data directory before starting
        #[arg(long)]
        clean: bool,

        /// JSON config file; command line flags override its values
        #[arg(short, long)]
        config: Option<String>,
    },
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn build_config(
    id: Option<u64>,
    address: Option<String>,
    peers: Option<String>,
    data_dir: Option<String>,
    config: Option<String>,
) -> anyhow::Result<Config> {
    let mut cfg = match config {
        Some(path) => {
            Config::load(&path).with_context(|| format!("loading config from {path}"))?
        }
        None => {
            let (Some(id), Some(address)) = (id, address.clone()) else {
                bail!("--id and --address are required without --config");
            };
            Config {
                node_id: id,
                address,
                ..Config::default()
            }
        }
    };

    if let Some(id) = id {
        cfg.node_id = id;
    }
    if let Some(address) = address {
        cfg.address = address;
    }
    if let Some(data_dir) = data_dir {
        cfg.data_dir = data_dir;
    }
    if let Some(peers) = peers {
        cfg.peers = parse_peers(&peers)?;
    }
    Ok(cfg)
}

async fn log_commits(id: u64, mut commits: mpsc::UnboundedReceiver<CommitEntry>) {
    while let Some(entry) = commits.recv().await {
        info!(
            "[{}] committed index={} term={} command={:?}",
            id,
            entry.index,
            entry.term,
            String::from_utf8_lossy(&entry.command)
        );
    }
}

async fn run_node(cfg: Config, clean: bool) -> anyhow::Result<()> {
    info!("Starting chronos-raft node {} at {}", cfg.node_id, cfg.address);

    let node_dir = cfg.node_dir();
    if clean && Path::new(&node_dir).exists() {
        info!("--clean flag detected, removing data directory: {node_dir}");
        std::fs::remove_dir_all(&node_dir)?;
    }

    let raft_config = cfg.into_raft_config()?;
    for (peer, address) in cfg.peer_addresses() {
        info!("Added peer: {peer} at {address}");
    }

    let storage = Arc::new(FileStorage::new(&node_dir)?);
    let transport = Arc::new(TcpTransport::new(cfg.peer_addresses()));
    let (commit_tx, commit_rx) = mpsc::unbounded_channel();
    let raft = Raft::new(raft_config, storage, transport, commit_tx)?;

    let server = RaftServer::bind(&cfg.address, raft.clone()).await?;
    let shutdown = server.shutdown_handle();
    let server_task = tokio::spawn(server.serve());
    let commit_task = tokio::spawn(log_commits(cfg.node_id, commit_rx));

    raft.start().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping node");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("stdin closed, stopping node");
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if raft.submit(line.as_bytes().to_vec()).await {
                    println!("accepted: {line}");
                } else {
                    let (_, term, _) = raft.report().await;
                    println!("rejected (not leader, term {term}): {line}");
                }
            }
        }
    }

    raft.stop().await;
    shutdown.notify_one();
    if let Err(e) = server_task.await? {
        warn!("server exited with error: {e}");
    }
    commit_task.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    // Parse command line arguments
    let cli = Cli::parse();

    match cli.command {
        Command::Node {
            id,
            address,
            peers,
            data_dir,
            clean,
            config,
        } => {
            let cfg = build_config(id, address, peers, data_dir, config)?;
            run_node(cfg, clean).await?;
        }
    }

    Ok(())
}
