// Cairn node binary entry point.
//
// Wires together the datastore, command queue, worker pool, cluster role
// monitor, and the TCP listener, and hosts the CLI and runtime
// configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use cairn_server::blacklist::CommandBlacklist;
use cairn_server::cluster::{parse_members, ClusterMonitor, Peer, RoleState};
use cairn_server::command::DEFAULT_TIMEOUT_MS;
use cairn_server::core::CommandCore;
use cairn_server::crash;
use cairn_server::queue::CommandQueue;
use cairn_server::server::{self, ServerContext};
use cairn_server::storage::{Datastore, FjallStore};
use cairn_server::worker::{WorkerContext, WorkerPool};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "cairn-server")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Serve(ServeArgs),
}

/// CLI options for running a node.
#[derive(Parser, Debug)]
struct ServeArgs {
    #[arg(long)]
    node_id: u64,

    /// Address of the command listener.
    #[arg(long)]
    listen: SocketAddr,

    /// Comma-separated `id@addr` list of every cluster member, this node
    /// included, e.g. `1@127.0.0.1:9501,2@127.0.0.1:9502`.
    #[arg(long, default_value = "")]
    peers: String,

    #[arg(long)]
    data_dir: PathBuf,

    /// Worker threads pulling from the command queue.
    #[arg(long, env = "CAIRN_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Command timeout applied when a request has no `timeout` header, in
    /// milliseconds.
    #[arg(long, env = "CAIRN_DEFAULT_TIMEOUT_MS", default_value_t = DEFAULT_TIMEOUT_MS)]
    default_timeout_ms: u64,

    /// Enable the fault-injection commands (`dieinpeek`, `dieinprocess`).
    #[arg(long, env = "CAIRN_TEST_COMMANDS")]
    test_commands: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Serve(args) => run_node(args).await,
    }
}

/// Initialize storage, cluster monitoring, workers, and the listener.
async fn run_node(args: ServeArgs) -> anyhow::Result<()> {
    let members = parse_members(&args.peers).context("parse --peers")?;
    let peers: Vec<Peer> = members
        .into_iter()
        .filter(|m| m.node_id != args.node_id)
        .collect();

    // Fatal-signal handlers need the peer list before any handler can run.
    crash::install(peers.iter().map(|p| p.addr).collect());

    if args.test_commands {
        tracing::warn!("fault-injection commands are enabled");
    }

    let store: Arc<dyn Datastore> = Arc::new(
        FjallStore::open(args.data_dir.join("storage")).context("open datastore")?,
    );
    let queue = Arc::new(CommandQueue::new());
    let blacklist = Arc::new(CommandBlacklist::new());
    let in_flight = Arc::new(AtomicI64::new(0));
    let role = Arc::new(RoleState::new(args.node_id, peers));
    let terminating = Arc::new(AtomicBool::new(false));

    let core = Arc::new(CommandCore::new(
        args.node_id,
        store.clone(),
        blacklist.clone(),
        queue.clone(),
        role.clone(),
        in_flight.clone(),
        args.test_commands,
    ));

    let monitor = ClusterMonitor::new(
        role.clone(),
        core.clone(),
        queue.clone(),
        terminating.clone(),
    )
    .spawn()?;

    let pool = WorkerPool::start(
        args.workers,
        Arc::new(WorkerContext {
            node_id: args.node_id,
            queue: queue.clone(),
            core,
            role: role.clone(),
            store,
            blacklist: blacklist.clone(),
            in_flight,
            terminating: terminating.clone(),
        }),
    )?;

    let server_ctx = Arc::new(ServerContext::new(
        args.node_id,
        queue,
        blacklist,
        role,
        args.default_timeout_ms,
    ));

    let result = tokio::select! {
        res = server::run(args.listen, server_ctx) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            Ok(())
        }
    };

    terminating.store(true, Ordering::SeqCst);
    pool.shutdown();
    let _ = monitor.join();
    result
}
