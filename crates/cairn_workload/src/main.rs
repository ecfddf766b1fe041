//! Workload generator for exercising a cairn node over the command
//! protocol.
//!
//! Issues a mix of `Set` and `Get` commands from concurrent clients and
//! reports latency percentiles and error counts.

use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use cairn_server::message::Message;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "cairn-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Command endpoint of the target node.
    #[arg(long)]
    target: SocketAddr,

    /// Number of concurrent clients (one TCP connection each).
    #[arg(long, default_value_t = 8)]
    clients: usize,

    /// Operations issued per client.
    #[arg(long, default_value_t = 1000)]
    ops: usize,

    /// Number of hot keys used by the workload.
    #[arg(long, default_value_t = 16)]
    keys: usize,

    /// Percent of operations that are Set (the rest are Get).
    #[arg(long, default_value_t = 50)]
    set_pct: u8,

    /// Random seed (0 picks one from the clock).
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[derive(Default)]
struct ClientStats {
    latencies_us: Vec<u64>,
    ok: usize,
    not_found: usize,
    errors: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args),
    }
}

fn run(args: RunArgs) -> anyhow::Result<()> {
    let seed = if args.seed == 0 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };
    tracing::info!(target = %args.target, clients = args.clients, ops = args.ops, seed, "starting workload");

    let start = Instant::now();
    let mut handles = Vec::with_capacity(args.clients);
    for client in 0..args.clients {
        let args = args.clone();
        handles.push(thread::spawn(move || client_main(client, seed, &args)));
    }

    let mut merged = ClientStats::default();
    for handle in handles {
        let stats = handle
            .join()
            .map_err(|_| anyhow::anyhow!("client thread panicked"))??;
        merged.latencies_us.extend(stats.latencies_us);
        merged.ok += stats.ok;
        merged.not_found += stats.not_found;
        merged.errors += stats.errors;
    }
    let elapsed = start.elapsed();

    merged.latencies_us.sort_unstable();
    let total = merged.latencies_us.len();
    let pct = |p: f64| -> u64 {
        if total == 0 {
            return 0;
        }
        let idx = ((total as f64) * p).min(total as f64 - 1.0) as usize;
        merged.latencies_us[idx]
    };
    let throughput = if elapsed.as_secs_f64() > 0.0 {
        total as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };

    println!(
        "ops={} ok={} not_found={} errors={} elapsed={:.2}s ops_per_sec={:.0}",
        total,
        merged.ok,
        merged.not_found,
        merged.errors,
        elapsed.as_secs_f64(),
        throughput,
    );
    println!(
        "latency_us p50={} p95={} p99={} max={}",
        pct(0.50),
        pct(0.95),
        pct(0.99),
        merged.latencies_us.last().copied().unwrap_or(0),
    );

    anyhow::ensure!(merged.errors == 0, "{} operations failed", merged.errors);
    Ok(())
}

fn client_main(client: usize, seed: u64, args: &RunArgs) -> anyhow::Result<ClientStats> {
    let stream = TcpStream::connect_timeout(&args.target, Duration::from_secs(5))
        .with_context(|| format!("client {client} connect"))?;
    stream.set_read_timeout(Some(Duration::from_secs(30)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;
    let mut writer = stream.try_clone().context("clone stream")?;
    let mut reader = BufReader::new(stream);

    let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(client as u64));
    let mut stats = ClientStats {
        latencies_us: Vec::with_capacity(args.ops),
        ..ClientStats::default()
    };

    for op in 0..args.ops {
        let key = format!("wl_k{}", rng.gen_range(0..args.keys.max(1)));
        let request = if rng.gen_range(0..100u8) < args.set_pct {
            let mut msg = Message::new("Set");
            msg.set("key", key).set("value", format!("c{client}-o{op}"));
            msg
        } else {
            let mut msg = Message::new("Get");
            msg.set("key", key);
            msg
        };

        let started = Instant::now();
        writer.write_all(&request.to_bytes()).context("send op")?;
        let response = Message::read_from(&mut reader)
            .context("read op response")?
            .context("node closed the connection without responding")?;
        stats
            .latencies_us
            .push(started.elapsed().as_micros().min(u128::from(u64::MAX)) as u64);

        match response.code() {
            200 => stats.ok += 1,
            404 => stats.not_found += 1,
            code => {
                tracing::warn!(code, status = %response.method_line, "operation failed");
                stats.errors += 1;
            }
        }
    }
    Ok(stats)
}
