//! Entry point for `udp-traffic`.
//!
//! Parses CLI arguments, wires up logging and signal handling, and hands the
//! rest to [`udp_traffic::TrafficEngine`].  All engine logic lives in the
//! library; `main.rs` owns only process setup.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use udp_traffic::{EngineConfig, TrafficEngine};

/// UDP load generator with drop/latency measurement.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Destination to send probes to (e.g. 10.1.2.10:14589).
    #[arg(short, long)]
    dest: SocketAddr,

    /// Packets per second.
    #[arg(short, long)]
    rate: u32,

    /// First source port of the rotation (inclusive).
    #[arg(long, default_value_t = 20_000)]
    port_start: u16,

    /// End of the source-port rotation (exclusive).
    #[arg(long, default_value_t = 40_000)]
    port_stop: u16,

    /// Job identifier reported with every stat record.
    #[arg(short, long, default_value = "udp-traffic")]
    app_id: String,

    /// Controller endpoint receiving stat batches.
    #[arg(
        short,
        long,
        default_value = "http://127.0.0.1:8000/api/v1/UDPTrafficStat/"
    )]
    controller: String,

    /// Seconds a bucket waits for late replies before being judged.
    #[arg(long, default_value_t = 2)]
    grace: u32,

    /// Seconds between stat deliveries to the controller.
    #[arg(long, default_value_t = 5)]
    report_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let mut config = EngineConfig::new(cli.dest, cli.rate, cli.app_id, cli.controller);
    config.port_range_start = cli.port_start;
    config.port_range_stop = cli.port_stop;
    config.grace_secs = cli.grace;
    config.report_interval = Duration::from_secs(cli.report_interval);

    let mut engine = TrafficEngine::new(config);
    let handle = engine.handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupt received; stopping traffic");
            handle.stop().await;
        }
    });

    engine.start().await.context("traffic engine run failed")?;
    Ok(())
}
