use adapter::sim::{SimConfig, Simulation};
use clap::Parser;
use engine::EngineConfig;
use env_logger::Env;
use log::info;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Drive synthetic sessions through the desync engine", long_about = None)]
struct Args {
    /// Number of simulated connections
    #[arg(short = 'c', long, default_value = "4")]
    connections: usize,

    /// Ticks to simulate
    #[arg(short = 't', long, default_value = "200")]
    ticks: u64,

    /// Protocol version the clients negotiate
    #[arg(short = 'p', long, default_value = "763")]
    protocol: u32,

    /// Predictable objects per connection
    #[arg(short = 'o', long, default_value = "8")]
    objects: usize,

    /// Chance per object per tick of an interaction
    #[arg(long, default_value = "0.05")]
    interaction_rate: f64,

    /// Chance that an interaction is followed by a stale update
    #[arg(long, default_value = "0.3")]
    stale_rate: f64,

    /// Ticks before a client's confirmation reply arrives
    #[arg(long, default_value = "2")]
    reply_delay: u64,

    /// Milliseconds per tick, 0 to run as fast as possible
    #[arg(long, default_value = "0")]
    tick_ms: u64,

    /// Random seed
    #[arg(short = 's', long, default_value = "0")]
    seed: u64,

    /// Bypass the engine to show what goes wrong without it
    #[arg(long)]
    unguarded: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = SimConfig {
        connections: args.connections,
        ticks: args.ticks,
        protocol_version: args.protocol,
        objects_per_connection: args.objects,
        interaction_rate: args.interaction_rate.clamp(0.0, 1.0),
        stale_rate: args.stale_rate.clamp(0.0, 1.0),
        reply_delay: args.reply_delay,
        guard: !args.unguarded,
        seed: args.seed,
        tick_interval: (args.tick_ms > 0).then(|| Duration::from_millis(args.tick_ms)),
    };

    info!(
        "Simulating {} connections on protocol {} for {} ticks ({})",
        config.connections,
        config.protocol_version,
        config.ticks,
        if config.guard { "guarded" } else { "unguarded" }
    );

    let report = Simulation::new(config, EngineConfig::default())?.run().await?;

    info!("Packets: {}", report.packets);
    info!(
        "Interactions: {}, stale updates: {}",
        report.interactions, report.stale_updates
    );
    info!(
        "Replaced: {}, cancelled: {}, resolved: {}, expired: {}",
        report.replaced, report.cancelled, report.resolved, report.expired
    );
    info!(
        "Desynced position-ticks: {}, desynced at end: {}",
        report.desynced_ticks, report.final_desyncs
    );

    Ok(())
}
