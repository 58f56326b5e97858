use std::path::PathBuf;

use anyhow::Result;
use backhaul_agent::Agent;
use clap::Parser;
use proto::Config;

#[derive(Parser, Debug)]
#[command(about = "Dial-out agent that gives a backhaul server its egress")]
struct Args {
    #[arg(short, long, value_name = "FILE", help = "Configuration file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let path = args.config.unwrap_or_else(Config::default_path);
    let config = Config::load(&path)?;
    proto::logging::init(config.debug);

    tracing::info!("backhaul agent, server {}", config.server_addr);
    let agent = Agent::new(config)?;

    tokio::select! {
        res = agent.run() => res?,
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted, exiting"),
    }
    Ok(())
}
