use std::path::PathBuf;

use anyhow::Result;
use backhaul_server::Server;
use clap::Parser;
use proto::Config;

#[derive(Parser, Debug)]
#[command(about = "Public SOCKS5 endpoint for a backhaul agent")]
struct Args {
    #[arg(short, long, value_name = "FILE", help = "Configuration file")]
    config: Option<PathBuf>,

    #[arg(short, long, value_name = "HOST", help = "Listen only on this address")]
    addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let path = args.config.unwrap_or_else(Config::default_path);
    let mut config = Config::load(&path)?;
    if let Some(addr) = args.addr {
        config.listen_addr = addr;
    }
    proto::logging::init(config.debug);

    tracing::info!("backhaul server, config {}", path.display());
    let server = Server::bind(config).await?;
    server.run().await?;

    Ok(())
}
