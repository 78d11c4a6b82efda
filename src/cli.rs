use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Default)]
#[command(name = "dns-relay")]
#[command(about = "Answers DNS queries locally or relays them question by question", long_about = None)]
pub struct Cli {
    /// Upstream DNS resolver to forward to, e.g. 8.8.8.8:53
    #[arg(long)]
    pub resolver: Option<String>,

    /// Address to listen on for DNS queries
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Additional configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}
