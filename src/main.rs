use dns_relay::cli::Cli;
use dns_relay::dns;
use dns_relay::settings::Settings;

use clap::Parser;
use env_logger::Env;

use std::error::Error;
use std::process;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("dns-relay: {}", err);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let settings = Settings::load(cli.config.as_deref())?.with_cli(cli);
    log::debug!("Settings loaded:\n{:?}", settings);

    let handler = settings.handler().await?;
    let server = dns::Server::bind(settings.listen_address, handler, settings.max_in_flight).await?;

    server
        .run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                log::error!("Cannot listen for shutdown signal: {}", err);
                futures::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}
