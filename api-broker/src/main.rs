use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use api_broker::{
    ApiServer,
    cli::{Cli, Command},
    client,
    demo::DemoHandler,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(config) => {
            let handler = DemoHandler::new(&config).context("building demo handler")?;
            let server = Arc::new(ApiServer::new(config, Arc::new(handler)));
            let addr = server.start()?;
            info!("api broker listening on {}", addr);

            let waiter = {
                let server = Arc::clone(&server);
                tokio::task::spawn_blocking(move || server.wait())
            };
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(err) = result {
                        warn!(error = ?err, "failed to install ctrl-c handler");
                    }
                    let server = Arc::clone(&server);
                    tokio::task::spawn_blocking(move || server.shutdown()).await?;
                }
                result = waiter => {
                    result?;
                    warn!("relay exited on its own");
                }
            }
        }
        Command::Ping(args) => client::ping(args.server).await?,
    }

    Ok(())
}
