use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::config::{BrokerConfig, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the API broker with the demo handler.
    Serve(BrokerConfig),
    /// Send a heartbeat and an echo request to a running broker.
    Ping(PingArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PingArgs {
    /// Address of the broker to probe.
    #[arg(long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))]
    pub server: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "api-broker",
            "serve",
            "--port",
            "0",
            "--workers",
            "4",
            "--event-poll-ms",
            "50",
        ])
        .expect("parse");
        let Command::Serve(config) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(config.port, 0);
        assert_eq!(config.workers, 4);
        assert_eq!(config.event_poll_ms, 50);
        assert_eq!(config.send_hwm, BrokerConfig::default().send_hwm);
    }

    #[test]
    fn ping_defaults_to_local_broker() {
        let cli = Cli::try_parse_from(["api-broker", "ping"]).expect("parse");
        let Command::Ping(args) = cli.command else {
            panic!("expected ping");
        };
        assert_eq!(args.server, "127.0.0.1:8547".parse().unwrap());
    }
}
