use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Failures that abort broker startup.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to bind listening socket on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("broker was already started")]
    AlreadyStarted,
    #[error("failed to build relay runtime")]
    Runtime(#[source] io::Error),
    #[error("failed to spawn {lane} thread")]
    Spawn {
        lane: String,
        #[source]
        source: io::Error,
    },
}
