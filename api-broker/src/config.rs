use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Args;

use crate::error::BrokerError;
use crate::frame::DEFAULT_MAX_FRAME_LEN;
use crate::pending::DEFAULT_TX_QUEUE_CAPACITY;

pub const DEFAULT_PORT: u16 = 8547;
pub const DEFAULT_SEND_HWM: usize = 100_000;
pub const DEFAULT_EVENT_POLL_MS: u64 = 1000;

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Address the front-end socket binds to.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub ip: IpAddr,

    /// Port the front-end socket binds to. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Messages queued per peer before further pushes to it are dropped.
    #[arg(long, default_value_t = DEFAULT_SEND_HWM)]
    pub send_hwm: usize,

    /// Number of worker lanes running the protocol handler.
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Milliseconds between event lane passes over the filter registry.
    #[arg(long, default_value_t = DEFAULT_EVENT_POLL_MS)]
    pub event_poll_ms: u64,

    /// Largest single frame accepted from or sent to a peer.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_len: usize,

    /// Capacity of the transaction status queue.
    #[arg(long, default_value_t = DEFAULT_TX_QUEUE_CAPACITY)]
    pub tx_queue_capacity: usize,

    /// Threads executing submitted transactions.
    #[arg(long, default_value_t = 1)]
    pub broadcast_threads: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            send_hwm: DEFAULT_SEND_HWM,
            workers: 1,
            event_poll_ms: DEFAULT_EVENT_POLL_MS,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            tx_queue_capacity: DEFAULT_TX_QUEUE_CAPACITY,
            broadcast_threads: 1,
        }
    }
}

impl BrokerConfig {
    /// Loopback config on an ephemeral port.
    pub fn ephemeral() -> Self {
        Self {
            port: 0,
            ..Self::default()
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_ms)
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        let checks = [
            (self.workers == 0, "workers must be at least 1"),
            (self.event_poll_ms == 0, "event poll interval must be positive"),
            (self.send_hwm == 0, "send high-water mark must be positive"),
            (self.max_frame_len == 0, "max frame length must be positive"),
            (self.tx_queue_capacity == 0, "tx queue capacity must be positive"),
            (self.broadcast_threads == 0, "broadcast threads must be at least 1"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(BrokerError::Config((*reason).to_string())),
            None => Ok(()),
        }
    }
}
