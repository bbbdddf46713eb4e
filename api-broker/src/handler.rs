//! The protocol handler seen by the broker.
//!
//! Business logic lives behind [`ApiHandler`]. The broker calls `process` from
//! worker lanes, reads `filters` from the event lane, drains `tx_status_queue`
//! from the callback lane and drives `wait_tx_update` from the tx-wait lane.
//! The relay reports departed connections through `client_disconnected`.

use std::time::Duration;

use thiserror::Error;

use crate::filter::FilterRegistry;
use crate::identity::ClientId;
use crate::pending::TxStatusQueue;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler is shut down")]
    ShutDown,
    #[error("{0}")]
    Internal(String),
}

/// Outcome of one [`ApiHandler::wait_tx_update`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxWait {
    /// An update arrived and was folded into the status queue.
    Updated,
    /// Nothing arrived before the timeout.
    TimedOut,
    /// The handler has no transaction pipeline to wait on.
    Unsupported,
}

pub trait ApiHandler: Send + Sync + 'static {
    /// Turns one request into its response.
    ///
    /// Errors are logged by the worker and no reply is sent.
    fn process(&self, request: &[u8], client: ClientId) -> Result<Vec<u8>, HandlerError>;

    fn filters(&self) -> &FilterRegistry;

    fn tx_status_queue(&self) -> &TxStatusQueue;

    /// Blocks for at most `timeout` waiting for a transaction pipeline update.
    fn wait_tx_update(&self, timeout: Duration) -> TxWait {
        let _ = timeout;
        TxWait::Unsupported
    }

    /// Called by the relay once a connection has gone away, before its
    /// identifier can be handed to another peer. State keyed by `client`
    /// (subscriptions, buffered pushes) must be released here.
    fn client_disconnected(&self, client: ClientId) {
        let _ = client;
    }

    /// Stops accepting new work. Called once, before the broker tears down.
    fn shutdown(&self);
}
