//! Internal lane sockets.
//!
//! Each dispatch lane (worker, callback, event, heartbeat) is connected to the
//! relay by a channel pair. The relay keeps the [`LaneSocket`] half: it feeds
//! inbound requests to the lane and drains the lane's replies. The lane keeps
//! the [`LaneEndpoint`] half. When the relay drops its half, blocked lane
//! receives return an error and the lane exits.

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::error;

use crate::frame::{Multipart, addressed, split_addressed};
use crate::identity::ClientId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{0} lane is closed")]
pub struct LaneClosed(pub &'static str);

/// Relay-side half of a lane.
pub(crate) struct LaneSocket {
    pub(crate) name: &'static str,
    pub(crate) inbound: Sender<Multipart>,
    pub(crate) outbound: mpsc::UnboundedReceiver<Multipart>,
}

/// Lane-side half: requests arrive on `inbound`, replies leave through `reply`.
///
/// Clones share the same inbound queue, so cloned endpoints compete for work.
#[derive(Clone)]
pub struct LaneEndpoint {
    pub inbound: Receiver<Multipart>,
    pub reply: ReplySocket,
}

/// One blocking receive on a lane.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    Request(ClientId, Bytes),
    /// The message was logged and discarded; keep receiving.
    Malformed,
    /// The relay half is gone; the lane should exit.
    Closed,
}

impl LaneEndpoint {
    /// Blocks for the next `[identifier, payload]` message.
    pub fn recv(&self) -> Received {
        let Ok(message) = self.inbound.recv() else {
            return Received::Closed;
        };
        let identity = message.first().cloned();
        match split_addressed(message) {
            Ok((client, payload)) => Received::Request(client, payload),
            Err(err) => {
                let identity = identity.as_deref().map(hex::encode).unwrap_or_default();
                error!(
                    lane = self.reply.lane(),
                    identity = %identity,
                    error = %err,
                    "incorrect client identifier"
                );
                Received::Malformed
            }
        }
    }
}

/// Sends addressed replies from a lane back to the relay.
#[derive(Debug, Clone)]
pub struct ReplySocket {
    lane: &'static str,
    tx: mpsc::UnboundedSender<Multipart>,
}

impl ReplySocket {
    pub fn new(lane: &'static str, tx: mpsc::UnboundedSender<Multipart>) -> Self {
        Self { lane, tx }
    }

    pub fn lane(&self) -> &'static str {
        self.lane
    }

    /// Queues `[client, payload]` for the relay.
    pub fn send(&self, client: ClientId, payload: Bytes) -> Result<(), LaneClosed> {
        self.tx
            .send(addressed(client, payload))
            .map_err(|_| LaneClosed(self.lane))
    }
}

pub(crate) fn lane_pair(name: &'static str) -> (LaneSocket, LaneEndpoint) {
    let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    (
        LaneSocket {
            name,
            inbound: inbound_tx,
            outbound: outbound_rx,
        },
        LaneEndpoint {
            inbound: inbound_rx,
            reply: ReplySocket::new(name, outbound_tx),
        },
    )
}
