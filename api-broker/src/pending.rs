//! Transaction status results waiting to be pushed to clients.

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use thiserror::Error;

use crate::identity::ClientId;

pub const DEFAULT_TX_QUEUE_CAPACITY: usize = 50_000;

/// One outcome of a previously submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTxResult {
    pub client_id: ClientId,
    /// Correlation hash the client sent with the original request.
    pub msg_hash: Bytes,
    pub status: u8,
    pub error: Option<String>,
    pub result: Option<Bytes>,
}

impl PendingTxResult {
    pub fn new(client_id: ClientId, msg_hash: Bytes, status: u8) -> Self {
        Self {
            client_id,
            msg_hash,
            status,
            error: None,
            result: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_result(mut self, result: Bytes) -> Self {
        self.result = Some(result);
        self
    }

    /// Placeholder entry with nothing to report; the callback lane skips it.
    pub fn empty(client_id: ClientId) -> Self {
        Self::new(client_id, Bytes::new(), 0)
    }

    pub fn is_empty(&self) -> bool {
        self.msg_hash.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("transaction status queue is full")]
    Full(PendingTxResult),
    #[error("transaction status queue is disconnected")]
    Disconnected(PendingTxResult),
}

/// Bounded multi-producer queue drained by the callback lane.
#[derive(Debug, Clone)]
pub struct TxStatusQueue {
    tx: Sender<PendingTxResult>,
    rx: Receiver<PendingTxResult>,
}

impl TxStatusQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self { tx, rx }
    }

    pub fn push(&self, result: PendingTxResult) -> Result<(), QueueError> {
        self.tx.try_send(result).map_err(|err| match err {
            TrySendError::Full(result) => QueueError::Full(result),
            TrySendError::Disconnected(result) => QueueError::Disconnected(result),
        })
    }

    pub fn receiver(&self) -> Receiver<PendingTxResult> {
        self.rx.clone()
    }
}

impl Default for TxStatusQueue {
    fn default() -> Self {
        Self::new(DEFAULT_TX_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sentinel_is_detected() {
        let client = ClientId::new([0, 0, 0, 0, 1]);
        assert!(PendingTxResult::empty(client).is_empty());
        assert!(!PendingTxResult::new(client, Bytes::from_static(&[1; 32]), 103).is_empty());
    }

    #[test]
    fn bounded_queue_rejects_overflow() {
        let queue = TxStatusQueue::new(1);
        let client = ClientId::new([0, 0, 0, 0, 1]);
        let item = PendingTxResult::new(client, Bytes::from_static(b"h"), 101);

        queue.push(item.clone()).expect("first fits");
        assert!(matches!(queue.push(item.clone()), Err(QueueError::Full(_))));
        assert_eq!(queue.receiver().recv().expect("queued"), item);
        assert!(queue.receiver().is_empty());
    }
}
