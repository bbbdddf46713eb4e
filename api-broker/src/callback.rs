//! Transaction status callbacks.
//!
//! The callback lane drains the handler's status queue and pushes each
//! result to the client that submitted the transaction. The tx-wait lane
//! feeds that queue by driving the handler's pipeline wait.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, select};
use tracing::{debug, trace, warn};

use crate::handler::{ApiHandler, TxWait};
use crate::pending::PendingTxResult;
use crate::protocol::tx_status_response;
use crate::shutdown::ShutdownSignal;
use crate::socket::ReplySocket;

/// Upper bound on one pipeline wait, so the tx-wait lane sees shutdown promptly.
pub const TX_WAIT_TIMEOUT: Duration = Duration::from_millis(200);

pub fn run_callback(
    queue: Receiver<PendingTxResult>,
    reply: ReplySocket,
    shutdown: ShutdownSignal,
) {
    debug!("callback lane started");

    while !shutdown.is_triggered() {
        let next = select! {
            recv(queue) -> item => Some(item),
            recv(shutdown.closed()) -> _ => None,
        };
        let Some(item) = next else {
            break;
        };
        let Ok(item) = item else {
            warn!("transaction status queue disconnected");
            break;
        };

        if item.is_empty() {
            continue;
        }
        deliver(&item, &reply);
    }

    debug!("callback lane stopped");
}

fn deliver(item: &PendingTxResult, reply: &ReplySocket) {
    let response = tx_status_response(item);
    trace!(
        client = %item.client_id,
        msg_hash = %hex::encode(&item.msg_hash),
        status = item.status,
        response = %hex::encode(&response),
        "callback send"
    );
    if let Err(err) = reply.send(item.client_id, response) {
        warn!(client = %item.client_id, error = %err, "failed to send tx callback");
    }
}

pub fn run_tx_wait(handler: Arc<dyn ApiHandler>, shutdown: ShutdownSignal) {
    debug!("tx-wait lane started");

    while !shutdown.is_triggered() {
        match handler.wait_tx_update(TX_WAIT_TIMEOUT) {
            TxWait::Updated | TxWait::TimedOut => {}
            TxWait::Unsupported => {
                debug!("handler has no transaction pipeline");
                break;
            }
        }
    }

    debug!("tx-wait lane stopped");
}
