//! Worker lanes: the synchronous request/response path.
//!
//! Every worker blocks on the shared worker inbound channel, hands the request
//! to the protocol handler and sends the response back to the same client. A
//! failing or panicking handler call costs that request its reply and nothing
//! more; the worker keeps going until its lane closes or shutdown is raised.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use crate::handler::ApiHandler;
use crate::identity::ClientId;
use crate::shutdown::ShutdownSignal;
use crate::socket::{LaneEndpoint, Received};

pub fn run_worker(
    index: usize,
    handler: Arc<dyn ApiHandler>,
    endpoint: LaneEndpoint,
    shutdown: ShutdownSignal,
) {
    debug!(worker = index, "worker lane started");

    while !shutdown.is_triggered() {
        let (client, request) = match endpoint.recv() {
            Received::Request(client, request) => (client, request),
            Received::Malformed => continue,
            Received::Closed => break,
        };
        trace!(worker = index, %client, request = %hex::encode(&request), "worker request");

        let Some(response) = call_handler(handler.as_ref(), &request, client) else {
            continue;
        };
        trace!(worker = index, %client, response = %hex::encode(&response), "worker response");

        if let Err(err) = endpoint.reply.send(client, Bytes::from(response)) {
            warn!(worker = index, %client, error = %err, "failed to send worker reply");
        }
    }

    debug!(worker = index, "worker lane stopped");
}

fn call_handler(handler: &dyn ApiHandler, request: &[u8], client: ClientId) -> Option<Vec<u8>> {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.process(request, client))) {
        Ok(Ok(response)) => Some(response),
        Ok(Err(err)) => {
            error!(%client, error = %err, "handler failed; no reply sent");
            None
        }
        Err(_) => {
            error!(%client, "handler panicked; no reply sent");
            None
        }
    }
}
