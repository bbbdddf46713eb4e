//! Event lane: periodic subscription polling.
//!
//! Each pass walks a snapshot of the filter registry, drains every
//! contract-event filter and sends one batched callback per filter that had
//! anything buffered. Filters installed mid-pass are picked up next pass.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::filter::{FilterKind, FilterRegistry};
use crate::handler::ApiHandler;
use crate::protocol::event_callback_response;
use crate::shutdown::ShutdownSignal;
use crate::socket::ReplySocket;

pub fn run_event_lane(
    handler: Arc<dyn ApiHandler>,
    reply: ReplySocket,
    interval: Duration,
    shutdown: ShutdownSignal,
) {
    debug!(interval_ms = interval.as_millis() as u64, "event lane started");

    while !shutdown.is_triggered() {
        let sent = dispatch_pending_events(handler.filters(), &reply);
        if sent > 0 {
            trace!(batches = sent, "event pass");
        }
        if shutdown.wait_timeout(interval) {
            break;
        }
    }

    debug!("event lane stopped");
}

/// Runs one pass over the registry. Returns the number of batches sent.
pub fn dispatch_pending_events(filters: &FilterRegistry, reply: &ReplySocket) -> usize {
    let mut sent = 0;
    if filters.is_empty() {
        return sent;
    }

    for filter in filters.snapshot() {
        if filter.kind() != FilterKind::ContractEvent {
            continue;
        }
        let dropped = filter.take_dropped();
        if dropped > 0 {
            warn!(filter = filter.id(), dropped, "filter buffer overflowed; events lost");
        }
        let events = filter.poll();
        if events.is_empty() {
            continue;
        }

        let client = filter.client_id();
        let response = match event_callback_response(&events) {
            Ok(response) => response,
            Err(err) => {
                warn!(filter = filter.id(), %client, error = %err, "dropping event batch");
                continue;
            }
        };
        trace!(filter = filter.id(), %client, events = events.len(), "event batch");

        match reply.send(client, response) {
            Ok(()) => sent += 1,
            Err(err) => warn!(filter = filter.id(), %client, error = %err, "failed to send event batch"),
        }
    }

    sent
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::filter::{ContractEvent, Filter};
    use crate::protocol::{Response, code, decode_event_batch};

    fn event(block_number: u64) -> ContractEvent {
        ContractEvent {
            address: vec![0xAB; 20],
            topics: vec![vec![0x01; 32]],
            data: block_number.to_be_bytes().to_vec(),
            block_number,
            tx_hash: vec![0xCD; 32],
        }
    }

    #[test]
    fn batches_all_pending_events_once() {
        let registry = FilterRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reply = ReplySocket::new("event", tx);

        let filter = Filter::new(0xAA, FilterKind::ContractEvent);
        for block in 1..=3 {
            assert!(filter.push(event(block)));
        }
        registry.install(filter);
        registry.install(Filter::new(0xBB, FilterKind::ContractEvent));

        assert_eq!(dispatch_pending_events(&registry, &reply), 1);
        let message = rx.try_recv().expect("one batch");
        assert_eq!(message[0].as_ref(), &[0, 0, 0, 0, 0xAA]);

        let response = Response::decode(&message[1]).expect("decode");
        assert_eq!(response.code, code::EVENT_CALLBACK);
        let events = decode_event_batch(&response.body).expect("events");
        assert_eq!(events, vec![event(1), event(2), event(3)]);

        assert_eq!(dispatch_pending_events(&registry, &reply), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn skips_other_filter_kinds() {
        let registry = FilterRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reply = ReplySocket::new("event", tx);

        let blocks = Filter::new(7, FilterKind::Block);
        blocks.push(event(1));
        registry.install(blocks);

        assert_eq!(dispatch_pending_events(&registry, &reply), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.get(7).map(|f| f.pending_len()), Some(1));
    }
}
