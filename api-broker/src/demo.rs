//! Reference protocol handler served by the binary.
//!
//! Three services are wired up:
//!
//! - echo: the response body is the request body.
//! - events: subscribe (action 0), unsubscribe (1) and emit (2). A subscription
//!   is keyed by the connection that created it, so the event lane pushes
//!   matching events back to that connection. It ends with the connection.
//! - tx: submit (action 0) answers "received" at once and runs the transaction
//!   on the broadcaster. The tx-wait lane later collects the execution result
//!   and queues a pending-with-result callback for the submitting connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::broadcaster::{BroadcastError, TxBroadcaster};
use crate::config::BrokerConfig;
use crate::filter::{ContractEvent, EventMatch, Filter, FilterKind, FilterRegistry};
use crate::handler::{ApiHandler, HandlerError, TxWait};
use crate::identity::ClientId;
use crate::pending::{PendingTxResult, TxStatusQueue};
use crate::protocol::{RequestHeader, Response, code, service};

pub mod action {
    pub const SUBSCRIBE: u8 = 0;
    pub const UNSUBSCRIBE: u8 = 1;
    pub const EMIT: u8 = 2;
    pub const SUBMIT: u8 = 0;
}

pub struct DemoHandler {
    filters: FilterRegistry,
    tx_queue: TxStatusQueue,
    broadcaster: TxBroadcaster,
    executions: Sender<Receiver<PendingTxResult>>,
    completed: Receiver<Receiver<PendingTxResult>>,
    /// Oldest execution whose result has not arrived yet.
    in_flight: Mutex<Option<Receiver<PendingTxResult>>>,
    running: AtomicBool,
}

impl DemoHandler {
    pub fn new(config: &BrokerConfig) -> Result<Self, BroadcastError> {
        let (executions, completed) = crossbeam_channel::unbounded();
        let broadcaster = TxBroadcaster::new(config.broadcast_threads)?;
        debug!(threads = broadcaster.threads(), "tx broadcaster ready");
        Ok(Self {
            filters: FilterRegistry::new(),
            tx_queue: TxStatusQueue::new(config.tx_queue_capacity),
            broadcaster,
            executions,
            completed,
            in_flight: Mutex::new(None),
            running: AtomicBool::new(true),
        })
    }

    fn echo(&self, body: Bytes) -> Response {
        Response::new(code::SUCCESS).with_body(body)
    }

    fn events(&self, op: u8, body: &[u8], client: ClientId) -> Response {
        let id = client.subscription_id();
        match op {
            action::SUBSCRIBE => {
                let criteria = if body.is_empty() {
                    EventMatch::default()
                } else {
                    match bincode::deserialize::<EventMatch>(body) {
                        Ok(criteria) => criteria,
                        Err(err) => {
                            return Response::new(code::BAD_REQUEST)
                                .with_error(format!("invalid event filter: {err}"));
                        }
                    }
                };
                let replaced = self
                    .filters
                    .install(Filter::with_criteria(id, FilterKind::ContractEvent, criteria))
                    .is_some();
                debug!(%client, filter = id, replaced, "event filter installed");
                Response::new(code::SUCCESS).with_body(Bytes::copy_from_slice(&id.to_be_bytes()))
            }
            action::UNSUBSCRIBE => match self.filters.remove(id) {
                Some(_) => Response::new(code::SUCCESS),
                None => Response::new(code::BAD_REQUEST).with_error("no active subscription"),
            },
            action::EMIT => match bincode::deserialize::<ContractEvent>(body) {
                Ok(event) => {
                    let delivered = self.filters.publish(&event) as u32;
                    Response::new(code::SUCCESS)
                        .with_body(Bytes::copy_from_slice(&delivered.to_be_bytes()))
                }
                Err(err) => Response::new(code::BAD_REQUEST)
                    .with_error(format!("invalid contract event: {err}")),
            },
            _ => Response::new(code::UNSUPPORTED),
        }
    }

    fn transactions(
        &self,
        op: u8,
        hash: Option<Bytes>,
        body: Bytes,
        client: ClientId,
    ) -> Response {
        if op != action::SUBMIT {
            return Response::new(code::UNSUPPORTED);
        }
        let Some(hash) = hash else {
            return Response::new(code::BAD_REQUEST).with_error("missing transaction hash");
        };

        let msg_hash = hash.clone();
        let submitted = self.broadcaster.submit(move || {
            let result: Bytes = body.iter().rev().copied().collect();
            PendingTxResult::new(client, msg_hash, code::TX_PENDING).with_result(result)
        });
        match submitted {
            Ok(execution) => {
                let _ = self.executions.send(execution);
                Response::new(code::TX_RECEIVED).with_hash(hash)
            }
            Err(err) => Response::new(code::TX_DROPPED)
                .with_hash(hash)
                .with_error(err.to_string()),
        }
    }
}

impl ApiHandler for DemoHandler {
    fn process(&self, request: &[u8], client: ClientId) -> Result<Vec<u8>, HandlerError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(HandlerError::ShutDown);
        }

        let request = Bytes::copy_from_slice(request);
        let (header, body) = match RequestHeader::parse(&request) {
            Ok(parsed) => parsed,
            Err(err) => {
                return Ok(Response::new(code::BAD_REQUEST)
                    .with_error(err.to_string())
                    .encode()
                    .to_vec());
            }
        };

        let response = match header.service {
            service::ECHO => self.echo(body),
            service::EVENTS => self.events(header.action, &body, client),
            service::TX => self.transactions(header.action, header.hash, body, client),
            _ => Response::new(code::UNSUPPORTED),
        };
        Ok(response.encode().to_vec())
    }

    fn filters(&self) -> &FilterRegistry {
        &self.filters
    }

    fn tx_status_queue(&self) -> &TxStatusQueue {
        &self.tx_queue
    }

    /// Collects the oldest submitted execution and queues its callback.
    ///
    /// An execution still running at the deadline is kept and waited on first
    /// next time, so callbacks stay in submission order.
    fn wait_tx_update(&self, timeout: Duration) -> TxWait {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self.in_flight.lock();
        let execution = match in_flight.take() {
            Some(execution) => execution,
            None => match self.completed.recv_deadline(deadline) {
                Ok(execution) => execution,
                Err(_) => return TxWait::TimedOut,
            },
        };

        let result = match execution.recv_deadline(deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                *in_flight = Some(execution);
                return TxWait::TimedOut;
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("transaction execution produced no result");
                return TxWait::Updated;
            }
        };
        if let Err(err) = self.tx_queue.push(result) {
            warn!(error = %err, "transaction callback dropped");
        }
        TxWait::Updated
    }

    fn client_disconnected(&self, client: ClientId) {
        if self.filters.remove(client.subscription_id()).is_some() {
            debug!(
                %client,
                remaining = self.filters.len(),
                "event filter removed with its connection"
            );
        }
    }

    fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.broadcaster.shutdown();
            info!("demo handler stopped accepting requests");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HASH_LEN;

    fn handler() -> DemoHandler {
        DemoHandler::new(&BrokerConfig::default()).expect("handler")
    }

    fn call(handler: &DemoHandler, request: Bytes, client: ClientId) -> Response {
        let response = handler.process(&request, client).expect("processed");
        Response::decode(&Bytes::from(response)).expect("decode")
    }

    #[test]
    fn echo_returns_body() {
        let handler = handler();
        let request = RequestHeader::new(service::ECHO, 0).encode(b"ping-req");
        let response = call(&handler, request, ClientId::new([0, 0, 0, 0, 1]));
        assert_eq!(response.code, code::SUCCESS);
        assert_eq!(response.body.as_ref(), b"ping-req");
    }

    #[test]
    fn subscribe_keys_filter_by_connection() {
        let handler = handler();
        let client = ClientId::new([0, 0, 0, 0, 0xAA]);
        let request = RequestHeader::new(service::EVENTS, action::SUBSCRIBE).encode(b"");
        assert_eq!(call(&handler, request, client).code, code::SUCCESS);

        let filter = handler.filters().get(0xAA).expect("installed");
        assert_eq!(filter.client_id(), client);

        let unsubscribe = RequestHeader::new(service::EVENTS, action::UNSUBSCRIBE).encode(b"");
        assert_eq!(call(&handler, unsubscribe.clone(), client).code, code::SUCCESS);
        assert_eq!(call(&handler, unsubscribe, client).code, code::BAD_REQUEST);
    }

    #[test]
    fn submitted_transaction_reaches_status_queue() {
        let handler = handler();
        let client = ClientId::new([0, 0, 0, 0, 0xFF]);
        let hash = Bytes::from_static(&[0x5A; HASH_LEN]);
        let request = RequestHeader::new(service::TX, action::SUBMIT)
            .with_hash(hash.clone())
            .encode(b"abc");

        let response = call(&handler, request, client);
        assert_eq!(response.code, code::TX_RECEIVED);
        assert_eq!(response.hash, Some(hash.clone()));

        assert_eq!(handler.wait_tx_update(Duration::from_secs(5)), TxWait::Updated);
        let result = handler
            .tx_status_queue()
            .receiver()
            .try_recv()
            .expect("queued callback");
        assert_eq!(result.client_id, client);
        assert_eq!(result.msg_hash, hash);
        assert_eq!(result.status, code::TX_PENDING);
        assert_eq!(result.result.as_deref(), Some(&b"cba"[..]));
    }

    #[test]
    fn disconnect_drops_the_connection_filter() {
        let handler = handler();
        let gone = ClientId::new([0, 0, 0, 0, 0x42]);
        let other = ClientId::new([0, 0, 0, 0, 0x43]);
        let subscribe = RequestHeader::new(service::EVENTS, action::SUBSCRIBE).encode(b"");
        call(&handler, subscribe.clone(), gone);
        call(&handler, subscribe, other);

        handler.client_disconnected(gone);
        assert!(handler.filters().get(gone.subscription_id()).is_none());
        assert!(handler.filters().get(other.subscription_id()).is_some());
        assert_eq!(handler.filters().len(), 1);

        handler.client_disconnected(gone);
        assert_eq!(handler.filters().len(), 1);
    }

    #[test]
    fn slow_execution_does_not_outlast_the_timeout() {
        let handler = handler();
        let client = ClientId::new([0, 0, 0, 0, 7]);
        let (finish, execution) = crossbeam_channel::bounded(1);
        handler.executions.send(execution).expect("handler alive");

        let started = Instant::now();
        assert_eq!(
            handler.wait_tx_update(Duration::from_millis(50)),
            TxWait::TimedOut
        );
        assert!(started.elapsed() < Duration::from_secs(2));

        let hash = Bytes::from_static(&[1; HASH_LEN]);
        finish
            .send(PendingTxResult::new(client, hash.clone(), code::TX_PENDING))
            .expect("execution waiting");
        assert_eq!(handler.wait_tx_update(Duration::from_secs(5)), TxWait::Updated);
        let result = handler
            .tx_status_queue()
            .receiver()
            .try_recv()
            .expect("queued callback");
        assert_eq!(result.msg_hash, hash);
    }

    #[test]
    fn submit_without_hash_is_rejected() {
        let handler = handler();
        let request = RequestHeader::new(service::TX, action::SUBMIT).encode(b"abc");
        let response = call(&handler, request, ClientId::new([0; 5]));
        assert_eq!(response.code, code::BAD_REQUEST);
        assert_eq!(
            handler.wait_tx_update(Duration::from_millis(10)),
            TxWait::TimedOut
        );
    }

    #[test]
    fn truncated_request_gets_bad_request() {
        let handler = handler();
        let response = call(&handler, Bytes::from_static(&[2, 1]), ClientId::new([0; 5]));
        assert_eq!(response.code, code::BAD_REQUEST);
        assert!(response.error.is_some());
    }

    #[test]
    fn refuses_work_after_shutdown() {
        let handler = handler();
        handler.shutdown();
        let request = RequestHeader::new(service::ECHO, 0).encode(b"late");
        assert!(matches!(
            handler.process(&request, ClientId::new([0; 5])),
            Err(HandlerError::ShutDown)
        ));
    }
}
