//! API broker: a multi-lane request router in front of a protocol handler.
//!
//! Peers connect over TCP, receive a five byte [`ClientId`], and exchange
//! multipart messages with the broker. Each module covers one concern:
//!
//! - [`identity`] and [`frame`] define peer identifiers and the wire framing.
//! - [`relay`] owns the front-end socket and routes traffic between peers and
//!   the internal lanes.
//! - [`worker`], [`callback`], [`events`] and [`heartbeat`] are the lanes: the
//!   request/response path, transaction callbacks, subscription pushes and
//!   liveness probes.
//! - [`server`] starts every lane and tears them down in order.
//! - [`handler`] is the capability interface the broker drives; [`demo`] is
//!   the handler the binary serves, backed by [`broadcaster`], [`filter`] and
//!   [`pending`].
//! - [`client`] is an async peer used by the `ping` subcommand and the tests.
//!
//! Integration tests in `tests/` run the broker on an ephemeral port and talk
//! to it through [`client::ApiClient`].

pub mod broadcaster;
pub mod callback;
pub mod cli;
pub mod client;
pub mod config;
pub mod demo;
pub mod error;
pub mod events;
pub mod filter;
pub mod frame;
pub mod handler;
pub mod heartbeat;
pub mod identity;
pub mod pending;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod shutdown;
pub mod socket;
pub mod worker;

pub use config::BrokerConfig;
pub use error::BrokerError;
pub use handler::{ApiHandler, HandlerError, TxWait};
pub use identity::ClientId;
pub use server::{ApiServer, LifecycleState};
