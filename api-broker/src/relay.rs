//! The relay: front-end TCP socket on one side, the four internal lanes on the
//! other.
//!
//! Each accepted peer first completes an identity handshake, then every message
//! it sends is tagged with its [`ClientId`] and steered to the heartbeat lane
//! (heartbeat service) or the worker lane (everything else). Messages coming
//! back from any lane are `[ClientId, payload]` and are routed to the live
//! connection holding that identifier; unknown identifiers are dropped.
//!
//! The relay is the only owner of the lanes' relay-side halves. When it
//! returns, it closes the listener and then the lanes in a fixed order, which
//! unblocks every lane still waiting on a receive.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, trace, warn};

use crate::frame::{FrameCodec, Multipart};
use crate::handler::ApiHandler;
use crate::identity::{CLIENT_ID_LEN, ClientId};
use crate::protocol::is_heartbeat;
use crate::socket::LaneSocket;

/// How long a new peer has to send its identity frame.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay-side halves of the internal lanes.
pub(crate) struct Lanes {
    pub(crate) worker: LaneSocket,
    pub(crate) callback: LaneSocket,
    pub(crate) event: LaneSocket,
    pub(crate) heartbeat: LaneSocket,
}

impl Lanes {
    /// Drops every lane in order: worker, callback, event, heartbeat.
    fn close(self) {
        let Lanes {
            worker,
            callback,
            event,
            heartbeat,
        } = self;
        for lane in [worker, callback, event, heartbeat] {
            let name = lane.name;
            drop(lane);
            debug!(lane = name, "lane socket closed");
        }
    }
}

pub(crate) struct Relay {
    listener: TcpListener,
    lanes: Lanes,
    handler: Arc<dyn ApiHandler>,
    send_hwm: usize,
    max_frame_len: usize,
}

impl Relay {
    pub(crate) fn new(
        listener: TcpListener,
        lanes: Lanes,
        handler: Arc<dyn ApiHandler>,
        send_hwm: usize,
        max_frame_len: usize,
    ) -> Self {
        Self {
            listener,
            lanes,
            handler,
            send_hwm,
            max_frame_len,
        }
    }

    /// Relays until `shutdown` resolves or the listener fails.
    ///
    /// A listener failure is returned after the sockets are closed; callers
    /// treat it as a shutdown trigger.
    pub(crate) async fn run_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let Relay {
            listener,
            mut lanes,
            handler,
            send_hwm,
            max_frame_len,
        } = self;
        tokio::pin!(shutdown);

        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RelayState {
            peers: Mutex::new(PeerTable::new(rand::random())),
            handler,
            inbound: inbound_tx,
            send_hwm,
            max_frame_len,
        });

        let outcome = loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break Ok(());
                }
                accepted = listener.accept() => {
                    if let Err(err) = handle_accept_result(accepted, &state) {
                        error!(error = %err, "listener failed; relay exiting");
                        break Err(err);
                    }
                }
                Some((client, message)) = inbound_rx.recv() => {
                    steer(&lanes, client, message);
                }
                Some(message) = lanes.worker.outbound.recv() => {
                    state.deliver(lanes.worker.name, message);
                }
                Some(message) = lanes.callback.outbound.recv() => {
                    state.deliver(lanes.callback.name, message);
                }
                Some(message) = lanes.event.outbound.recv() => {
                    state.deliver(lanes.event.name, message);
                }
                Some(message) = lanes.heartbeat.outbound.recv() => {
                    state.deliver(lanes.heartbeat.name, message);
                }
            }
        };

        drop(listener);
        debug!("listener closed");
        lanes.close();
        outcome
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<RelayState>,
) -> io::Result<()> {
    match result {
        Ok((stream, peer)) => {
            spawn_peer_handler(stream, peer, state);
            Ok(())
        }
        Err(err) if is_connection_error(&err) => {
            warn!(error = %err, "failed to accept connection");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
    )
}

fn spawn_peer_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<RelayState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_peer(stream, peer, &state).await {
            debug!(%peer, error = %err, "peer connection closed with error");
        }
    });
}

fn steer(lanes: &Lanes, client: ClientId, mut message: Multipart) {
    let lane = match message.first() {
        Some(payload) if is_heartbeat(payload) => &lanes.heartbeat,
        _ => &lanes.worker,
    };
    message.insert(0, client.to_bytes());
    if lane.inbound.send(message).is_err() {
        debug!(lane = lane.name, %client, "lane gone; inbound message dropped");
    }
}

struct RelayState {
    peers: Mutex<PeerTable>,
    handler: Arc<dyn ApiHandler>,
    inbound: mpsc::UnboundedSender<(ClientId, Multipart)>,
    send_hwm: usize,
    max_frame_len: usize,
}

impl RelayState {
    /// Routes an addressed lane message to its peer.
    fn deliver(&self, lane: &'static str, message: Multipart) {
        let client = match message.first().map(|id| ClientId::try_from(id.as_ref())) {
            Some(Ok(client)) => client,
            Some(Err(err)) => {
                warn!(lane, error = %err, "outbound message with bad identifier dropped");
                return;
            }
            None => return,
        };

        let peers = self.peers.lock();
        let Some(peer) = peers.get(&client) else {
            debug!(lane, %client, "no live peer; message dropped");
            return;
        };
        match peer.tx.try_send(message) {
            Ok(()) => trace!(lane, %client, "message routed"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(lane, %client, hwm = self.send_hwm, "peer queue full; message dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(lane, %client, "peer closing; message dropped");
            }
        }
    }
}

#[derive(Debug)]
struct Peer {
    serial: u64,
    tx: mpsc::Sender<Multipart>,
}

/// Live connections by identifier.
///
/// Each registration gets a serial number so a connection that is going away
/// never removes the entry of a newer connection that reused its identifier.
#[derive(Debug)]
struct PeerTable {
    peers: HashMap<ClientId, Peer>,
    next_auto: u32,
    next_serial: u64,
}

#[derive(Debug, PartialEq, Eq)]
struct IdentityInUse(ClientId);

impl PeerTable {
    fn new(seed: u32) -> Self {
        Self {
            peers: HashMap::new(),
            next_auto: seed,
            next_serial: 0,
        }
    }

    fn get(&self, client: &ClientId) -> Option<&Peer> {
        self.peers.get(client)
    }

    fn register(
        &mut self,
        requested: Option<ClientId>,
        tx: mpsc::Sender<Multipart>,
    ) -> Result<(ClientId, u64), IdentityInUse> {
        let client = match requested {
            Some(client) if self.peers.contains_key(&client) => return Err(IdentityInUse(client)),
            Some(client) => client,
            None => self.auto_assign(),
        };
        self.next_serial += 1;
        let serial = self.next_serial;
        self.peers.insert(client, Peer { serial, tx });
        Ok((client, serial))
    }

    /// `0x00` followed by the next free counter value.
    fn auto_assign(&mut self) -> ClientId {
        loop {
            let [a, b, c, d] = self.next_auto.to_be_bytes();
            self.next_auto = self.next_auto.wrapping_add(1);
            let client = ClientId::new([0, a, b, c, d]);
            if !self.peers.contains_key(&client) {
                return client;
            }
        }
    }

    fn unregister(&mut self, client: ClientId, serial: u64) -> bool {
        match self.peers.get(&client) {
            Some(peer) if peer.serial == serial => {
                self.peers.remove(&client);
                true
            }
            _ => false,
        }
    }

    fn len(&self) -> usize {
        self.peers.len()
    }
}

async fn handle_peer(stream: TcpStream, peer: SocketAddr, state: &RelayState) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = FramedRead::new(reader, FrameCodec::new(state.max_frame_len));
    let mut writer = FramedWrite::new(writer, FrameCodec::new(state.max_frame_len));

    let requested = perform_handshake(&mut reader).await?;
    let (tx, mut outbound) = mpsc::channel(state.send_hwm);
    let registered = state.peers.lock().register(requested, tx);
    let (client, serial) = match registered {
        Ok(registered) => registered,
        Err(IdentityInUse(client)) => {
            warn!(%peer, %client, "identity already connected; refusing peer");
            writer.send(vec![Bytes::new()]).await?;
            return Ok(());
        }
    };

    let connected = state.peers.lock().len();
    info!(%peer, %client, connected, "peer connected");

    let result = run_peer_session(client, &mut reader, &mut writer, &mut outbound, state).await;

    {
        // The identifier stays reserved until the handler has released it.
        let mut peers = state.peers.lock();
        if peers.unregister(client, serial) {
            state.handler.client_disconnected(client);
        }
    }
    info!(%peer, %client, "peer disconnected");
    result
}

async fn perform_handshake<R>(reader: &mut FramedRead<R, FrameCodec>) -> Result<Option<ClientId>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let hello = match timeout(HANDSHAKE_TIMEOUT, reader.next()).await {
        Ok(Some(message)) => message.context("reading identity frame")?,
        Ok(None) => bail!("connection closed before handshake"),
        Err(_) => bail!("handshake timed out"),
    };

    let [identity]: [Bytes; 1] = hello
        .try_into()
        .map_err(|frames: Multipart| anyhow::anyhow!("identity message has {} frames", frames.len()))?;

    match identity.len() {
        0 => Ok(None),
        CLIENT_ID_LEN => Ok(Some(ClientId::try_from(identity.as_ref())?)),
        _ => bail!("requested identity {} has the wrong length", hex::encode(&identity)),
    }
}

async fn run_peer_session<R, W>(
    client: ClientId,
    reader: &mut FramedRead<R, FrameCodec>,
    writer: &mut FramedWrite<W, FrameCodec>,
    outbound: &mut mpsc::Receiver<Multipart>,
    state: &RelayState,
) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    writer.send(vec![client.to_bytes()]).await?;

    loop {
        select! {
            incoming = reader.next() => match incoming {
                Some(message) => {
                    let message = message.context("reading peer message")?;
                    if state.inbound.send((client, message)).is_err() {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            },
            message = outbound.recv() => match message {
                Some(message) => writer.send(message).await?,
                None => return Ok(()),
            },
        }
    }
}
