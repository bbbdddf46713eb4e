use std::net::SocketAddr;

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info};

use crate::frame::{FrameCodec, split_addressed};
use crate::identity::ClientId;
use crate::protocol::{RequestHeader, Response, service};

/// A peer of the broker's front-end socket.
pub struct ApiClient {
    identity: ClientId,
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
}

impl ApiClient {
    /// Connects and lets the broker assign an identity.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::handshake(addr, Bytes::new()).await
    }

    /// Connects under `identity`. Fails if another live peer already holds it.
    pub async fn connect_with_identity(addr: SocketAddr, identity: ClientId) -> Result<Self> {
        Self::handshake(addr, identity.to_bytes()).await
    }

    async fn handshake(addr: SocketAddr, hello: Bytes) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        let (reader, writer) = stream.into_split();
        let mut reader = FramedRead::new(reader, FrameCodec::default());
        let mut writer = FramedWrite::new(writer, FrameCodec::default());

        writer.send(vec![hello]).await.context("sending identity")?;
        let reply = reader
            .next()
            .await
            .ok_or_else(|| anyhow!("broker closed the connection during handshake"))?
            .context("reading identity reply")?;

        let assigned = reply.first().cloned().unwrap_or_default();
        if assigned.is_empty() {
            bail!("broker refused the requested identity");
        }
        let identity = ClientId::try_from(assigned.as_ref())?;
        debug!(%addr, %identity, "connected to broker");

        Ok(Self {
            identity,
            reader,
            writer,
        })
    }

    pub fn identity(&self) -> ClientId {
        self.identity
    }

    pub async fn send(&mut self, payload: Bytes) -> Result<()> {
        self.writer
            .send(vec![payload])
            .await
            .context("sending request")
    }

    /// Waits for the next message addressed to this peer: a reply or a push.
    pub async fn recv(&mut self) -> Result<(ClientId, Bytes)> {
        let message = self
            .reader
            .next()
            .await
            .ok_or_else(|| anyhow!("broker closed the connection"))?
            .context("reading message")?;
        Ok(split_addressed(message)?)
    }

    /// Sends `payload` and decodes the next message as its response.
    pub async fn request(&mut self, payload: Bytes) -> Result<Response> {
        self.send(payload).await?;
        let (_, body) = self.recv().await?;
        Ok(Response::decode(&body)?)
    }

    pub async fn heartbeat(&mut self) -> Result<Response> {
        self.request(RequestHeader::new(service::HEARTBEAT, 0).encode(b""))
            .await
    }
}

/// Backs the `ping` subcommand: one heartbeat and one echo.
pub async fn ping(server: SocketAddr) -> Result<()> {
    let mut client = ApiClient::connect(server).await?;
    info!("connected to {server}");
    println!("connected as {}", client.identity());

    let ack = client.heartbeat().await?;
    println!("heartbeat: code {}", ack.code);

    let echo = client
        .request(RequestHeader::new(service::ECHO, 0).encode(b"ping"))
        .await?;
    println!("echo: {}", String::from_utf8_lossy(&echo.body));

    Ok(())
}
