//! MQTT Connection Handler
//!
//! Drives one client connection: CONNECT handshake, packet processing,
//! delivery from the session outbox, reforwarding and keep alive. The
//! handler is generic over the transport so TCP, TLS and WebSocket share
//! the same state machine.

mod connect;
mod disconnect;
mod publish;
mod subscribe;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::Shared;
use crate::codec::{Decoder, Encoder};
use crate::delivery::ConnectionEvent;
use crate::protocol::{DecodeError, EncodeError, Packet, ProtocolError, Will};
use crate::session::Session;
use crate::transport::Transport;

/// Source of connection ids, which tell apart successive connections of
/// one client id
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Smallest reforward check period
const MIN_REFORWARD_TICK: Duration = Duration::from_millis(10);

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    Decode(DecodeError),
    /// No CONNECT within the connect timeout
    Timeout,
    /// The peer closed the stream without DISCONNECT
    Closed,
    /// Another connection took over the client id
    TakenOver,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Decode(e) => write!(f, "Decode error: {}", e),
            ConnectionError::Timeout => write!(f, "Connect timeout"),
            ConnectionError::Closed => write!(f, "Connection closed by peer"),
            ConnectionError::TakenOver => write!(f, "Session taken over"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Io(e) => Some(e),
            ConnectionError::Protocol(e) => Some(e),
            ConnectionError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<EncodeError> for ConnectionError {
    fn from(e: EncodeError) -> Self {
        ConnectionError::Protocol(e.into())
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

fn violation(reason: &'static str) -> ConnectionError {
    ConnectionError::Protocol(ProtocolError::ProtocolViolation(reason))
}

/// Connection state
pub(crate) enum State {
    /// Waiting for CONNECT
    Connecting,
    Connected {
        client_id: Arc<str>,
        session: Arc<RwLock<Session>>,
    },
    /// Session released
    Closed,
}

/// What to do after a packet was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    /// The client sent DISCONNECT
    Disconnect,
}

/// Connection handler, generic over the transport
pub struct Connection<T> {
    pub(crate) stream: T,
    pub(crate) addr: SocketAddr,
    pub(crate) connection_id: u64,
    pub(crate) state: State,
    pub(crate) decoder: Decoder,
    pub(crate) encoder: Encoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    pub(crate) shared: Arc<Shared>,
    /// Username from CONNECT (for permission checks)
    pub(crate) username: Option<String>,
    /// Will message, discarded on DISCONNECT
    pub(crate) will: Option<Will>,
    /// Negotiated keep alive, `None` when disabled
    pub(crate) keep_alive: Option<Duration>,
    pub(crate) events: Option<mpsc::Receiver<ConnectionEvent>>,
}

impl<T: Transport> Connection<T> {
    pub(crate) fn new(stream: T, addr: SocketAddr, shared: Arc<Shared>) -> Self {
        Self {
            stream,
            addr,
            connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            state: State::Connecting,
            decoder: Decoder::new().with_max_packet_size(shared.config.max_packet_size),
            encoder: Encoder::default(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            shared,
            username: None,
            will: None,
            keep_alive: None,
            events: None,
        }
    }

    /// Run the connection until it closes
    ///
    /// `Ok` means the client disconnected gracefully.
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        let result = match timeout(self.shared.config.connect_timeout, self.read_connect()).await {
            Ok(Ok(())) => self.run_connected().await,
            Ok(Err(e)) => Err(e),
            Err(_) => {
                debug!("Connect timeout from {}", self.addr);
                Err(ConnectionError::Timeout)
            }
        };

        if let Err(ref e) = result {
            match e {
                ConnectionError::Protocol(_) | ConnectionError::Decode(_) => {
                    warn!("Closing connection from {}: {}", self.addr, e)
                }
                _ => debug!("Closing connection from {}: {}", self.addr, e),
            }
        }

        self.close(result.is_ok()).await;
        let _ = self.stream.shutdown().await;
        result
    }

    pub(crate) fn session(&self) -> Result<(Arc<str>, Arc<RwLock<Session>>), ConnectionError> {
        match &self.state {
            State::Connected { client_id, session } => Ok((client_id.clone(), session.clone())),
            _ => Err(violation("not connected")),
        }
    }

    async fn run_connected(&mut self) -> Result<(), ConnectionError> {
        let mut events = self
            .events
            .take()
            .ok_or_else(|| violation("no event channel"))?;

        let keep_alive = self.keep_alive;
        let mut keep_alive_deadline = keep_alive.map(|k| tokio::time::Instant::now() + k);

        let tick = (self.shared.config.delivery.reforward_interval / 4).max(MIN_REFORWARD_TICK);
        let mut reforward_ticker = tokio::time::interval(tick);
        reforward_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the first immediate tick
        reforward_ticker.tick().await;

        loop {
            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => return Err(ConnectionError::Closed),
                        Ok(_) => {
                            if let Some(k) = keep_alive {
                                keep_alive_deadline = Some(tokio::time::Instant::now() + k);
                            }
                            while let Some((packet, consumed)) =
                                self.decoder.decode(&self.read_buf)?
                            {
                                self.read_buf.advance(consumed);
                                if self.handle_packet(packet).await? == Flow::Disconnect {
                                    return Ok(());
                                }
                            }
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                event = events.recv() => {
                    match event {
                        Some(ConnectionEvent::Wake) => self.flush_outbox().await?,
                        Some(ConnectionEvent::TakenOver) | None => {
                            info!("Session of {} taken over by a new connection", self.addr);
                            return Err(ConnectionError::TakenOver);
                        }
                    }
                }

                _ = reforward_ticker.tick() => {
                    self.reforward().await?;
                }

                _ = sleep_until(keep_alive_deadline) => {
                    info!("Keep alive timeout for {} - disconnecting", self.addr);
                    return Err(ProtocolError::KeepAliveTimeout.into());
                }
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<Flow, ConnectionError> {
        match packet {
            Packet::Connect(_) => Err(violation("duplicate CONNECT")),
            Packet::Publish(publish) => self.handle_publish(publish).await,
            Packet::PubAck(puback) => self.handle_puback(puback.packet_id).await,
            Packet::PubRec(_) | Packet::PubRel(_) | Packet::PubComp(_) => {
                Err(ProtocolError::UnsupportedQoS(2).into())
            }
            Packet::Subscribe(subscribe) => self.handle_subscribe(subscribe).await,
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(unsubscribe).await,
            Packet::PingReq => {
                self.send_packet(&Packet::PingResp).await?;
                Ok(Flow::Continue)
            }
            Packet::Disconnect => {
                debug!("DISCONNECT from {}", self.addr);
                Ok(Flow::Disconnect)
            }
            Packet::ConnAck(_)
            | Packet::SubAck(_)
            | Packet::UnsubAck(_)
            | Packet::PingResp => Err(violation("server-only packet from client")),
        }
    }

    /// Encode and write one packet
    pub(crate) async fn send_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Sleep until the deadline, or forever without one
async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
