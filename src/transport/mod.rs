//! Transport Layer
//!
//! Plain TCP, TLS and WebSocket streams behind one [`Transport`] trait so
//! the connection state machine is written once.

mod websocket;

pub use websocket::WsStream;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

/// A byte stream carrying MQTT packets
///
/// Closing is `AsyncWriteExt::shutdown`.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Whether the stream is encrypted
    fn is_secure(&self) -> bool {
        false
    }

    /// Whether the peer presented a client certificate that the TLS layer
    /// verified against the configured CA
    fn has_client_certificate(&self) -> bool {
        false
    }
}

impl Transport for TcpStream {}

impl Transport for TlsStream<TcpStream> {
    fn is_secure(&self) -> bool {
        true
    }

    fn has_client_certificate(&self) -> bool {
        // rustls only completes the handshake for certificates the
        // verifier accepted
        self.get_ref()
            .1
            .peer_certificates()
            .is_some_and(|certs| !certs.is_empty())
    }
}

impl<S: Transport> Transport for WsStream<S> {
    fn is_secure(&self) -> bool {
        self.get_ref().is_secure()
    }

    fn has_client_certificate(&self) -> bool {
        self.get_ref().has_client_certificate()
    }
}

/// Apply socket options to an accepted TCP stream
pub fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)
}
