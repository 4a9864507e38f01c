//! WebSocket Transport
//!
//! Wraps a tokio-tungstenite WebSocket so it can be used as an
//! AsyncRead + AsyncWrite byte stream. MQTT over WebSocket carries
//! packets in binary frames; a packet may span frames and a frame may hold
//! several packets.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

/// Subprotocols accepted during the handshake
const SUBPROTOCOLS: [&str; 2] = ["mqtt", "mqttv3.1"];

/// WebSocket stream wrapper over any underlying byte stream
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    /// Unread bytes of the last binary frame
    read_buffer: BytesMut,
    closed: bool,
}

impl<S> WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buffer: BytesMut::with_capacity(2048),
            closed: false,
        }
    }

    /// Run the server handshake, rejecting requests for any other path
    pub async fn accept_with_path(stream: S, expected_path: &str) -> Result<Self, io::Error> {
        let expected_path = expected_path.to_string();

        let callback = move |req: &Request, mut response: Response| {
            let request_path = req.uri().path();
            if request_path != expected_path {
                let mut error = ErrorResponse::new(Some(format!(
                    "Invalid path: expected '{}', got '{}'",
                    expected_path, request_path
                )));
                *error.status_mut() = StatusCode::NOT_FOUND;
                return Err(error);
            }

            let offered = req
                .headers()
                .get("sec-websocket-protocol")
                .and_then(|value| value.to_str().ok())
                .into_iter()
                .flat_map(|value| value.split(','))
                .map(str::trim)
                .find_map(|offered| SUBPROTOCOLS.into_iter().find(|p| *p == offered));
            if let Some(protocol) = offered {
                response
                    .headers_mut()
                    .insert("sec-websocket-protocol", HeaderValue::from_static(protocol));
            }
            Ok(response)
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .map_err(io::Error::other)?;

        Ok(Self::new(ws))
    }

    /// The underlying byte stream
    pub fn get_ref(&self) -> &S {
        self.inner.get_ref()
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buffer.is_empty() {
                let to_copy = buf.remaining().min(self.read_buffer.len());
                buf.put_slice(&self.read_buffer[..to_copy]);
                self.read_buffer.advance(to_copy);
                return Poll::Ready(Ok(()));
            }

            if self.closed {
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    self.read_buffer.extend_from_slice(&data);
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    self.closed = true;
                }
                // Control frames are answered by tungstenite itself
                Poll::Ready(Some(Ok(_))) => {}
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(io::Error::other(e))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // Nothing is consumed until the sink has room for the frame
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => return Poll::Pending,
        }

        match Pin::new(&mut self.inner).start_send(Message::Binary(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => Poll::Ready(Err(io::Error::other(e))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(io::Error::other)
    }
}
