//! MQTT over WebSocket
//!
//! Wraps a tokio-tungstenite WebSocket in `AsyncRead`/`AsyncWrite`.
//! Incoming binary frames are buffered and presented as a continuous
//! byte stream: one frame may carry several MQTT packets, and one packet
//! may span several frames.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

/// Handshake policy for the WebSocket listeners
#[derive(Debug, Clone, Default)]
pub struct WsAcceptOptions {
    /// Required request path (e.g. "/ws")
    pub path: String,
    /// Reject requests with a missing or empty Origin header
    pub reject_empty_origin: bool,
    /// Origin allow-list; empty allows all origins
    pub origins: Vec<String>,
}

/// WebSocket stream speaking the `mqtt` subprotocol over binary frames
pub struct WsStream<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    stream: SplitStream<WebSocketStream<S>>,
    /// Bytes received but not yet consumed by the reader
    read_buffer: BytesMut,
    closed: bool,
}

impl<S> WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink,
            stream,
            read_buffer: BytesMut::with_capacity(4096),
            closed: false,
        }
    }

    /// Accept a WebSocket upgrade, enforcing the configured path, the
    /// origin policy and the `mqtt` subprotocol.
    pub async fn accept(stream: S, options: &WsAcceptOptions) -> Result<Self, io::Error> {
        let options = options.clone();

        let ws = tokio_tungstenite::accept_hdr_async(stream, move |req: &Request,
                                                                   mut response: Response| {
            if req.uri().path() != options.path {
                return Err(ErrorResponse::new(Some(format!(
                    "invalid path: expected '{}', got '{}'",
                    options.path,
                    req.uri().path()
                ))));
            }

            let origin = req
                .headers()
                .get("origin")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");

            if origin.is_empty() {
                if options.reject_empty_origin {
                    return Err(ErrorResponse::new(Some("empty origin rejected".into())));
                }
            } else if !options.origins.is_empty()
                && !options.origins.iter().any(|allowed| allowed == origin)
            {
                return Err(ErrorResponse::new(Some("origin not allowed".into())));
            }

            if let Some(protocols) = req.headers().get("sec-websocket-protocol") {
                if let Ok(protocols_str) = protocols.to_str() {
                    if protocols_str.split(',').any(|p| p.trim() == "mqtt") {
                        response
                            .headers_mut()
                            .insert("sec-websocket-protocol", "mqtt".parse().unwrap());
                    }
                }
            }

            Ok(response)
        })
        .await
        .map_err(io::Error::other)?;

        Ok(Self::new(ws))
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
        // Serve buffered bytes first
        if !self.read_buffer.is_empty() {
            let to_copy = std::cmp::min(buf.remaining(), self.read_buffer.len());
            buf.put_slice(&self.read_buffer[..to_copy]);
            let _ = self.read_buffer.split_to(to_copy);
            return Poll::Ready(Ok(()));
        }

        if self.closed {
            return Poll::Ready(Ok(()));
        }

        loop {
            match Pin::new(&mut self.stream).poll_next(cx) {
                Poll::Ready(Some(Ok(message))) => match message {
                    Message::Binary(data) => {
                        let to_copy = std::cmp::min(buf.remaining(), data.len());
                        buf.put_slice(&data[..to_copy]);
                        if to_copy < data.len() {
                            self.read_buffer.extend_from_slice(&data[to_copy..]);
                        }
                        return Poll::Ready(Ok(()));
                    }
                    Message::Close(_) => {
                        self.closed = true;
                        return Poll::Ready(Ok(()));
                    }
                    // Pings are answered by tungstenite; other frame kinds
                    // carry no MQTT bytes
                    Message::Ping(_) | Message::Pong(_) | Message::Text(_) | Message::Frame(_) => {
                        continue;
                    }
                },
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(io::Error::other(e))),
                Poll::Ready(None) => {
                    self.closed = true;
                    return Poll::Ready(Ok(()));
                }
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
        match Pin::new(&mut self.sink).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                let message = Message::Binary(buf.to_vec());
                match Pin::new(&mut self.sink).start_send(message) {
                    Ok(()) => Poll::Ready(Ok(buf.len())),
                    Err(e) => Poll::Ready(Err(io::Error::other(e))),
                }
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.sink).poll_flush(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.sink).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                let _ = Pin::new(&mut self.sink).start_send(Message::Close(None));
                Pin::new(&mut self.sink)
                    .poll_flush(cx)
                    .map_err(io::Error::other)
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }
}
