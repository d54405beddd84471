//! Transport wrappers
//!
//! Every listener hands the connection actor a plain byte stream
//! (`AsyncRead + AsyncWrite`). TCP and TLS sockets already are one; the
//! WebSocket wrapper re-frames binary WebSocket messages into a
//! continuous byte stream, since MQTT packet boundaries need not align
//! with WebSocket frame boundaries.

mod websocket;

pub use websocket::{WsAcceptOptions, WsStream};
