//! Payload stream/sink over the raw websocket connection.

use std::task::Poll;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use snafu::prelude::*;
use tokio_tungstenite::tungstenite as websocket;

use super::payload::{ParsePayloadError, Payload};

pub(crate) type WebsocketClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Error when read/write the payload stream/sink
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum PayloadStreamError {
    /// underlying websocket stream broken
    #[snafu(display("underlying websocket stream broken: {source}"))]
    Websocket {
        /// source error
        source: websocket::Error,
    },

    /// server closed the connection
    #[snafu(display("connection closed by server: code {code:?}, reason: {reason}"))]
    Closed {
        /// numeric close code, when the server sent one
        code: Option<u16>,
        /// close reason text
        reason: String,
    },

    /// received a control frame instead of payload data
    #[snafu(display("received a non-data frame"))]
    NotDataFrame,

    /// parse frame data failed
    #[snafu(display("parse frame to payload failed: {source}"))]
    ParsePayloadFailed {
        /// source error
        source: ParsePayloadError,
    },
}

impl PayloadStreamError {
    /// Check if this error will make the stream/sink stop.
    ///
    /// A single undecodable frame is dropped with a log line; only transport
    /// level failures tear down the stream.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Websocket { .. } | Self::Closed { .. } => true,
            Self::NotDataFrame => false,
            Self::ParsePayloadFailed { .. } => false,
        }
    }
}

/// Payload stream/sink wrapping one websocket connection.
///
/// Text frames are parsed directly, binary frames are inflated first when
/// `compressed` is set. Outgoing payloads are always sent as text frames.
#[derive(Debug)]
pub struct PayloadStreamSink {
    ws: WebsocketClient,
    compressed: bool,
}

impl PayloadStreamSink {
    /// Wrap an established websocket connection.
    pub fn new(ws: WebsocketClient, compressed: bool) -> Self {
        Self { ws, compressed }
    }

    fn decode(data: Bytes, compressed: bool) -> Result<Payload, PayloadStreamError> {
        match Payload::decode(data.clone(), compressed) {
            Ok(payload) => Ok(payload),
            Err(e) => {
                log::trace!(
                    "Parse failed frame data: {}",
                    std::str::from_utf8(&data).unwrap_or("<not-utf8-binary>")
                );
                Err(PayloadStreamError::ParsePayloadFailed { source: e })
            }
        }
    }
}

impl Stream for PayloadStreamSink {
    type Item = Result<Payload, PayloadStreamError>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let compressed = self.compressed;
        match self.ws.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Ready(Some(frame)) => {
                let result = match frame.context(error::Websocket) {
                    Err(e) => Err(e),
                    Ok(websocket::Message::Text(text)) => {
                        Self::decode(Bytes::from(text.into_bytes()), false)
                    }
                    Ok(websocket::Message::Binary(data)) => {
                        Self::decode(data.into(), compressed)
                    }
                    Ok(websocket::Message::Close(frame)) => {
                        let (code, reason) = match frame {
                            Some(frame) => (Some(frame.code.into()), frame.reason.into_owned()),
                            None => (None, String::new()),
                        };
                        Err(PayloadStreamError::Closed { code, reason })
                    }
                    Ok(_) => Err(PayloadStreamError::NotDataFrame),
                };
                Poll::Ready(Some(result))
            }
        }
    }
}

impl Sink<Payload> for PayloadStreamSink {
    type Error = PayloadStreamError;

    fn poll_ready(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.ws
            .poll_ready_unpin(cx)
            .map_err(|e| Self::Error::Websocket { source: e })
    }

    fn start_send(mut self: std::pin::Pin<&mut Self>, item: Payload) -> Result<(), Self::Error> {
        self.ws
            .start_send_unpin(websocket::Message::Text(item.encode()))
            .map_err(|e| Self::Error::Websocket { source: e })
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.ws
            .poll_flush_unpin(cx)
            .map_err(|e| Self::Error::Websocket { source: e })
    }

    fn poll_close(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.ws
            .poll_close_unpin(cx)
            .map_err(|e| Self::Error::Websocket { source: e })
    }
}
