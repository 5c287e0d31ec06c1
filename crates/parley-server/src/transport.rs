//! Frame-level view of a client transport. Sessions are written against
//! [`Frame`] sinks and streams, so anything that can carry text frames with
//! ping/pong (an axum WebSocket, an in-memory channel in tests) can host one.

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport error: {0}")]
    Io(String),
}

impl From<WsMessage> for Frame {
    fn from(msg: WsMessage) -> Self {
        match msg {
            WsMessage::Text(text) => Frame::Text(text),
            WsMessage::Binary(data) => Frame::Binary(data),
            WsMessage::Ping(data) => Frame::Ping(data),
            WsMessage::Pong(data) => Frame::Pong(data),
            WsMessage::Close(_) => Frame::Close,
        }
    }
}

impl From<Frame> for WsMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => WsMessage::Text(text),
            Frame::Binary(data) => WsMessage::Binary(data),
            Frame::Ping(data) => WsMessage::Ping(data),
            Frame::Pong(data) => WsMessage::Pong(data),
            Frame::Close => WsMessage::Close(None),
        }
    }
}

/// Split an upgraded WebSocket into a frame sink and a frame stream.
pub fn websocket(
    socket: WebSocket,
) -> (
    impl Sink<Frame, Error = TransportError> + Send + Unpin + 'static,
    impl Stream<Item = Result<Frame, TransportError>> + Send + Unpin + 'static,
) {
    let (sink, stream) = socket.split();

    let sink = sink
        .sink_map_err(|e| TransportError::Io(e.to_string()))
        .with(|frame: Frame| future::ready(Ok::<_, TransportError>(WsMessage::from(frame))));

    let stream = stream.map(|item| {
        item.map(Frame::from)
            .map_err(|e| TransportError::Io(e.to_string()))
    });

    (sink, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_convert_both_ways() {
        let frames = [
            Frame::Text("hello".into()),
            Frame::Binary(vec![1, 2]),
            Frame::Ping(vec![9]),
            Frame::Pong(vec![]),
            Frame::Close,
        ];
        for frame in frames {
            assert_eq!(Frame::from(WsMessage::from(frame.clone())), frame);
        }
    }
}
