//! WebSocket halves over interchangeable backends.
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

use crate::error::WsError;

type TlsWebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of the connection.
pub(crate) enum WsSink {
    Tungstenite(SplitSink<TlsWebSocket, Message>),
    #[cfg(test)]
    Mock(mock::MockSink),
}

impl WsSink {
    /// Bytes sitting in the platform send buffer, when the backend exposes
    /// it. Backends without a probe never wait for backpressure.
    pub fn buffered_amount(&self) -> Option<usize> {
        match self {
            WsSink::Tungstenite(_) => None,
            #[cfg(test)]
            WsSink::Mock(mock) => Some(mock.buffered()),
        }
    }

    pub async fn send(&mut self, message: Message) -> Result<(), WsError> {
        match self {
            WsSink::Tungstenite(sink) => sink.send(message).await.map_err(WsError::from),
            #[cfg(test)]
            WsSink::Mock(mock) => mock.send(message),
        }
    }

    /// Send a close frame, ignoring failures on an already dead socket.
    pub async fn close(&mut self, code: CloseCode, reason: &'static str) {
        let frame = CloseFrame { code, reason: reason.into() };
        let _ = self.send(Message::Close(Some(frame))).await;
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for WsError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> WsError {
        WsError::new(err.to_string())
    }
}

/// Read half of the connection.
pub(crate) enum WsSource {
    Tungstenite(SplitStream<TlsWebSocket>),
    #[cfg(test)]
    Mock(mock::MockSource),
}

impl WsSource {
    /// Next inbound message, `None` once the stream is finished.
    pub async fn next(&mut self) -> Option<Result<Message, WsError>> {
        match self {
            WsSource::Tungstenite(stream) => {
                stream.next().await.map(|r|r.map_err(WsError::from))
            },
            #[cfg(test)]
            WsSource::Mock(mock) => mock.next().await,
        }
    }
}
