//! WebSocket transport.
//!
//! One authenticated socket is shared by all statements of a session.
//! Outbound frames go through a send queue which keeps the frames of one
//! statement contiguous; inbound frames are demultiplexed onto the FIFO
//! query queue by a reader task.
pub(crate) mod queue;
pub(crate) mod socket;

use serde::Serialize;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::Mutex;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::SEC_WEBSOCKET_PROTOCOL},
        protocol::frame::coding::CloseCode,
    },
};

use crate::{
    Result,
    common::{span, verbose},
    config::Config,
    error::{Error, ProtocolError, ValidationError, WsError},
    protocol::{Frame, ParamPayload, ResponseFrame, ResultUrn},
    value::PgFormat,
};

use self::{
    queue::{QueryQueue, ReplyReceiver},
    socket::{WsSink, WsSource},
};

/// Negotiated subprotocol.
const SUBPROTOCOL: &str = "prisma-postgres-1.0";

/// Send-buffer high-water mark before a send waits.
const SEND_BUFFER_LIMIT: usize = 1024 * 1024;

/// Backoff bounds while the send buffer drains.
const BACKOFF_START: Duration = Duration::from_millis(5);
const BACKOFF_CAP: Duration = Duration::from_millis(100);

#[derive(Serialize)]
struct Auth<'a> {
    username: &'a str,
    password: &'a str,
}

struct Shared {
    queue: parking_lot::Mutex<QueryQueue>,
    connected: AtomicBool,
}

/// One authenticated socket plus its query queue.
pub(crate) struct WsConnection {
    sink: Arc<Mutex<WsSink>>,
    shared: Arc<Shared>,
    reader: tokio::task::JoinHandle<()>,
}

impl WsConnection {
    /// Open the socket, authenticate, and spawn the reader task.
    pub async fn connect(config: &Config) -> Result<WsConnection> {
        span!("ws_connect");

        let mut request = config.ws_url().into_client_request().map_err(WsError::from)?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

        let (stream, _response) = connect_async(request).await.map_err(WsError::from)?;
        verbose!("websocket open");

        let (sink, source) = futures_util::StreamExt::split(stream);
        Self::start(WsSink::Tungstenite(sink), WsSource::Tungstenite(source), config).await
    }

    #[cfg(test)]
    pub(crate) async fn connect_mock(config: &Config) -> Result<(WsConnection, socket::mock::MockHandle)> {
        let (sink, source, handle) = socket::mock::pair();
        let conn = Self::start(sink, source, config).await?;
        Ok((conn, handle))
    }

    async fn start(sink: WsSink, source: WsSource, config: &Config) -> Result<WsConnection> {
        let sink = Arc::new(Mutex::new(sink));
        let shared = Arc::new(Shared {
            queue: parking_lot::Mutex::new(QueryQueue::new()),
            connected: AtomicBool::new(true),
        });

        // the auth message is the very first thing on the wire
        let auth = serde_json::to_string(&Auth { username: &config.user, password: &config.pass })
            .expect("auth serialization is statically known");
        sink.lock().await.send(Message::text(auth)).await.map_err(Error::from)?;

        let reader = tokio::spawn(read_loop(source, sink.clone(), shared.clone()));

        Ok(WsConnection { sink, shared, reader })
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Send one statement's frames contiguously and enqueue its pending
    /// reply.
    ///
    /// The sink lock is the send queue: concurrent statements serialize
    /// here in submission order, which makes the wire order match the FIFO
    /// response order.
    pub async fn pipeline(&self, frames: Vec<Frame>) -> Result<ReplyReceiver> {
        let mut sink = self.sink.lock().await;

        if !self.is_connected() {
            return Err(WsError::closed(None, None).into());
        }

        let (id, reply) = self.shared.queue.lock().push();

        for frame in frames {
            verbose!("(F){frame:?}");
            if let Err(err) = send_frame(&mut sink, frame).await {
                self.shared
                    .queue
                    .lock()
                    .abort(id, WsError::new("statement send failed").into());
                return Err(err);
            }
        }

        Ok(reply)
    }

    /// Close the socket with a normal closure. Pending transactions are
    /// rolled back by the server.
    pub async fn close(&self) -> Result<()> {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.sink.lock().await.close(CloseCode::Normal, "Normal closure").await;
        Ok(())
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Send one frame as its urn header message plus payload message.
///
/// Stream parameters are materialized into a single message here.
async fn send_frame(sink: &mut WsSink, frame: Frame) -> Result<()> {
    let urn = frame.urn();
    send_message(sink, Message::text(urn)).await?;

    match frame {
        Frame::Descriptor(json) => {
            send_message(sink, Message::text(json)).await?;
        },
        Frame::Param { format, payload } => {
            let data = match payload {
                ParamPayload::Bytes(data) => data,
                ParamPayload::Stream(stream) => stream.collect().await?,
            };
            let message = match format {
                PgFormat::Text => {
                    let text = String::from_utf8(data.into())
                        .map_err(|_|ValidationError::new("text parameter is not valid utf8"))?;
                    Message::text(text)
                },
                PgFormat::Binary => Message::binary(data),
            };
            send_message(sink, message).await?;
        },
    }

    Ok(())
}

/// Write one message, waiting for the send buffer to drain first when the
/// backend exposes its depth.
async fn send_message(sink: &mut WsSink, message: Message) -> Result<()> {
    let mut delay = BACKOFF_START;
    while let Some(buffered) = sink.buffered_amount() {
        if buffered <= SEND_BUFFER_LIMIT {
            break;
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(BACKOFF_CAP);
    }

    sink.send(message).await.map_err(Error::from)
}

/// Inbound side: alternate urn header and payload messages, dispatching each
/// payload onto the head of the query queue.
async fn read_loop(mut source: WsSource, sink: Arc<Mutex<WsSink>>, shared: Arc<Shared>) {
    let mut expecting: Option<ResultUrn> = None;

    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => match expecting.take() {
                None => match ResultUrn::parse(text.as_str()) {
                    Some(urn) => expecting = Some(urn),
                    None => {
                        violation(&sink, &shared, "unknown frame urn").await;
                        break;
                    },
                },
                Some(urn) => {
                    verbose!("(B){urn:?}");
                    if let Err(err) = dispatch_payload(urn, text.as_str(), &shared) {
                        violation(&sink, &shared, err).await;
                        break;
                    }
                },
            },
            // the read path is text only
            Some(Ok(Message::Binary(_))) => {
                violation(&sink, &shared, "binary message on text protocol").await;
                break;
            },
            // control frames do not toggle the urn state
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = match frame {
                    Some(frame) => (Some(u16::from(frame.code)), Some(frame.reason.to_string())),
                    None => (None, None),
                };
                closed(&shared, code, reason);
                break;
            },
            // raw frames never surface from a configured stream
            Some(Ok(Message::Frame(_))) => continue,
            Some(Err(err)) => {
                verbose!("websocket error: {err}");
                shared.connected.store(false, Ordering::SeqCst);
                shared.queue.lock().abort_all(||WsError::new(err.message.clone()).into());
                break;
            },
            None => {
                closed(&shared, None, None);
                break;
            },
        }
    }
}

fn dispatch_payload(urn: ResultUrn, payload: &str, shared: &Shared) -> Result<(), ProtocolError> {
    let value = serde_json::from_str(payload)
        .map_err(|_|ProtocolError::new("frame payload is not valid json"))?;

    let frame = ResponseFrame::decode(value)
        .ok_or_else(||ProtocolError::new("unrecognized frame payload"))?;

    if !frame.matches(urn) {
        return Err(ProtocolError::new("frame payload does not match its urn"));
    }

    shared.queue.lock().dispatch(frame)
}

/// Fatal protocol violation: abort everything and close the socket.
async fn violation(sink: &Arc<Mutex<WsSink>>, shared: &Shared, err: impl Into<ProtocolError>) {
    let err = err.into();
    verbose!("{err}");
    shared.connected.store(false, Ordering::SeqCst);
    shared.queue.lock().abort_all(||err.clone().into());
    sink.lock().await.close(CloseCode::Protocol, "protocol violation").await;
}

fn closed(shared: &Shared, code: Option<u16>, reason: Option<String>) {
    shared.connected.store(false, Ordering::SeqCst);
    shared
        .queue
        .lock()
        .abort_all(||WsError::closed(code, reason.clone()).into());
}
