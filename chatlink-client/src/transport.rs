use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{FutureExt, SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid endpoint: {0}")]
    Endpoint(String),
    #[error("transport failed: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    Closed { code: Option<u16>, reason: String },
    Error(TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Client side of one open duplex link.
///
/// `incoming` ends when the transport goes away. Dropping `outgoing` asks the
/// transport to shut down.
#[derive(Debug)]
pub struct TransportLink {
    pub outgoing: mpsc::UnboundedSender<OutboundFrame>,
    pub incoming: mpsc::UnboundedReceiver<TransportEvent>,
    written: WriteCount,
}

impl TransportLink {
    pub fn channel() -> (TransportLink, RemoteEnd) {
        let (outgoing, frames) = mpsc::unbounded_channel();
        let (to_client, incoming) = mpsc::unbounded_channel();
        let written = WriteCount::default();
        (
            TransportLink {
                outgoing,
                incoming,
                written: written.clone(),
            },
            RemoteEnd {
                to_client,
                from_client: FrameSource { frames, written },
            },
        )
    }

    /// Text frames the transport has confirmed as written so far.
    pub fn written(&self) -> WriteCount {
        self.written.clone()
    }
}

/// Shared count of text frames a transport has put on the wire.
#[derive(Debug, Clone, Default)]
pub struct WriteCount(Arc<AtomicUsize>);

impl WriteCount {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
}

/// Transport side of a [`TransportLink`]. Callback-driven socket libraries
/// bridge into the client by feeding `to_client` and draining `from_client`.
#[derive(Debug)]
pub struct RemoteEnd {
    pub to_client: mpsc::UnboundedSender<TransportEvent>,
    pub from_client: FrameSource,
}

/// Frames queued for the wire. A text frame only counts as delivered once
/// it is acknowledged; anything taken but never acknowledged is sent again
/// on the next link.
#[derive(Debug)]
pub struct FrameSource {
    frames: mpsc::UnboundedReceiver<OutboundFrame>,
    written: WriteCount,
}

impl FrameSource {
    /// Next frame, not yet acknowledged.
    pub async fn next(&mut self) -> Option<OutboundFrame> {
        self.frames.recv().await
    }

    /// Marks the oldest unacknowledged text frame as written.
    pub fn ack(&self) {
        self.written.bump();
    }

    /// Next frame, acknowledged on hand-off. For transports where taking the
    /// frame is the write.
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        let frame = self.frames.recv().await;
        if let Some(OutboundFrame::Text(_)) = &frame {
            self.ack();
        }
        frame
    }
}

/// Opens realtime links. The connection manager only talks to this trait, so
/// the socket implementation can be swapped without touching session logic.
pub trait Connector: Send + Sync + 'static {
    /// Resolves once the transport reports open.
    fn open(&self, endpoint: Url) -> BoxFuture<'static, Result<TransportLink, TransportError>>;
}

#[derive(Debug, Clone)]
pub struct WsConnector {
    keepalive: Duration,
}

impl WsConnector {
    pub fn new(keepalive: Duration) -> Self {
        Self { keepalive }
    }
}

impl Connector for WsConnector {
    fn open(&self, endpoint: Url) -> BoxFuture<'static, Result<TransportLink, TransportError>> {
        let keepalive = self.keepalive;
        async move {
            let (ws_stream, _) = connect_async(endpoint.as_str())
                .await
                .map_err(|err| TransportError::Connect(err.to_string()))?;
            let (write_half, read_half) = ws_stream.split();
            let (link, remote) = TransportLink::channel();
            tokio::spawn(ws_send_task(write_half, remote.from_client, keepalive));
            tokio::spawn(ws_receive_task(read_half, remote.to_client));
            Ok(link)
        }
        .boxed()
    }
}

async fn ws_send_task(
    mut ws_write: SplitSink<WsStream, Message>,
    mut frames: FrameSource,
    keepalive: Duration,
) {
    let mut ping = tokio::time::interval(keepalive);
    ping.tick().await;

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(OutboundFrame::Text(text)) => {
                    if let Err(err) = ws_write.send(Message::Text(text.into())).await {
                        warn!("websocket write failed: {err}");
                        break;
                    }
                    frames.ack();
                }
                Some(OutboundFrame::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    if let Err(err) = ws_write.send(Message::Close(Some(frame))).await {
                        debug!("close frame not delivered: {err}");
                    }
                    break;
                }
                None => {
                    let _ = ws_write.close().await;
                    break;
                }
            },
            _ = ping.tick() => {
                if ws_write.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn ws_receive_task(
    mut ws_read: SplitStream<WsStream>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(next) = ws_read.next().await {
        let event = match next {
            Ok(Message::Text(text)) => TransportEvent::Message(text.as_str().to_owned()),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => TransportEvent::Message(text),
                Err(_) => {
                    warn!(len = data.len(), "dropping non-utf8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                let (code, reason) = match frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_owned()),
                    None => (None, String::new()),
                };
                let _ = events.send(TransportEvent::Closed { code, reason });
                return;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Err(err) => {
                let _ = events.send(TransportEvent::Error(TransportError::Io(err.to_string())));
                return;
            }
        };

        if events.send(event).is_err() {
            return;
        }
    }
}
