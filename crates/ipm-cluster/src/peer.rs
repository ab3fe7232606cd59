//! One peer connection: handshake, reader and writer.
//!
//! Inbound connections arrive through an axum `WebSocketUpgrade`, outbound
//! ones through `tokio-tungstenite`; both are reduced to a [`PeerSocket`] of
//! [`Frame`]s so the loops below do not care which side dialed.

use crate::error::{ClusterError, Result};
use crate::hub::{HubHandle, PeerLink, PEER_QUEUE};
use crate::message::Message;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::json;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

pub const INSTANCE_UUID: &str = "instance-uuid";
pub const INSTANCE_PRIORITY: &str = "instance-priority";

/// Instance uuids are the 36 character hyphenated form
pub const UUID_LEN: usize = 36;

const PING_PERIOD: Duration = Duration::from_secs(2);
/// Without any inbound frame for this long the connection is dead
const PONG_WAIT: Duration = Duration::from_secs(4);
const WRITE_WAIT: Duration = Duration::from_secs(4);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping,
    Pong,
    Close,
    Other,
}

type FrameSink = Pin<Box<dyn Sink<Frame, Error = ClusterError> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

pub struct PeerSocket {
    sink: FrameSink,
    stream: FrameStream,
}

impl PeerSocket {
    pub fn from_axum(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();

        let sink = sink.with(|frame: Frame| {
            future::ready(Ok::<_, ClusterError>(match frame {
                Frame::Text(text) => AxumMessage::Text(text),
                Frame::Ping => AxumMessage::Ping(Vec::new()),
                Frame::Pong => AxumMessage::Pong(Vec::new()),
                Frame::Close | Frame::Other => AxumMessage::Close(None),
            }))
        });
        let stream = stream.map(|message| -> Result<Frame> {
            let frame = match message? {
                AxumMessage::Text(text) => Frame::Text(text),
                AxumMessage::Ping(_) => Frame::Ping,
                AxumMessage::Pong(_) => Frame::Pong,
                AxumMessage::Close(_) => Frame::Close,
                AxumMessage::Binary(_) => Frame::Other,
            };
            Ok(frame)
        });

        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    pub fn from_tungstenite<S>(socket: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = socket.split();

        let sink = sink.with(|frame: Frame| {
            future::ready(Ok::<_, ClusterError>(match frame {
                Frame::Text(text) => WsMessage::Text(text),
                Frame::Ping => WsMessage::Ping(Vec::new()),
                Frame::Pong => WsMessage::Pong(Vec::new()),
                Frame::Close | Frame::Other => WsMessage::Close(None),
            }))
        });
        let stream = stream.map(|message| -> Result<Frame> {
            let frame = match message? {
                WsMessage::Text(text) => Frame::Text(text),
                WsMessage::Ping(_) => Frame::Ping,
                WsMessage::Pong(_) => Frame::Pong,
                WsMessage::Close(_) => Frame::Close,
                _ => Frame::Other,
            };
            Ok(frame)
        });

        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Identity a peer presented when connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub uuid: String,
    pub addr: String,
    pub priority: u32,
}

impl Handshake {
    /// A missing or unparsable priority counts as 0
    pub fn parse(uuid: Option<&str>, priority: Option<&str>, addr: &str) -> Result<Self> {
        let uuid = uuid.unwrap_or_default();
        if uuid.len() != UUID_LEN {
            return Err(ClusterError::Handshake(format!(
                "missing or malformed {} header",
                INSTANCE_UUID
            )));
        }

        Ok(Self {
            uuid: uuid.to_string(),
            addr: addr.to_string(),
            priority: priority.and_then(|p| p.trim().parse().ok()).unwrap_or(0),
        })
    }

    pub fn from_headers(headers: &HeaderMap, addr: &str) -> Result<Self> {
        let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        Self::parse(get(INSTANCE_UUID), get(INSTANCE_PRIORITY), addr)
    }
}

/// A connection the hub accepted, ready to run
pub struct JoinedPeer {
    hub: HubHandle,
    uuid: String,
    conn_id: u64,
    socket: PeerSocket,
    queue: mpsc::Receiver<Message>,
}

/// Register a connection with the hub
pub async fn join(
    hub: &HubHandle,
    handshake: Handshake,
    socket: PeerSocket,
    dialed: Option<String>,
) -> Result<JoinedPeer> {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (sender, queue) = mpsc::channel(PEER_QUEUE);

    hub.join(PeerLink {
        uuid: handshake.uuid.clone(),
        addr: handshake.addr,
        priority: handshake.priority,
        conn_id,
        dialed,
        sender,
    })
    .await?;

    Ok(JoinedPeer {
        hub: hub.clone(),
        uuid: handshake.uuid,
        conn_id,
        socket,
        queue,
    })
}

impl JoinedPeer {
    /// Read until the connection dies, then leave the hub
    pub async fn run(self) {
        let JoinedPeer {
            hub,
            uuid,
            conn_id,
            socket,
            queue,
        } = self;

        let writer = tokio::spawn(write_loop(socket.sink, queue, uuid.clone()));
        read_loop(socket.stream, &hub, &uuid).await;

        if let Err(e) = hub.leave(&uuid, conn_id).await {
            debug!("Leave for peer {} failed: {}", uuid, e);
        }
        // leaving drops the queue sender, which ends the writer
        let _ = writer.await;
    }
}

async fn read_loop(mut stream: FrameStream, hub: &HubHandle, uuid: &str) {
    loop {
        let frame = match timeout(PONG_WAIT, stream.next()).await {
            Err(_) => {
                warn!("Peer {} timed out", uuid);
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!("Read from peer {} failed: {}", uuid, e);
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Frame::Text(text) => match serde_json::from_str::<Message>(&text) {
                Ok(message) => {
                    if hub.dispatch(uuid, message).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!("Dropping malformed message from {}: {}", uuid, e),
            },
            Frame::Close => return,
            Frame::Ping | Frame::Pong | Frame::Other => {}
        }
    }
}

async fn write_loop(mut sink: FrameSink, mut queue: mpsc::Receiver<Message>, uuid: String) {
    let mut ticker = interval(PING_PERIOD);
    ticker.tick().await;

    loop {
        let frame = tokio::select! {
            message = queue.recv() => match message {
                Some(message) => match serde_json::to_string(&message) {
                    Ok(text) => Frame::Text(text),
                    Err(e) => {
                        warn!("Failed to encode message for {}: {}", uuid, e);
                        continue;
                    }
                },
                None => {
                    let _ = timeout(WRITE_WAIT, sink.send(Frame::Close)).await;
                    return;
                }
            },
            _ = ticker.tick() => Frame::Ping,
        };

        match timeout(WRITE_WAIT, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Write to peer {} failed: {}", uuid, e);
                return;
            }
            Err(_) => {
                warn!("Write to peer {} timed out", uuid);
                return;
            }
        }
    }
}

fn error_response(status: StatusCode, message: impl ToString) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

/// Serve `GET /api/v1/cluster`.
///
/// The identity headers are checked before the upgrade: a malformed uuid is
/// `400`, our own or an already joined uuid is `409`. The upgrade response
/// carries this node's identity headers.
pub async fn upgrade(
    hub: HubHandle,
    headers: &HeaderMap,
    addr: &str,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let handshake = match Handshake::from_headers(headers, addr) {
        Ok(handshake) => handshake,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    if handshake.uuid == hub.uuid() {
        return error_response(StatusCode::CONFLICT, "refusing connection from self");
    }
    match hub.admits_inbound(&handshake.uuid).await {
        Ok(true) => {}
        Ok(false) => {
            return error_response(
                StatusCode::CONFLICT,
                format!("peer {} is already connected", handshake.uuid),
            );
        }
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    info!(
        "Accepting peer connection: addr={} uuid={} priority={}",
        handshake.addr, handshake.uuid, handshake.priority
    );

    let local = hub.clone();
    let mut response = ws.on_upgrade(move |socket| async move {
        match join(&local, handshake, PeerSocket::from_axum(socket), None).await {
            Ok(peer) => peer.run().await,
            Err(e) => warn!("Peer rejected after upgrade: {}", e),
        }
    });

    if let Ok(uuid) = HeaderValue::from_str(hub.uuid()) {
        response.headers_mut().insert(INSTANCE_UUID, uuid);
    }
    response
        .headers_mut()
        .insert(INSTANCE_PRIORITY, HeaderValue::from(hub.priority()));
    response
}
