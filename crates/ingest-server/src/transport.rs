//! Transport halves used by a session.
//!
//! A WebSocket is split into a [`FrameReader`] (owned by the receive loop)
//! and a [`FrameWriter`] (owned by the liveness watcher, then handed back to
//! the coordinator for the final close). Both halves report into a shared
//! [`LinkMonitor`] so the watcher learns about transport trouble without
//! polling.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use ingest_core::TransportError;

/// A frame as the session sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Binary or text payload.
    Data(Bytes),
    /// Peer-initiated close handshake.
    Close(Option<CloseInfo>),
    /// Ping/pong; only refreshes liveness.
    Control,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Wait for the next frame. `None` once the stream has ended.
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;
}

#[async_trait]
pub trait FrameWriter: Send + 'static {
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Send a close frame (echoing `close` when given) and shut the sink.
    async fn close(&mut self, close: Option<CloseInfo>) -> Result<(), TransportError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Open,
    Aborted,
}

#[derive(Clone, Copy, Debug)]
pub struct LinkStatus {
    pub state: LinkState,
    pub last_seen: Instant,
    /// The reader is parked on a full queue and is not reading the socket,
    /// so silence says nothing about the peer.
    pub held: bool,
}

/// Shared view of the transport's health.
///
/// `touch` records activity without waking subscribers; state changes
/// (`abort`, `hold`, `release`) notify them.
#[derive(Clone)]
pub struct LinkMonitor {
    tx: Arc<watch::Sender<LinkStatus>>,
}

impl LinkMonitor {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LinkStatus {
            state: LinkState::Open,
            last_seen: Instant::now(),
            held: false,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.tx.subscribe()
    }

    pub fn touch(&self) {
        self.tx.send_if_modified(|status| {
            status.last_seen = Instant::now();
            false
        });
    }

    /// The reader stopped reading because the queue is full.
    pub fn hold(&self) {
        self.tx.send_if_modified(|status| !std::mem::replace(&mut status.held, true));
    }

    /// The reader is back on the socket; the idle clock restarts from now.
    pub fn release(&self) {
        self.tx.send_if_modified(|status| {
            status.last_seen = Instant::now();
            std::mem::replace(&mut status.held, false)
        });
    }

    /// Mark the link as gone. Returns true only for the first call.
    pub fn abort(&self) -> bool {
        self.tx.send_if_modified(|status| {
            if status.state == LinkState::Aborted {
                return false;
            }
            status.state = LinkState::Aborted;
            true
        })
    }

    pub fn state(&self) -> LinkState {
        self.tx.borrow().state
    }
}

impl Default for LinkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Read half of an accepted WebSocket.
pub struct WsReader {
    inner: SplitStream<WebSocket>,
    monitor: LinkMonitor,
}

/// Write half of an accepted WebSocket.
pub struct WsWriter {
    inner: SplitSink<WebSocket, WsMessage>,
    monitor: LinkMonitor,
}

/// Split a socket into the halves a session runs on.
pub fn split_socket(socket: WebSocket) -> (WsReader, WsWriter, LinkMonitor) {
    let monitor = LinkMonitor::new();
    let (sink, stream) = socket.split();
    (
        WsReader {
            inner: stream,
            monitor: monitor.clone(),
        },
        WsWriter {
            inner: sink,
            monitor: monitor.clone(),
        },
        monitor,
    )
}

#[async_trait]
impl FrameReader for WsReader {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        match self.inner.next().await {
            Some(Ok(msg)) => {
                self.monitor.touch();
                let frame = match msg {
                    WsMessage::Binary(bytes) => Frame::Data(bytes),
                    WsMessage::Text(text) => Frame::Data(Bytes::copy_from_slice(text.as_str().as_bytes())),
                    WsMessage::Close(close) => Frame::Close(close.map(|c| CloseInfo {
                        code: c.code,
                        reason: c.reason.as_str().to_string(),
                    })),
                    WsMessage::Ping(_) | WsMessage::Pong(_) => Frame::Control,
                };
                Some(Ok(frame))
            }
            Some(Err(e)) => {
                self.monitor.abort();
                Some(Err(TransportError::Reset(e.to_string())))
            }
            None => {
                self.monitor.abort();
                None
            }
        }
    }
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn ping(&mut self) -> Result<(), TransportError> {
        if let Err(e) = self.inner.send(WsMessage::Ping(Bytes::new())).await {
            self.monitor.abort();
            return Err(TransportError::Reset(e.to_string()));
        }
        Ok(())
    }

    async fn close(&mut self, close: Option<CloseInfo>) -> Result<(), TransportError> {
        let frame = close.map(|c| CloseFrame {
            code: c.code,
            reason: c.reason.into(),
        });
        let sent = self.inner.send(WsMessage::Close(frame)).await;
        let closed = self.inner.close().await;
        sent.and(closed)
            .map_err(|e| TransportError::Reset(e.to_string()))
    }
}
