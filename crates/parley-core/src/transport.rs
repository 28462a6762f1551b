//! The physical WebSocket link.
//!
//! A `Transport` opens one link per connection attempt. Each link runs in its
//! own task and reports back over an mpsc channel; every event carries the
//! epoch it was opened with so the connection manager can ignore links it has
//! already given up on.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

/// Generation counter for connection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Self {
        Epoch(self.0 + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Opened,
    Frame(String),
    Error(String),
    /// `clean` means the closing handshake completed
    Closed { clean: bool, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedLinkEvent {
    pub epoch: Epoch,
    pub event: LinkEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    Send(String),
    Close,
}

/// Write side of an open (or opening) link
#[derive(Debug, Clone)]
pub struct LinkHandle {
    commands: mpsc::UnboundedSender<LinkCommand>,
}

impl LinkHandle {
    pub fn new(commands: mpsc::UnboundedSender<LinkCommand>) -> Self {
        Self { commands }
    }

    /// Queue a text frame. False if the link task is gone.
    pub fn send(&self, frame: String) -> bool {
        self.commands.send(LinkCommand::Send(frame)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.commands.send(LinkCommand::Close);
    }
}

pub trait Transport: Send + Sync {
    /// Start opening a link to `url`. Progress is reported on `events`.
    fn open(
        &self,
        url: &str,
        epoch: Epoch,
        events: mpsc::UnboundedSender<TaggedLinkEvent>,
    ) -> LinkHandle;
}

/// tokio-tungstenite backed transport
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

impl Transport for WsTransport {
    fn open(
        &self,
        url: &str,
        epoch: Epoch,
        events: mpsc::UnboundedSender<TaggedLinkEvent>,
    ) -> LinkHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_link(url.to_string(), epoch, events, rx));
        LinkHandle::new(tx)
    }
}

async fn run_link(
    url: String,
    epoch: Epoch,
    events: mpsc::UnboundedSender<TaggedLinkEvent>,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
) {
    let emit = |event: LinkEvent| {
        let _ = events.send(TaggedLinkEvent { epoch, event });
    };

    let ws_stream = match connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!(%url, error = %e, "websocket connect failed");
            emit(LinkEvent::Error(e.to_string()));
            emit(LinkEvent::Closed {
                clean: false,
                reason: e.to_string(),
            });
            return;
        }
    };
    info!(%url, epoch = epoch.0, "websocket connected");
    emit(LinkEvent::Opened);

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(LinkCommand::Send(frame)) => {
                    if let Err(e) = ws_tx.send(WsMessage::Text(frame)).await {
                        warn!(error = %e, "websocket send failed");
                        emit(LinkEvent::Error(e.to_string()));
                        emit(LinkEvent::Closed { clean: false, reason: e.to_string() });
                        return;
                    }
                }
                Some(LinkCommand::Close) | None => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    let _ = ws_tx.close().await;
                    emit(LinkEvent::Closed { clean: true, reason: "closed by client".to_string() });
                    return;
                }
            },
            message = ws_rx.next() => match message {
                Some(Ok(WsMessage::Text(text))) => emit(LinkEvent::Frame(text)),
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => emit(LinkEvent::Frame(text)),
                    Err(_) => debug!("ignoring non-utf8 binary frame"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("code={} reason={}", f.code, f.reason))
                        .unwrap_or_else(|| "remote closed".to_string());
                    info!(%reason, "websocket closed by server");
                    emit(LinkEvent::Closed { clean: true, reason });
                    return;
                }
                // ping/pong are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "websocket read failed");
                    emit(LinkEvent::Error(e.to_string()));
                    emit(LinkEvent::Closed { clean: false, reason: e.to_string() });
                    return;
                }
                None => {
                    emit(LinkEvent::Closed { clean: false, reason: "stream ended".to_string() });
                    return;
                }
            }
        }
    }
}
