//! Transports: the byte-level side of the realtime channel.
//!
//! A [`Transport`] opens one [`TransportLink`] per connect. The link is a pair of
//! channels plus the pump task that owns the socket; the connection manager never
//! touches the socket directly.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
}

/// One live channel to the backend.
pub struct TransportLink {
    /// Text frames to the server. Unbounded so emitting never suspends.
    pub outbound: mpsc::UnboundedSender<String>,
    /// Text frames from the server; `None` once the link is gone.
    pub inbound: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    /// Task owning the underlying socket, aborted on disconnect.
    pub task: Option<JoinHandle<()>>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Complete the handshake and return a live link.
    async fn open(&self) -> Result<TransportLink, TransportError>;
}

/// WebSocket transport (JSON text frames).
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self) -> Result<TransportLink, TransportError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        log::debug!("websocket open: {}", self.url);
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    out = out_rx.recv() => {
                        let Some(text) = out else {
                            let _ = sink.close().await;
                            break;
                        };
                        if let Err(e) = sink.send(WsMessage::Text(text)).await {
                            let _ = in_tx.send(Err(TransportError::Send(e.to_string())));
                            break;
                        }
                    }
                    msg = stream.next() => {
                        match msg {
                            Some(Ok(WsMessage::Text(text))) => {
                                if in_tx.send(Ok(text)).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                let _ = in_tx.send(Err(TransportError::Receive(e.to_string())));
                                break;
                            }
                        }
                    }
                }
            }
            log::debug!("websocket pump stopped");
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
            task: Some(task),
        })
    }
}

/// Server side of a [`MemoryTransport`] link.
pub struct MemoryPeer {
    to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Push one event frame to the client. Returns false once the client side is gone.
    pub fn send(&self, event: &str, payload: serde_json::Value) -> bool {
        let frame = serde_json::json!({ "event": event, "payload": payload }).to_string();
        self.to_client.send(Ok(frame)).is_ok()
    }

    /// Push a raw text frame.
    pub fn send_raw(&self, frame: impl Into<String>) -> bool {
        self.to_client.send(Ok(frame.into())).is_ok()
    }

    /// Report a transport failure to the client.
    pub fn fail(&self, reason: &str) -> bool {
        self.to_client
            .send(Err(TransportError::Receive(reason.to_string())))
            .is_ok()
    }

    /// Next frame the client emitted, parsed as JSON. `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        loop {
            let text = self.from_client.recv().await?;
            if let Ok(v) = serde_json::from_str(&text) {
                return Some(v);
            }
        }
    }

    /// Frame already queued by the client, without waiting.
    pub fn try_recv(&mut self) -> Option<serde_json::Value> {
        let text = self.from_client.try_recv().ok()?;
        serde_json::from_str(&text).ok()
    }
}

/// In-process transport: every opened link is handed to a [`MemoryPeer`] receiver.
/// Used by tests and local demos in place of a real backend.
pub struct MemoryTransport {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    opened: AtomicUsize,
    refuse: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers: tx,
                opened: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Number of links opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// When set, `open` fails as if the backend were unreachable.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self) -> Result<TransportLink, TransportError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            to_client: in_tx,
            from_client: out_rx,
        };
        self.peers
            .send(peer)
            .map_err(|_| TransportError::Connect("no peer listening".to_string()))?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
            task: None,
        })
    }
}
