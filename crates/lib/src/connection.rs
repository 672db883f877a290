//! Connection manager: one realtime channel per active session.
//!
//! State machine: `Disconnected -> Connecting -> Connected -> Disconnected`; a link
//! lost to the transport drops straight to `Disconnected`. Registration is sent
//! before the reader task starts, so no event can slip between "connected" and
//! "registered". Inbound frames are parsed once and fanned out to subscribers.

use crate::error::EngineError;
use crate::protocol::{ClientEvent, EventKind, ServerEvent};
use crate::transport::{Transport, TransportError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Identifies one logical channel. Returned again by idempotent `connect` calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub id: u64,
    pub session_id: String,
}

struct ActiveLink {
    handle: ConnectionHandle,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    pump: Option<JoinHandle<()>>,
}

impl ActiveLink {
    fn release(self) {
        self.cancel.cancel();
        self.reader.abort();
        if let Some(pump) = self.pump {
            pump.abort();
        }
    }
}

struct Subscriber {
    kinds: Vec<EventKind>,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    registration_events: Vec<String>,
    state: watch::Sender<ConnectionState>,
    active: tokio::sync::Mutex<Option<ActiveLink>>,
    /// Outbound half of the live link; `None` whenever emitting is illegal.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    subscribers: Mutex<Vec<Subscriber>>,
    /// Id of the link whose reader may still report loss.
    live_link: AtomicU64,
    next_link: AtomicU64,
    registrations: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn send_frame(&self, event: &ClientEvent) -> Result<(), EngineError> {
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(EngineError::NotConnected);
        }
        let frame = event
            .to_frame()
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        let outbound = lock(&self.outbound);
        let tx = outbound.as_ref().ok_or(EngineError::NotConnected)?;
        tx.send(frame).map_err(|_| EngineError::NotConnected)
    }

    fn dispatch(&self, event: ServerEvent) {
        let kind = event.kind();
        let mut subs = lock(&self.subscribers);
        subs.retain(|s| {
            if !s.kinds.contains(&kind) {
                return !s.tx.is_closed();
            }
            s.tx.send(event.clone()).is_ok()
        });
    }

    /// Transport went away underneath a live link.
    fn link_lost(&self, link_id: u64, reason: String) {
        if self
            .live_link
            .compare_exchange(link_id, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        lock(&self.outbound).take();
        self.set_state(ConnectionState::Disconnected);
        log::warn!("channel lost: {}", reason);
        self.dispatch(ServerEvent::Disconnected { reason });
    }
}

/// Owns the realtime channel for one session. Cheap to clone; clones share the channel.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, registration_events: Vec<String>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                transport,
                registration_events,
                state,
                active: tokio::sync::Mutex::new(None),
                outbound: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                live_link: AtomicU64::new(0),
                next_link: AtomicU64::new(1),
                registrations: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of session registrations sent over the lifetime of this manager.
    pub fn registrations(&self) -> u64 {
        self.inner.registrations.load(Ordering::SeqCst)
    }

    /// Open the channel for `session_id` and register the session.
    ///
    /// Idempotent: while connecting or connected for the same session this returns the
    /// existing handle without opening a second transport or registering again.
    pub async fn connect(&self, session_id: &str) -> Result<ConnectionHandle, EngineError> {
        let mut active = self.inner.active.lock().await;
        if let Some(link) = active.as_ref() {
            if link.handle.session_id == session_id && self.state() != ConnectionState::Disconnected {
                return Ok(link.handle.clone());
            }
        }
        if let Some(stale) = active.take() {
            log::debug!("releasing previous link {}", stale.handle.id);
            self.inner.live_link.store(0, Ordering::SeqCst);
            lock(&self.inner.outbound).take();
            stale.release();
        }

        self.inner.set_state(ConnectionState::Connecting);
        let link = match self.inner.transport.open().await {
            Ok(link) => link,
            Err(e) => {
                self.inner.set_state(ConnectionState::Disconnected);
                log::warn!("connect failed: {}", e);
                return Err(e.into());
            }
        };

        let handle = ConnectionHandle {
            id: self.inner.next_link.fetch_add(1, Ordering::SeqCst),
            session_id: session_id.to_string(),
        };
        *lock(&self.inner.outbound) = Some(link.outbound.clone());
        self.inner.live_link.store(handle.id, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Connected);

        // No await between Connected and the registration frames.
        for event in &self.inner.registration_events {
            let register = ClientEvent::Register {
                event: event.clone(),
                session_id: session_id.to_string(),
            };
            if let Err(e) = self.inner.send_frame(&register) {
                self.inner.live_link.store(0, Ordering::SeqCst);
                lock(&self.inner.outbound).take();
                self.inner.set_state(ConnectionState::Disconnected);
                if let Some(task) = link.task {
                    task.abort();
                }
                return Err(e);
            }
        }
        self.inner.registrations.fetch_add(1, Ordering::SeqCst);
        log::info!("channel connected, session {} registered", session_id);

        let cancel = CancellationToken::new();
        let reader = tokio::spawn(read_loop(
            self.inner.clone(),
            link.inbound,
            cancel.clone(),
            handle.id,
        ));
        *active = Some(ActiveLink {
            handle: handle.clone(),
            cancel,
            reader,
            pump: link.task,
        });
        Ok(handle)
    }

    /// Send one event. Fails with `NotConnected` unless the channel is connected.
    pub fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), EngineError> {
        self.inner.send_frame(&ClientEvent::Custom {
            event: event.to_string(),
            payload,
        })
    }

    /// Receive every event of the given kinds, in arrival order.
    pub fn subscribe(&self, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.subscribers).push(Subscriber {
            kinds: kinds.to_vec(),
            tx,
        });
        rx
    }

    /// Callback form of [`subscribe`](Self::subscribe). The handler runs on its own task
    /// until the subscription is released or the returned handle is aborted.
    pub fn on<F>(&self, kind: EventKind, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(ServerEvent) + Send + 'static,
    {
        let mut rx = self.subscribe(&[kind]);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler(event);
            }
        })
    }

    /// Close the channel and release every subscription. Idempotent.
    pub async fn disconnect(&self) {
        let mut active = self.inner.active.lock().await;
        self.inner.live_link.store(0, Ordering::SeqCst);
        lock(&self.inner.outbound).take();
        if let Some(link) = active.take() {
            log::info!("channel {} disconnected", link.handle.id);
            link.release();
        }
        lock(&self.inner.subscribers).clear();
        self.inner.set_state(ConnectionState::Disconnected);
    }
}

async fn read_loop(
    inner: Arc<Inner>,
    mut inbound: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    cancel: CancellationToken,
    link_id: u64,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            frame = inbound.recv() => match frame {
                Some(Ok(text)) => match ServerEvent::from_frame(&text) {
                    Ok(event) => inner.dispatch(event),
                    Err(e) => log::debug!("dropping frame: {}", e),
                },
                Some(Err(e)) => {
                    inner.link_lost(link_id, e.to_string());
                    return;
                }
                None => {
                    inner.link_lost(link_id, "transport closed".to_string());
                    return;
                }
            }
        }
    }
}
