//! Composition root: one session's connection, conversation, uploads and notices.
//!
//! The engine owns the single `ConnectionManager` and hands it to the consumers as a
//! dependency. The assembler and notification router each get their own subscription
//! to the same channel; a supervisor task reconnects after the link drops.

use crate::assembler::{StreamAssembler, ASSEMBLER_EVENTS};
use crate::config::{resolve_upload_url, resolve_ws_url, Config, ReconnectConfig};
use crate::connection::{ConnectionHandle, ConnectionManager, ConnectionState};
use crate::error::EngineError;
use crate::notifications::{
    spawn_sweeper, NotificationCenter, NotificationKind, NotificationRouter, NOTIFICATION_EVENTS,
};
use crate::protocol::{EventKind, ServerEvent};
use crate::store::ConversationStore;
use crate::transport::{Transport, WsTransport};
use crate::upload::{CorrelationId, HttpUploader, UploadCoordinator, UploadFile, Uploader};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Engine {
    session_id: String,
    connection: ConnectionManager,
    store: Arc<ConversationStore>,
    notifications: Arc<NotificationCenter>,
    uploads: UploadCoordinator,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Wire every component and start the background consumers. Must be called from
    /// within a tokio runtime. Nothing is connected until [`connect`](Self::connect).
    pub fn new(
        config: &Config,
        session_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        uploader: Arc<dyn Uploader>,
    ) -> Self {
        let session_id = session_id.into();
        let cancel = CancellationToken::new();
        let connection =
            ConnectionManager::new(transport, config.channel.registration_events.clone());
        let store = Arc::new(ConversationStore::new());
        let notifications = Arc::new(NotificationCenter::new(config.notifications.ttl()));
        let uploads = UploadCoordinator::new(
            store.clone(),
            connection.clone(),
            uploader,
            config.uploads.clone(),
            session_id.clone(),
            cancel.child_token(),
        );

        // Subscribe before anything can connect so the first snapshot is never missed.
        let assembler_rx = connection.subscribe(ASSEMBLER_EVENTS);
        let router_rx = connection.subscribe(NOTIFICATION_EVENTS);
        let mut tasks = vec![
            tokio::spawn(StreamAssembler::new(store.clone()).run(assembler_rx, cancel.clone())),
            tokio::spawn(NotificationRouter::new(notifications.clone()).run(router_rx, cancel.clone())),
            spawn_sweeper(
                notifications.clone(),
                config.notifications.sweep_interval(),
                cancel.clone(),
            ),
        ];
        if config.channel.reconnect.enabled {
            let lost_rx = connection.subscribe(&[EventKind::Disconnected]);
            tasks.push(tokio::spawn(supervise(
                connection.clone(),
                notifications.clone(),
                session_id.clone(),
                config.channel.reconnect.clone(),
                lost_rx,
                cancel.clone(),
            )));
        }

        Self {
            session_id,
            connection,
            store,
            notifications,
            uploads,
            cancel,
            tasks: Mutex::new(tasks),
        }
    }

    /// Engine talking to the configured backend over WebSocket and HTTP.
    pub fn from_config(
        config: &Config,
        session_id: impl Into<String>,
        bearer: Option<String>,
    ) -> Self {
        let transport = Arc::new(WsTransport::new(resolve_ws_url(config)));
        let uploader = Arc::new(HttpUploader::new(resolve_upload_url(config), bearer));
        Self::new(config, session_id, transport, uploader)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn notifications(&self) -> &Arc<NotificationCenter> {
        &self.notifications
    }

    pub fn uploads(&self) -> &UploadCoordinator {
        &self.uploads
    }

    pub async fn connect(&self) -> Result<ConnectionHandle, EngineError> {
        self.connection.connect(&self.session_id).await
    }

    pub async fn submit(
        &self,
        text: Option<String>,
        file: Option<UploadFile>,
    ) -> Result<CorrelationId, EngineError> {
        self.uploads.submit(text, file).await
    }

    pub fn dismiss(&self, notification_id: u64) -> bool {
        self.notifications.dismiss(notification_id)
    }

    /// Cancel the pending upload, stop every background task and close the channel.
    /// A reply still streaming is closed with the content received so far. The engine
    /// is inert afterwards.
    pub async fn shutdown(&self) {
        self.uploads.cancel();
        self.cancel.cancel();
        self.connection.disconnect().await;
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                log::debug!("engine task ended abnormally: {}", e);
            }
        }
        match self
            .store
            .mutate_last(|m| m.streaming, |m| m.streaming = false)
            .await
        {
            Ok(true) => log::debug!("closed the reply that was streaming at shutdown"),
            Ok(false) => {}
            Err(e) => log::warn!("could not close streaming reply: {}", e),
        }
        log::info!("engine for session {} shut down", self.session_id);
    }
}

/// Reconnect after every link loss, with linear backoff. Each successful connect
/// registers again, and the backend answers with a fresh snapshot.
async fn supervise(
    connection: ConnectionManager,
    notifications: Arc<NotificationCenter>,
    session_id: String,
    policy: ReconnectConfig,
    mut lost: mpsc::UnboundedReceiver<ServerEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = lost.recv() => {
                if event.is_none() {
                    return;
                }
            }
        }
        let mut attempt = 0;
        loop {
            if connection.state() == ConnectionState::Connected {
                break;
            }
            attempt += 1;
            if attempt > policy.max_attempts {
                log::warn!("giving up reconnecting after {} attempt(s)", policy.max_attempts);
                notifications.push(
                    format!("Could not reconnect after {} attempts", policy.max_attempts),
                    NotificationKind::Connection,
                );
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(policy.delay(attempt)) => {}
            }
            match connection.connect(&session_id).await {
                Ok(handle) => {
                    log::info!("reconnected (link {}, attempt {})", handle.id, attempt);
                    break;
                }
                Err(e) => log::warn!("reconnect attempt {} failed: {}", attempt, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::transport::{MemoryPeer, MemoryTransport};
    use crate::upload::{ProgressFn, UploadAck, UploadError, UploadRequest};
    use async_trait::async_trait;
    use serde_json::json;

    struct AckUploader;

    #[async_trait]
    impl Uploader for AckUploader {
        async fn upload(
            &self,
            _request: UploadRequest,
            progress: ProgressFn,
        ) -> Result<UploadAck, UploadError> {
            progress(100);
            Ok(UploadAck::default())
        }
    }

    async fn wait_for_messages<F>(store: &ConversationStore, done: F) -> Vec<Message>
    where
        F: Fn(&[Message]) -> bool,
    {
        let mut rev = store.subscribe();
        loop {
            let msgs = store.snapshot().await;
            if done(&msgs) {
                return msgs;
            }
            rev.changed().await.unwrap();
        }
    }

    fn engine(config: &Config) -> (Engine, Arc<MemoryTransport>, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (transport, peers) = MemoryTransport::new();
        let transport = Arc::new(transport);
        let engine = Engine::new(config, "u-7", transport.clone(), Arc::new(AckUploader));
        (engine, transport, peers)
    }

    #[tokio::test]
    async fn snapshot_then_streamed_reply_lands_in_the_store() {
        let (engine, _transport, mut peers) = engine(&Config::default());
        engine.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        let register = peer.recv().await.unwrap();
        assert_eq!(register["event"], "register");
        assert_eq!(register["payload"]["session_id"], "u-7");

        peer.send(
            "new_message",
            json!([{ "role": "ai", "content": "Welcome back", "time": "2024-05-01T09:00:00.000000" }]),
        );
        engine.submit(Some("How are my labs?".to_string()), None).await.unwrap();
        peer.send("stream_start", json!({}));
        peer.send("stream_chunk", json!({ "chunk": "All " }));
        peer.send("stream_chunk", json!({ "chunk": "normal." }));
        peer.send("stream_end", json!({}));

        let msgs = wait_for_messages(engine.store(), |m| {
            m.len() == 3 && m[2].content == "All normal." && !m[2].streaming
        })
        .await;
        assert_eq!(msgs[0].content, "Welcome back");
        assert_eq!(msgs[1].content, "How are my labs?");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn alerts_become_notices_not_messages() {
        let (engine, _transport, mut peers) = engine(&Config::default());
        engine.connect().await.unwrap();
        let peer = peers.recv().await.unwrap();
        let mut rev = engine.notifications().subscribe();
        peer.send(
            "schedule_alert",
            json!({ "success": true, "reminder_title": "Evening walk" }),
        );
        rev.changed().await.unwrap();
        let active = engine.notifications().active();
        assert_eq!(active[0].title, "Evening walk");
        assert_eq!(active[0].kind, NotificationKind::Reminder);
        assert!(engine.store().is_empty().await);
        assert!(engine.dismiss(active[0].id));
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lost_link_is_reported_and_reconnected() {
        let (engine, transport, mut peers) = engine(&Config::default());
        engine.connect().await.unwrap();
        let first = peers.recv().await.unwrap();
        first.fail("reset by peer");

        let mut second = peers.recv().await.unwrap();
        let register = second.recv().await.unwrap();
        assert_eq!(register["event"], "register");
        assert_eq!(transport.opened(), 2);
        assert_eq!(engine.connection().registrations(), 2);
        assert!(engine.connection().is_connected());
        assert!(engine
            .notifications()
            .active()
            .iter()
            .any(|n| n.kind == NotificationKind::Connection && n.title.contains("reset by peer")));
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_gives_up_after_max_attempts() {
        let mut config = Config::default();
        config.channel.reconnect.max_attempts = 2;
        let (engine, transport, mut peers) = engine(&config);
        engine.connect().await.unwrap();
        let first = peers.recv().await.unwrap();
        let mut rev = engine.notifications().subscribe();
        transport.set_refuse(true);
        first.fail("gone");

        let notice = loop {
            rev.changed().await.unwrap();
            if let Some(n) = engine
                .notifications()
                .active()
                .into_iter()
                .find(|n| n.title.starts_with("Could not reconnect"))
            {
                break n;
            }
        };
        assert_eq!(notice.kind, NotificationKind::Connection);
        assert_eq!(transport.opened(), 1);
        assert_eq!(engine.connection().state(), ConnectionState::Disconnected);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_a_reply_mid_stream() {
        let (engine, _transport, mut peers) = engine(&Config::default());
        engine.connect().await.unwrap();
        let peer = peers.recv().await.unwrap();
        peer.send("stream_start", json!({}));
        peer.send("stream_chunk", json!({ "chunk": "Half a" }));
        wait_for_messages(engine.store(), |m| m.len() == 1 && m[0].content == "Half a").await;

        engine.shutdown().await;
        let msgs = engine.store().snapshot().await;
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "Half a");
        assert!(!msgs[0].streaming);
        assert!(engine.store().streaming_message().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_is_terminal() {
        let (engine, _transport, mut peers) = engine(&Config::default());
        engine.connect().await.unwrap();
        let _peer = peers.recv().await.unwrap();
        engine.shutdown().await;
        assert_eq!(engine.connection().state(), ConnectionState::Disconnected);
        assert_eq!(
            engine.submit(Some("late".to_string()), None).await,
            Err(EngineError::NotConnected)
        );
    }
}
