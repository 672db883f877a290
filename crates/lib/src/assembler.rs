//! Stream assembler: turns `stream_start / stream_chunk / stream_end` into one message.
//!
//! States are `Idle` and `Streaming`. Chunks are appended in arrival order; the
//! transport is trusted for ordering. Protocol violations are healed here and
//! logged, never surfaced to the caller.

use crate::error::EngineError;
use crate::message::{Message, REPLY_ERROR_TEXT};
use crate::protocol::{EventKind, ServerEvent};
use crate::store::ConversationStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    Idle,
    Streaming,
}

/// Events the assembler consumes.
pub const ASSEMBLER_EVENTS: &[EventKind] = &[
    EventKind::Connected,
    EventKind::Registered,
    EventKind::Snapshot,
    EventKind::AiResponse,
    EventKind::StreamStart,
    EventKind::StreamChunk,
    EventKind::StreamEnd,
    EventKind::Error,
    EventKind::Disconnected,
];

pub struct StreamAssembler {
    store: Arc<ConversationStore>,
    state: AssemblerState,
}

impl StreamAssembler {
    pub fn new(store: Arc<ConversationStore>) -> Self {
        Self {
            store,
            state: AssemblerState::Idle,
        }
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    /// Consume events until the channel closes or `cancel` fires.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ServerEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                }
            }
        }
        log::debug!("stream assembler stopped");
    }

    pub async fn handle(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected { message } => log::info!("stream connected: {}", message),
            ServerEvent::Registered { session_id } => {
                log::info!("session {} registered with backend", session_id)
            }
            ServerEvent::Snapshot(messages) => {
                self.store.replace_all(messages).await;
                self.resync().await;
            }
            ServerEvent::StreamStart => self.start().await,
            ServerEvent::StreamChunk { chunk } => self.chunk(&chunk).await,
            ServerEvent::StreamEnd => self.end().await,
            ServerEvent::AiResponse { response } => self.whole_reply(response).await,
            ServerEvent::Error { reason } => self.fail(&reason, true).await,
            ServerEvent::Disconnected { reason } => self.fail(&reason, false).await,
            ServerEvent::Alert { .. } => {}
        }
    }

    async fn resync(&mut self) {
        self.state = if self.store.streaming_message().await.is_some() {
            AssemblerState::Streaming
        } else {
            AssemblerState::Idle
        };
    }

    async fn start(&mut self) {
        match self.store.append(Message::streaming_placeholder()).await {
            Ok(()) => {}
            Err(EngineError::ProtocolViolation(_)) => {
                log::warn!("protocol violation: stream_start while a reply is streaming; closing the stale reply");
                self.close(|m| m.streaming = false).await;
                if let Err(e) = self.store.append(Message::streaming_placeholder()).await {
                    log::error!("could not open streaming reply: {}", e);
                    self.resync().await;
                    return;
                }
            }
            Err(e) => {
                log::error!("could not open streaming reply: {}", e);
                return;
            }
        }
        self.state = AssemblerState::Streaming;
    }

    async fn chunk(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        match self
            .store
            .mutate_last(|m| m.streaming, |m| m.content.push_str(chunk))
            .await
        {
            Ok(true) => {}
            Ok(false) => log::debug!("stream_chunk with no streaming reply; ignored"),
            Err(e) => log::warn!("stream_chunk not applied: {}", e),
        }
    }

    async fn end(&mut self) {
        if !self.close(|m| m.streaming = false).await {
            log::debug!("stream_end with no streaming reply; ignored");
        }
        self.state = AssemblerState::Idle;
    }

    /// Non-streaming delivery of a whole reply.
    async fn whole_reply(&mut self, response: String) {
        if let Some(current) = self.store.streaming_message().await {
            if current.content.is_empty() {
                // Placeholder opened by stream_start and never fed: the reply completes it.
                let filled = self
                    .close(|m| {
                        m.content = response.clone();
                        m.streaming = false;
                    })
                    .await;
                self.state = AssemblerState::Idle;
                if filled {
                    return;
                }
            } else {
                log::warn!("ai_response while a streamed reply is open; closing it first");
                self.close(|m| m.streaming = false).await;
                self.state = AssemblerState::Idle;
            }
        }
        if let Err(e) = self.store.append(Message::assistant(response)).await {
            log::error!("could not append reply: {}", e);
        }
    }

    /// Backend error (`from_server`) or lost transport.
    async fn fail(&mut self, reason: &str, from_server: bool) {
        log::warn!("reply failed: {}", reason);
        let mut was_empty = None;
        let closed = self
            .close(|m| {
                was_empty = Some(m.content.is_empty());
                m.streaming = false;
                m.error = true;
            })
            .await;
        self.state = AssemblerState::Idle;
        let append_notice = if closed {
            was_empty.unwrap_or(true)
        } else {
            from_server
        };
        if append_notice {
            if let Err(e) = self.store.append(Message::error_notice(REPLY_ERROR_TEXT)).await {
                log::error!("could not append error notice: {}", e);
            }
        }
    }

    /// Apply `update` to the streaming reply. Returns whether one existed.
    async fn close<U>(&self, update: U) -> bool
    where
        U: FnOnce(&mut Message),
    {
        match self.store.mutate_last(|m| m.streaming, update).await {
            Ok(applied) => applied,
            Err(e) => {
                log::error!("could not close streaming reply: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    fn chunk(s: &str) -> ServerEvent {
        ServerEvent::StreamChunk {
            chunk: s.to_string(),
        }
    }

    async fn feed(events: Vec<ServerEvent>) -> (StreamAssembler, Vec<Message>) {
        let store = Arc::new(ConversationStore::new());
        let mut asm = StreamAssembler::new(store.clone());
        for ev in events {
            asm.handle(ev).await;
            let streaming = store
                .snapshot()
                .await
                .iter()
                .filter(|m| m.streaming)
                .count();
            assert!(streaming <= 1, "more than one streaming message");
        }
        let msgs = store.snapshot().await;
        (asm, msgs)
    }

    #[tokio::test]
    async fn chunks_concatenate_in_arrival_order() {
        let (asm, msgs) = feed(vec![
            ServerEvent::StreamStart,
            chunk("Hel"),
            chunk("lo"),
            ServerEvent::StreamEnd,
        ])
        .await;
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "Hello");
        assert!(!msgs[0].streaming);
        assert_eq!(msgs[0].role, Role::Assistant);
        assert_eq!(asm.state(), AssemblerState::Idle);
    }

    #[tokio::test]
    async fn duplicate_start_force_closes_the_stale_reply() {
        let (_, msgs) = feed(vec![
            ServerEvent::StreamStart,
            chunk("A"),
            ServerEvent::StreamStart,
            chunk("B"),
            ServerEvent::StreamEnd,
        ])
        .await;
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "A");
        assert!(!msgs[0].streaming);
        assert_eq!(msgs[1].content, "B");
        assert!(!msgs[1].streaming);
    }

    #[tokio::test]
    async fn chunk_and_end_without_start_are_noops() {
        let (asm, msgs) = feed(vec![chunk("stray"), ServerEvent::StreamEnd]).await;
        assert!(msgs.is_empty());
        assert_eq!(asm.state(), AssemblerState::Idle);
    }

    #[tokio::test]
    async fn whole_reply_appends_complete_message() {
        let (_, msgs) = feed(vec![ServerEvent::AiResponse {
            response: "Drink water.".to_string(),
        }])
        .await;
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "Drink water.");
        assert!(!msgs[0].streaming);
    }

    #[tokio::test]
    async fn whole_reply_fills_an_empty_placeholder() {
        let (asm, msgs) = feed(vec![
            ServerEvent::StreamStart,
            ServerEvent::AiResponse {
                response: "Rest.".to_string(),
            },
        ])
        .await;
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "Rest.");
        assert!(!msgs[0].streaming);
        assert_eq!(asm.state(), AssemblerState::Idle);
    }

    #[tokio::test]
    async fn whole_reply_after_partial_stream_closes_it_and_appends() {
        let (_, msgs) = feed(vec![
            ServerEvent::StreamStart,
            chunk("par"),
            ServerEvent::AiResponse {
                response: "full".to_string(),
            },
        ])
        .await;
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "par");
        assert!(!msgs[0].streaming);
        assert_eq!(msgs[1].content, "full");
    }

    #[tokio::test]
    async fn error_mid_stream_with_content_marks_reply() {
        let (asm, msgs) = feed(vec![
            ServerEvent::StreamStart,
            chunk("partial"),
            ServerEvent::Error {
                reason: "model crashed".to_string(),
            },
        ])
        .await;
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].error && !msgs[0].streaming);
        assert_eq!(msgs[0].content, "partial");
        assert_eq!(asm.state(), AssemblerState::Idle);
    }

    #[tokio::test]
    async fn error_before_any_content_appends_notice() {
        let (_, msgs) = feed(vec![
            ServerEvent::StreamStart,
            ServerEvent::Disconnected {
                reason: "reset".to_string(),
            },
        ])
        .await;
        assert_eq!(msgs.len(), 2);
        assert!(msgs[0].error && !msgs[0].streaming);
        assert_eq!(msgs[1].content, REPLY_ERROR_TEXT);
        assert!(msgs[1].error);
        assert_eq!(msgs[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn server_error_while_idle_appends_notice_but_disconnect_does_not() {
        let (_, msgs) = feed(vec![ServerEvent::Error {
            reason: "history unavailable".to_string(),
        }])
        .await;
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].error);

        let (_, msgs) = feed(vec![ServerEvent::Disconnected {
            reason: "closed".to_string(),
        }])
        .await;
        assert!(msgs.is_empty());
    }

    #[tokio::test]
    async fn snapshot_resyncs_state() {
        let store = Arc::new(ConversationStore::new());
        let mut asm = StreamAssembler::new(store.clone());
        asm.handle(ServerEvent::StreamStart).await;
        assert_eq!(asm.state(), AssemblerState::Streaming);
        asm.handle(ServerEvent::Snapshot(Vec::new())).await;
        // Local streaming reply is newer than an empty snapshot and survives.
        assert_eq!(asm.state(), AssemblerState::Streaming);
        asm.handle(chunk("x")).await;
        asm.handle(ServerEvent::StreamEnd).await;
        assert_eq!(store.snapshot().await[0].content, "x");
    }

    #[tokio::test]
    async fn snapshot_with_open_entries_keeps_one_streaming_reply() {
        let frame = r#"{"event":"new_message","payload":[
            {"role":"ai","content":"a","time":"2024-01-01T00:00:00.000000","streaming":true},
            {"role":"ai","content":"b","time":"2024-01-01T00:00:01.000000","streaming":true}
        ]}"#;
        let snapshot = ServerEvent::from_frame(frame).unwrap();

        let (asm, msgs) = feed(vec![snapshot.clone()]).await;
        assert!(msgs.iter().all(|m| !m.streaming));
        assert_eq!(asm.state(), AssemblerState::Idle);

        let (asm, msgs) = feed(vec![ServerEvent::StreamStart, snapshot, chunk("c")]).await;
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs.iter().filter(|m| m.streaming).count(), 1);
        assert_eq!(msgs[2].content, "c");
        assert_eq!(asm.state(), AssemblerState::Streaming);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let store = Arc::new(ConversationStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let mut rev = store.subscribe();
        let task = tokio::spawn(StreamAssembler::new(store.clone()).run(rx, cancel.clone()));
        tx.send(ServerEvent::AiResponse {
            response: "ok".to_string(),
        })
        .unwrap();
        rev.changed().await.unwrap();
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(store.len().await, 1);
    }
}
