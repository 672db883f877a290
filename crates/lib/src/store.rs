//! Conversation store: the ordered, append-only message log.
//!
//! Both the stream assembler and the upload coordinator write here, so every
//! mutation checks the single-streaming-message invariant under the write lock.
//! Readers get whole-message clones; they never observe a half-applied update.

use crate::error::EngineError;
use crate::message::Message;
use tokio::sync::{watch, RwLock};

pub struct ConversationStore {
    messages: RwLock<Vec<Message>>,
    /// Bumped after every committed mutation.
    revision: watch::Sender<u64>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            messages: RwLock::new(Vec::new()),
            revision,
        }
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    /// Change notifications for passive readers (the value is a revision counter).
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub async fn snapshot(&self) -> Vec<Message> {
        self.messages.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }

    /// The in-flight reply, if any.
    pub async fn streaming_message(&self) -> Option<Message> {
        self.messages
            .read()
            .await
            .iter()
            .rev()
            .find(|m| m.streaming)
            .cloned()
    }

    /// Append at the end. Rejects a second concurrently streaming message.
    pub async fn append(&self, message: Message) -> Result<(), EngineError> {
        let mut messages = self.messages.write().await;
        if message.streaming && messages.iter().any(|m| m.streaming) {
            return Err(EngineError::ProtocolViolation(
                "a reply is already streaming".to_string(),
            ));
        }
        messages.push(message);
        drop(messages);
        self.bump();
        Ok(())
    }

    /// Atomically update the last message matching `predicate`.
    ///
    /// Returns `Ok(false)` when nothing matches. Finalized messages are immutable, and
    /// the update is validated on a copy before it is committed.
    pub async fn mutate_last<P, U>(&self, predicate: P, updater: U) -> Result<bool, EngineError>
    where
        P: Fn(&Message) -> bool,
        U: FnOnce(&mut Message),
    {
        let mut messages = self.messages.write().await;
        let Some(index) = messages.iter().rposition(|m| predicate(m)) else {
            return Ok(false);
        };
        if !messages[index].streaming {
            return Err(EngineError::ImmutableMessage);
        }
        let mut updated = messages[index].clone();
        updater(&mut updated);
        if updated.streaming
            && messages
                .iter()
                .enumerate()
                .any(|(i, m)| i != index && m.streaming)
        {
            return Err(EngineError::ProtocolViolation(
                "update would leave two streaming replies".to_string(),
            ));
        }
        messages[index] = updated;
        drop(messages);
        self.bump();
        Ok(true)
    }

    /// Hold the write lock; commits wait until the guard is dropped.
    #[cfg(test)]
    pub(crate) async fn write_guard(&self) -> tokio::sync::RwLockWriteGuard<'_, Vec<Message>> {
        self.messages.write().await
    }

    /// Replace history with the server's snapshot, keeping local entries the snapshot
    /// cannot know about yet.
    ///
    /// Snapshot entries are history and arrive closed, whatever their `streaming` flag
    /// says. A local entry survives when it is dated after the newest snapshot entry and
    /// the snapshot holds no message with the same role and content. Survivors keep their
    /// order and go after the snapshot.
    pub async fn replace_all(&self, snapshot: Vec<Message>) {
        let mut messages = self.messages.write().await;
        let latest = snapshot.iter().map(|m| m.created_at).max();
        let survivors: Vec<Message> = messages
            .drain(..)
            .filter(|m| m.local)
            .filter(|m| latest.map_or(true, |t| m.created_at > t))
            .filter(|m| {
                !snapshot
                    .iter()
                    .any(|s| s.role == m.role && s.content == m.content)
            })
            .collect();
        let kept = survivors.len();
        *messages = snapshot
            .into_iter()
            .map(|m| Message {
                local: false,
                streaming: false,
                ..m
            })
            .collect();
        messages.extend(survivors);
        log::debug!(
            "conversation replaced: {} message(s), {} local kept",
            messages.len(),
            kept
        );
        drop(messages);
        self.bump();
    }
}
