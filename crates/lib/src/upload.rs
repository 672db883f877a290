//! Upload coordinator: text + file submissions over HTTP, alongside the realtime channel.
//!
//! `submit` validates locally, claims the single upload slot, appends the optimistic
//! user message, and only then starts the network operation on its own task. Progress
//! is monotonic per correlation id; callbacks for a cancelled or superseded upload are
//! ignored.

use crate::config::UploadConfig;
use crate::connection::ConnectionManager;
use crate::error::EngineError;
use crate::message::{Message, SUBMIT_ERROR_TEXT};
use crate::store::ConversationStore;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Size of the body pieces handed to the HTTP client; progress is reported per piece.
const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

pub type CorrelationId = String;

/// Progress sink handed to an [`Uploader`]: percent in `0..=100`.
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Idle,
    Uploading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub correlation_id: CorrelationId,
    /// File name of the staged file, if any.
    pub file_ref: Option<String>,
    pub text_payload: Option<String>,
    pub progress_percent: u8,
    pub phase: UploadPhase,
    /// Why the upload failed; `None` while running, on success, or when cancelled.
    pub failure: Option<EngineError>,
}

/// A file staged for submission.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub mime: Option<String>,
    pub data: Vec<u8>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, mime: Option<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime,
            data,
        }
    }

    /// Read a file from disk; the MIME type is guessed from the extension. Files over
    /// `max_bytes` are rejected from their metadata, without being read.
    pub async fn from_path(path: &Path, max_bytes: u64) -> Result<Self, UploadError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let size = tokio::fs::metadata(path).await?.len();
        if size > max_bytes {
            return Err(FileRejection::TooLarge {
                name,
                size,
                limit: max_bytes,
            }
            .into());
        }
        let data = tokio::fs::read(path).await?;
        let mime = mime_for_name(&name).map(str::to_string);
        Ok(Self { name, mime, data })
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn extension(&self) -> Option<String> {
        extension_of(&self.name)
    }
}

fn extension_of(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    Some(format!(".{}", ext.to_lowercase()))
}

fn mime_for_name(name: &str) -> Option<&'static str> {
    match extension_of(name)?.as_str() {
        ".txt" => Some("text/plain"),
        ".pdf" => Some("application/pdf"),
        ".md" => Some("text/markdown"),
        ".csv" => Some("text/csv"),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileRejection {
    #[error("{name} is {size} bytes; the limit is {limit}")]
    TooLarge { name: String, size: u64, limit: u64 },
    #[error("{name} is not a supported file type")]
    UnsupportedType { name: String },
}

/// Check a file against the allow-list and size ceiling. Either the MIME type or the
/// extension has to be allowed.
pub fn validate_file(file: &UploadFile, limits: &UploadConfig) -> Result<(), FileRejection> {
    let mime_ok = file
        .mime
        .as_deref()
        .is_some_and(|m| limits.allowed_mime_types.iter().any(|a| a.eq_ignore_ascii_case(m)));
    let ext_ok = file.extension().is_some_and(|ext| {
        limits
            .allowed_extensions
            .iter()
            .any(|a| a.eq_ignore_ascii_case(&ext))
    });
    if !mime_ok && !ext_ok {
        return Err(FileRejection::UnsupportedType {
            name: file.name.clone(),
        });
    }
    if file.size() > limits.max_file_bytes {
        return Err(FileRejection::TooLarge {
            name: file.name.clone(),
            size: file.size(),
            limit: limits.max_file_bytes,
        });
    }
    Ok(())
}

/// One submission as handed to the uploader.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub correlation_id: CorrelationId,
    pub session_id: String,
    pub text: Option<String>,
    pub file: Option<UploadFile>,
}

/// Server acknowledgment of a submission.
#[derive(Debug, Clone, Default)]
pub struct UploadAck {
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("cannot read file: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rejected(#[from] FileRejection),
    #[error("{0}")]
    Other(String),
}

/// Performs the network part of a submission.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, request: UploadRequest, progress: ProgressFn)
        -> Result<UploadAck, UploadError>;
}

/// Multipart POST to the backend's message endpoint.
#[derive(Clone)]
pub struct HttpUploader {
    endpoint: String,
    bearer: Option<String>,
    client: reqwest::Client,
}

impl HttpUploader {
    pub fn new(endpoint: impl Into<String>, bearer: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            bearer,
            client: reqwest::Client::new(),
        }
    }

    fn file_part(file: UploadFile, progress: ProgressFn) -> Result<reqwest::multipart::Part, UploadError> {
        let total = file.data.len().max(1) as u64;
        let pieces: Vec<Vec<u8>> = file
            .data
            .chunks(UPLOAD_CHUNK_BYTES)
            .map(<[u8]>::to_vec)
            .collect();
        let mut sent: u64 = 0;
        let body = futures_util::stream::iter(pieces).map(move |piece| {
            sent += piece.len() as u64;
            progress(((sent * 100) / total).min(100) as u8);
            Ok::<_, std::io::Error>(piece)
        });
        let part = reqwest::multipart::Part::stream_with_length(
            reqwest::Body::wrap_stream(body),
            file.data.len() as u64,
        )
        .file_name(file.name);
        match file.mime {
            Some(mime) => part
                .mime_str(&mime)
                .map_err(|e| UploadError::Other(format!("invalid mime type {}: {}", mime, e))),
            None => Ok(part),
        }
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(
        &self,
        request: UploadRequest,
        progress: ProgressFn,
    ) -> Result<UploadAck, UploadError> {
        let mut form = reqwest::multipart::Form::new().text("user_id", request.session_id);
        if let Some(text) = request.text {
            form = form.text("user_input", text);
        }
        if let Some(file) = request.file {
            form = form.part("user_uploaded_file", Self::file_part(file, progress)?);
        }
        let mut req = self.client.post(&self.endpoint).multipart(form);
        if let Some(ref token) = self.bearer {
            req = req.bearer_auth(token);
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(UploadError::Status { status, body });
        }
        let body = res.json::<serde_json::Value>().await.ok();
        Ok(UploadAck { body })
    }
}

struct ActiveUpload {
    correlation_id: CorrelationId,
    cancel: CancellationToken,
}

struct Inner {
    store: Arc<ConversationStore>,
    connection: ConnectionManager,
    uploader: Arc<dyn Uploader>,
    limits: UploadConfig,
    session_id: String,
    session: watch::Sender<Option<UploadSession>>,
    active: Mutex<Option<ActiveUpload>>,
    cancel: CancellationToken,
}

/// Runs at most one submission at a time. Cheap to clone.
#[derive(Clone)]
pub struct UploadCoordinator {
    inner: Arc<Inner>,
}

impl UploadCoordinator {
    pub fn new(
        store: Arc<ConversationStore>,
        connection: ConnectionManager,
        uploader: Arc<dyn Uploader>,
        limits: UploadConfig,
        session_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        let (session, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                store,
                connection,
                uploader,
                limits,
                session_id: session_id.into(),
                session,
                active: Mutex::new(None),
                cancel,
            }),
        }
    }

    /// Current (or last) upload session.
    pub fn session(&self) -> Option<UploadSession> {
        self.inner.session.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<UploadSession>> {
        self.inner.session.subscribe()
    }

    pub fn limits(&self) -> &UploadConfig {
        &self.inner.limits
    }

    pub fn is_uploading(&self) -> bool {
        matches!(
            self.inner.session.borrow().as_ref().map(|s| s.phase),
            Some(UploadPhase::Uploading)
        )
    }

    /// Submit text and/or a file. Returns the correlation id once the optimistic message
    /// is in the conversation and the upload has been started.
    pub async fn submit(
        &self,
        text: Option<String>,
        file: Option<UploadFile>,
    ) -> Result<CorrelationId, EngineError> {
        let text = text.filter(|t| !t.trim().is_empty());
        if text.is_none() && file.is_none() {
            return Err(EngineError::EmptySubmission);
        }
        if !self.inner.connection.is_connected() {
            return Err(EngineError::NotConnected);
        }
        if let Some(ref f) = file {
            validate_file(f, &self.inner.limits).map_err(|rejection| {
                log::info!("upload rejected locally: {}", rejection);
                EngineError::FileRejected(rejection)
            })?;
        }

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let cancel = self.inner.cancel.child_token();
        {
            // `active` is held across the claim: `cancel` sees every claimed upload.
            let mut active = lock(&self.inner.active);
            let claimed = self.inner.session.send_if_modified(|current| {
                if matches!(current, Some(s) if s.phase == UploadPhase::Uploading) {
                    return false;
                }
                *current = Some(UploadSession {
                    correlation_id: correlation_id.clone(),
                    file_ref: file.as_ref().map(|f| f.name.clone()),
                    text_payload: text.clone(),
                    progress_percent: 0,
                    phase: UploadPhase::Uploading,
                    failure: None,
                });
                true
            });
            if !claimed {
                return Err(EngineError::UploadInProgress);
            }
            *active = Some(ActiveUpload {
                correlation_id: correlation_id.clone(),
                cancel: cancel.clone(),
            });
        }

        let optimistic = match (&text, &file) {
            (Some(t), _) => t.clone(),
            (None, Some(f)) => format!("Uploaded file: {}", f.name),
            (None, None) => String::new(),
        };
        if let Err(e) = self.inner.store.append(Message::user(optimistic)).await {
            self.on_failure(&correlation_id, e.clone()).await;
            return Err(e);
        }
        if cancel.is_cancelled() {
            log::debug!("upload {} cancelled before it started", correlation_id);
            return Ok(correlation_id);
        }

        let request = UploadRequest {
            correlation_id: correlation_id.clone(),
            session_id: self.inner.session_id.clone(),
            text,
            file,
        };
        let progress: ProgressFn = {
            let this = self.clone();
            let id = correlation_id.clone();
            let cancel = cancel.clone();
            Arc::new(move |percent| {
                if !cancel.is_cancelled() {
                    this.on_progress(&id, percent);
                }
            })
        };
        let this = self.clone();
        let id = correlation_id.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => None,
                r = this.inner.uploader.upload(request, progress) => Some(r),
            };
            match result {
                None => log::debug!("upload {} cancelled", id),
                Some(_) if cancel.is_cancelled() => {}
                Some(Ok(_)) => this.on_complete(&id),
                Some(Err(e)) => this.on_failure(&id, e.into()).await,
            }
        });
        log::debug!("upload {} started", correlation_id);
        Ok(correlation_id)
    }

    /// Record progress. Ignored unless `correlation_id` is the active upload; never
    /// moves backwards.
    pub fn on_progress(&self, correlation_id: &str, percent: u8) {
        let percent = percent.min(100);
        self.inner.session.send_if_modified(|current| match current {
            Some(s)
                if s.correlation_id == correlation_id
                    && s.phase == UploadPhase::Uploading
                    && percent > s.progress_percent =>
            {
                s.progress_percent = percent;
                true
            }
            _ => false,
        });
    }

    pub fn on_complete(&self, correlation_id: &str) {
        let done = self.inner.session.send_if_modified(|current| match current {
            Some(s) if s.correlation_id == correlation_id && s.phase == UploadPhase::Uploading => {
                s.progress_percent = 100;
                s.phase = UploadPhase::Completed;
                true
            }
            _ => false,
        });
        if done {
            self.release(correlation_id);
            log::debug!("upload {} completed", correlation_id);
        }
    }

    /// Mark the upload failed and append a visible error reply. The optimistic user
    /// message stays in place; `error` is kept on the session.
    pub async fn on_failure(&self, correlation_id: &str, error: EngineError) {
        let reason = error.to_string();
        let failed = self.inner.session.send_if_modified(|current| match current {
            Some(s) if s.correlation_id == correlation_id && s.phase == UploadPhase::Uploading => {
                s.phase = UploadPhase::Failed;
                s.failure = Some(error);
                true
            }
            _ => false,
        });
        if !failed {
            return;
        }
        self.release(correlation_id);
        log::warn!("upload {} failed: {}", correlation_id, reason);
        if let Err(e) = self
            .inner
            .store
            .append(Message::error_notice(SUBMIT_ERROR_TEXT))
            .await
        {
            log::error!("could not append upload error notice: {}", e);
        }
    }

    /// Cancel the active upload, if any. No message is appended and later callbacks
    /// for it are ignored.
    pub fn cancel(&self) {
        let Some(active) = lock(&self.inner.active).take() else {
            return;
        };
        active.cancel.cancel();
        self.inner.session.send_if_modified(|current| match current {
            Some(s) if s.correlation_id == active.correlation_id && s.phase == UploadPhase::Uploading => {
                s.phase = UploadPhase::Failed;
                true
            }
            _ => false,
        });
        log::debug!("upload {} cancelled", active.correlation_id);
    }

    fn release(&self, correlation_id: &str) {
        let mut active = lock(&self.inner.active);
        if active
            .as_ref()
            .is_some_and(|a| a.correlation_id == correlation_id)
        {
            active.take();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
