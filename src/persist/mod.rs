//! Async message persistence: a bounded worker pool that encrypts and
//! writes assistant/user messages to the document store with backpressure,
//! plus a synchronous update path for background-generation state.

pub mod crypto;
pub mod keys;
pub mod store;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::error::GatewayError;
use crate::persist::keys::KeyService;
use crate::persist::store::DocumentStore;

/// Queue-full wait before the final bounded blocking send.
const ENQUEUE_QUICK_WAIT: Duration = Duration::from_secs(5);
const ENQUEUE_FINAL_WAIT: Duration = Duration::from_secs(30);

/// `publicEncryptionKey` marker for plaintext messages.
pub const PLAINTEXT_KEY_MARKER: &str = "none";

/// Tri-state client encryption preference. `Unspecified` keeps backward
/// compatibility with clients that predate the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionPreference {
    Require,
    Forbid,
    #[default]
    Unspecified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Thinking,
    Completed,
    Failed,
}

impl GenerationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thinking => "thinking",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// The handoff structure queued for persistence.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub user_id: String,
    pub chat_id: String,
    pub message_id: String,
    pub is_from_user: bool,
    pub content: String,
    pub encryption: EncryptionPreference,
    pub stopped_by: Option<String>,
    pub stop_reason: Option<String>,
    pub model: Option<String>,
    pub generation_state: GenerationState,
    pub generation_started_at: Option<SystemTime>,
    pub generation_completed_at: Option<SystemTime>,
}

/// Worker-pool sizing and behavior, from the runtime knobs.
#[derive(Debug, Clone)]
pub struct PersistOptions {
    pub workers: usize,
    pub buffer: usize,
    pub op_timeout: Duration,
    pub strict_encryption: bool,
}

impl From<&RuntimeConfig> for PersistOptions {
    fn from(cfg: &RuntimeConfig) -> Self {
        Self {
            workers: cfg.persist_workers,
            buffer: cfg.persist_buffer,
            op_timeout: cfg.persist_op_timeout,
            strict_encryption: cfg.strict_encryption,
        }
    }
}

/// Bounded async writer. `store_async` returns quickly; storage happens on
/// the worker pool. Silent drops are forbidden: a message either enqueues
/// or the caller gets `QueueFull`/`ShuttingDown`.
pub struct MessageWriter {
    tx: mpsc::Sender<StoredMessage>,
    closed: AtomicBool,
    stop: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    store: Arc<dyn DocumentStore>,
    keys: KeyService,
    op_timeout: Duration,
    strict_encryption: bool,
}

impl MessageWriter {
    pub fn new(store: Arc<dyn DocumentStore>, opts: PersistOptions) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(opts.buffer.max(1));
        let writer = Arc::new(Self {
            tx,
            closed: AtomicBool::new(false),
            stop: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            store: store.clone(),
            keys: KeyService::with_cache(store, Duration::from_secs(300)),
            op_timeout: opts.op_timeout,
            strict_encryption: opts.strict_encryption,
        });

        let rx = Arc::new(Mutex::new(rx));
        let handles: Vec<JoinHandle<()>> = (0..opts.workers.max(1))
            .map(|_| tokio::spawn(Self::worker_loop(writer.clone(), rx.clone())))
            .collect();
        // new() runs before any await on the writer, so this never contends
        *writer.workers.try_lock().expect("worker list contended at init") = handles;
        writer
    }

    /// Enqueue protocol: non-blocking send; if full, wait up to 5 s; then
    /// one final blocking send bounded at 30 s; then `QueueFull`.
    pub async fn store_async(&self, msg: StoredMessage) -> Result<(), GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::ShuttingDown);
        }
        let msg = match self.tx.try_send(msg) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(GatewayError::ShuttingDown)
            }
            Err(mpsc::error::TrySendError::Full(msg)) => msg,
        };

        tracing::warn!(
            chat_id = %msg.chat_id,
            message_id = %msg.message_id,
            "persistence queue full — waiting for capacity"
        );
        for wait in [ENQUEUE_QUICK_WAIT, ENQUEUE_FINAL_WAIT] {
            if self.closed.load(Ordering::SeqCst) {
                return Err(GatewayError::ShuttingDown);
            }
            match tokio::time::timeout(wait, self.tx.reserve()).await {
                Ok(Ok(permit)) => {
                    permit.send(msg);
                    return Ok(());
                }
                Ok(Err(_)) => return Err(GatewayError::ShuttingDown),
                Err(_) => {}
            }
        }
        Err(GatewayError::QueueFull)
    }

    /// Synchronous state-transition path for background polling. Bypasses
    /// the queue so `thinking → completed | failed` is visible promptly.
    pub async fn update_generation_state(
        &self,
        user_id: &str,
        chat_id: &str,
        message_id: &str,
        state: GenerationState,
        error: Option<&str>,
        completed_at: Option<SystemTime>,
    ) -> Result<(), GatewayError> {
        let mut fields = json!({
            "generationState": state.as_str(),
            "updatedAt": epoch_millis(SystemTime::now()),
        });
        if let Some(err) = error {
            fields["generationError"] = err.into();
        }
        if let Some(at) = completed_at {
            fields["generationCompletedAt"] = epoch_millis(at).into();
        }
        tokio::time::timeout(
            self.op_timeout,
            self.store
                .update_message(user_id, chat_id, message_id, fields),
        )
        .await
        .map_err(|_| GatewayError::Timeout(self.op_timeout.as_millis() as u64))?
    }

    /// Reject further enqueues, signal workers, and wait for them to drain
    /// the queue.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.stop.cancel();
        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("persistence worker join failed: {e}");
            }
        }
    }

    async fn worker_loop(
        writer: Arc<MessageWriter>,
        rx: Arc<Mutex<mpsc::Receiver<StoredMessage>>>,
    ) {
        loop {
            let msg = {
                let mut rx = rx.lock().await;
                let received = tokio::select! {
                    m = rx.recv() => m,
                    _ = writer.stop.cancelled() => None,
                };
                // after the shutdown signal (or a closed channel), drain
                // whatever is still queued before exiting
                match received {
                    Some(m) => Some(m),
                    None => rx.try_recv().ok(),
                }
            };
            let Some(msg) = msg else { break };

            match tokio::time::timeout(writer.op_timeout, writer.write_message(&msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(
                    user_id = %msg.user_id,
                    chat_id = %msg.chat_id,
                    message_id = %msg.message_id,
                    "message write failed: {e}"
                ),
                Err(_) => tracing::error!(
                    user_id = %msg.user_id,
                    chat_id = %msg.chat_id,
                    message_id = %msg.message_id,
                    "message write timed out"
                ),
            }
        }
    }

    async fn write_message(&self, msg: &StoredMessage) -> Result<(), GatewayError> {
        let require = msg.encryption == EncryptionPreference::Require
            || (self.strict_encryption && msg.encryption == EncryptionPreference::Unspecified);

        let (content, encrypted, key_marker) = match msg.encryption {
            EncryptionPreference::Forbid => (
                msg.content.clone(),
                String::new(),
                PLAINTEXT_KEY_MARKER.to_string(),
            ),
            _ => match self.keys.lookup(&msg.user_id).await? {
                Some(key) => {
                    let ciphertext =
                        crypto::encrypt_message(&key.public_jwk, msg.content.as_bytes())?;
                    (String::new(), ciphertext, key.public_jwk)
                }
                None if require => {
                    return Err(GatewayError::EncryptionRequired(msg.user_id.clone()))
                }
                None => (
                    msg.content.clone(),
                    String::new(),
                    PLAINTEXT_KEY_MARKER.to_string(),
                ),
            },
        };

        let now = epoch_millis(SystemTime::now());
        let mut doc = json!({
            "chatId": msg.chat_id,
            "messageId": msg.message_id,
            "isFromUser": msg.is_from_user,
            "content": content,
            "encryptedContent": encrypted,
            "publicEncryptionKey": key_marker,
            "generationState": msg.generation_state.as_str(),
            "createdAt": now,
            "updatedAt": now,
        });
        if let Some(ref model) = msg.model {
            doc["model"] = model.clone().into();
        }
        if let Some(ref by) = msg.stopped_by {
            doc["stoppedBy"] = by.clone().into();
        }
        if let Some(ref reason) = msg.stop_reason {
            doc["stopReason"] = reason.clone().into();
        }
        if let Some(at) = msg.generation_started_at {
            doc["generationStartedAt"] = epoch_millis(at).into();
        }
        if let Some(at) = msg.generation_completed_at {
            doc["generationCompletedAt"] = epoch_millis(at).into();
        }

        self.store
            .set_message(&msg.user_id, &msg.chat_id, &msg.message_id, doc)
            .await?;

        // the client owns chat creation — a missing chat doc is tolerated
        let chat_fields = json!({ "lastMessageAt": now, "updatedAt": now });
        match self
            .store
            .update_chat(&msg.user_id, &msg.chat_id, chat_fields)
            .await
        {
            Ok(()) => {}
            Err(GatewayError::NotFound(_)) => tracing::debug!(
                user_id = %msg.user_id,
                chat_id = %msg.chat_id,
                "chat document missing — lastMessageAt not updated"
            ),
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

pub(crate) fn epoch_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
