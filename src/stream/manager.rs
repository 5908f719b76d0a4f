use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::persist::{
    EncryptionPreference, GenerationState, MessageWriter, StoredMessage,
};
use crate::stream::session::StreamSession;

/// Completed sessions are retained for late joiners.
pub const SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// Retention under memory pressure.
pub const PRESSURE_TTL: Duration = Duration::from_secs(60);

/// Total buffered bytes across all sessions that triggers pressure TTL.
pub const PRESSURE_THRESHOLD_BYTES: usize = 500 * 1024 * 1024;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Summary of a non-completed session for a chat.
#[derive(Debug, Clone)]
pub struct ActiveSessionInfo {
    pub chat_id: String,
    pub message_id: String,
    pub started_at: Option<SystemTime>,
    pub chunks_generated: u64,
}

/// Owns the `chat_id:message_id → session` map. Only one session can exist
/// for a given key within a process at a time.
pub struct StreamManager {
    sessions: RwLock<HashMap<String, Arc<StreamSession>>>,
    total_bytes: Arc<AtomicUsize>,
    writer: Arc<MessageWriter>,
}

fn session_key(chat_id: &str, message_id: &str) -> String {
    format!("{chat_id}:{message_id}")
}

impl StreamManager {
    pub fn new(writer: Arc<MessageWriter>) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            total_bytes: Arc::new(AtomicUsize::new(0)),
            writer,
        })
    }

    /// Run the periodic eviction task until `shutdown` fires.
    pub fn start_cleanup(self: &Arc<Self>, shutdown: CancellationToken) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tick.tick() => manager.cleanup_expired().await,
                }
            }
        });
    }

    /// Double-checked create: the common path is a read-lock lookup.
    pub async fn get_or_create(
        &self,
        chat_id: &str,
        message_id: &str,
    ) -> (Arc<StreamSession>, bool) {
        let key = session_key(chat_id, message_id);
        if let Some(session) = self.sessions.read().await.get(&key) {
            return (session.clone(), false);
        }
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(&key) {
            return (session.clone(), false);
        }
        let session = StreamSession::new(chat_id, message_id, self.total_bytes.clone());
        sessions.insert(key, session.clone());
        tracing::debug!(chat_id, message_id, "stream session created");
        (session, true)
    }

    pub async fn get(&self, chat_id: &str, message_id: &str) -> Option<Arc<StreamSession>> {
        self.sessions
            .read()
            .await
            .get(&session_key(chat_id, message_id))
            .cloned()
    }

    /// The chat's in-flight generation, if any. Completed sessions are
    /// never reported here.
    pub async fn get_active_for_chat(&self, chat_id: &str) -> Option<ActiveSessionInfo> {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            if session.chat_id == chat_id && !session.is_completed().await {
                return Some(ActiveSessionInfo {
                    chat_id: session.chat_id.clone(),
                    message_id: session.message_id.clone(),
                    started_at: session.started_at().await,
                    chunks_generated: session.chunks_generated(),
                });
            }
        }
        None
    }

    pub fn total_buffered_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// The TTL in force right now: shortened when total buffered bytes
    /// exceed the pressure threshold.
    pub fn effective_ttl(&self) -> Duration {
        if self.total_buffered_bytes() > PRESSURE_THRESHOLD_BYTES {
            PRESSURE_TTL
        } else {
            SESSION_TTL
        }
    }

    /// Evict completed sessions older than the effective TTL. Non-completed
    /// sessions are never evicted.
    pub async fn cleanup_expired(&self) {
        let ttl = self.effective_ttl();
        let mut expired: Vec<String> = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (key, session) in sessions.iter() {
                if let Some(completed_at) = session.completed_at().await
                    && completed_at.elapsed() > ttl
                {
                    expired.push(key.clone());
                }
            }
        }
        if expired.is_empty() {
            return;
        }
        let mut sessions = self.sessions.write().await;
        for key in &expired {
            // re-check under the write lock; eviction must never race a
            // session back to life
            if let Some(session) = sessions.get(key)
                && session.is_completed().await
            {
                sessions.remove(key);
            }
        }
        tracing::info!(evicted = expired.len(), "expired stream sessions evicted");
    }

    /// Persistence hook, called by the owning HTTP handler on completion:
    /// extract content and queue the assistant message for storage.
    pub async fn save_completed(
        &self,
        session: &Arc<StreamSession>,
        user_id: &str,
        encryption: EncryptionPreference,
    ) -> Result<(), GatewayError> {
        let content = session.get_content().await;
        let stop = session.stop_info().await;
        let state = if session.error().await.is_some() {
            GenerationState::Failed
        } else {
            GenerationState::Completed
        };
        let msg = StoredMessage {
            user_id: user_id.to_string(),
            chat_id: session.chat_id.clone(),
            message_id: session.message_id.clone(),
            is_from_user: false,
            content,
            encryption,
            stopped_by: stop.as_ref().map(|s| s.stopped_by.clone()),
            stop_reason: stop.as_ref().map(|s| s.reason.clone()),
            model: session.model().await,
            generation_state: state,
            generation_started_at: session.started_at().await,
            generation_completed_at: session.completed_wall().await,
        };
        self.writer.store_async(msg).await
    }
}
