//! Distributed cancel: a stop request arriving at any process instance can
//! terminate a stream owned by a different instance. Every instance
//! subscribes to one subject; only the session owner replies, and silent
//! non-ownership is what lets exactly one reply arrive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::stream::manager::StreamManager;

pub const CANCEL_SUBJECT: &str = "derecho.stream.cancel";

/// How long the requester waits for the owner's reply.
pub const CANCEL_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub chat_id: String,
    pub message_id: String,
    pub user_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_stopped: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_complete: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks_generated: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One delivered bus message. Reply at most once; not replying is the
/// non-ownership signal.
pub struct BusMessage {
    pub payload: Vec<u8>,
    reply: Option<mpsc::Sender<Vec<u8>>>,
}

impl BusMessage {
    pub fn reply(mut self, payload: Vec<u8>) {
        if let Some(tx) = self.reply.take() {
            // requester may have timed out and gone away
            let _ = tx.try_send(payload);
        }
    }
}

pub struct BusSubscription {
    rx: mpsc::Receiver<BusMessage>,
}

impl BusSubscription {
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

/// The pub/sub seam for request/reply cancellation. A NATS-style backend
/// implements this in production; the in-process bus covers single-instance
/// deployments and tests.
#[async_trait]
pub trait CancelBus: Send + Sync {
    /// Broadcast a request and await the first reply. `Ok(None)` when no
    /// subscriber replied within the timeout (or none exist).
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, GatewayError>;

    async fn subscribe(&self, subject: &str) -> Result<BusSubscription, GatewayError>;
}

/// In-process request/reply bus.
#[derive(Default)]
pub struct InProcessBus {
    subscribers: RwLock<HashMap<String, Vec<mpsc::Sender<BusMessage>>>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CancelBus for InProcessBus {
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, GatewayError> {
        let senders: Vec<mpsc::Sender<BusMessage>> = {
            let subs = self.subscribers.read().await;
            subs.get(subject).cloned().unwrap_or_default()
        };
        if senders.is_empty() {
            return Ok(None);
        }

        let (reply_tx, mut reply_rx) = mpsc::channel(senders.len());
        for sender in senders {
            let message = BusMessage {
                payload: payload.clone(),
                reply: Some(reply_tx.clone()),
            };
            // a dead subscriber is indistinguishable from a silent one
            let _ = sender.try_send(message);
        }
        drop(reply_tx);

        match tokio::time::timeout(timeout, reply_rx.recv()).await {
            Ok(reply) => Ok(reply),
            Err(_) => Ok(None),
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<BusSubscription, GatewayError> {
        let (tx, rx) = mpsc::channel(16);
        self.subscribers
            .write()
            .await
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        Ok(BusSubscription { rx })
    }
}

/// Request/reply cancellation over the bus, with a local fast path when no
/// bus is configured.
pub struct CancelService {
    bus: Option<Arc<dyn CancelBus>>,
    manager: Arc<StreamManager>,
}

impl CancelService {
    /// Local-only service: cancels succeed only for sessions this process owns.
    pub fn local(manager: Arc<StreamManager>) -> Arc<Self> {
        Arc::new(Self { bus: None, manager })
    }

    /// Start the responder and return the service. The responder receives
    /// every cancel request on the subject and replies only when the local
    /// manager owns the session.
    pub async fn start(
        bus: Arc<dyn CancelBus>,
        manager: Arc<StreamManager>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, GatewayError> {
        let service = Arc::new(Self {
            bus: Some(bus.clone()),
            manager,
        });
        let mut subscription = bus.subscribe(CANCEL_SUBJECT).await?;
        let responder = service.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    m = subscription.recv() => m,
                };
                let Some(message) = message else { return };
                let request: CancelRequest = match serde_json::from_slice(&message.payload) {
                    Ok(req) => req,
                    Err(e) => {
                        tracing::warn!("invalid cancel payload ignored: {e}");
                        continue;
                    }
                };
                if let Some(outcome) = responder.cancel_local(&request).await {
                    match serde_json::to_vec(&outcome) {
                        Ok(bytes) => message.reply(bytes),
                        Err(e) => tracing::error!("unserializable cancel outcome: {e}"),
                    }
                }
                // not ours: stay silent so the owner's reply is the only one
            }
        });
        Ok(service)
    }

    /// Stop the session if this instance owns it. `None` means not ours.
    async fn cancel_local(&self, request: &CancelRequest) -> Option<CancelOutcome> {
        let session = self
            .manager
            .get(&request.chat_id, &request.message_id)
            .await?;
        let chunks = Some(session.chunks_generated());
        let outcome = match session.stop(&request.user_id, &request.reason).await {
            Ok(()) => CancelOutcome {
                found: true,
                chunks_generated: chunks,
                ..Default::default()
            },
            Err(GatewayError::AlreadyStopped) => CancelOutcome {
                found: true,
                already_stopped: Some(true),
                chunks_generated: chunks,
                ..Default::default()
            },
            Err(GatewayError::AlreadyCompleted) => CancelOutcome {
                found: true,
                already_complete: Some(true),
                chunks_generated: chunks,
                ..Default::default()
            },
            Err(e) => CancelOutcome {
                found: true,
                error: Some(e.user_message()),
                ..Default::default()
            },
        };
        Some(outcome)
    }

    /// Broadcast a cancel for `(chat, message)` and await the owner's reply.
    /// No reply within the window means no instance owns the session.
    pub async fn request_cancel(
        &self,
        chat_id: &str,
        message_id: &str,
        user_id: &str,
        reason: &str,
    ) -> CancelOutcome {
        let request = CancelRequest {
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
            user_id: user_id.to_string(),
            reason: reason.to_string(),
        };

        let Some(bus) = &self.bus else {
            return self.cancel_local(&request).await.unwrap_or_default();
        };

        let payload = match serde_json::to_vec(&request) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("unserializable cancel request: {e}");
                return CancelOutcome::default();
            }
        };
        match bus
            .request(CANCEL_SUBJECT, payload, CANCEL_REPLY_TIMEOUT)
            .await
        {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!("malformed cancel reply: {e}");
                CancelOutcome {
                    error: Some("malformed cancel reply".to_string()),
                    ..Default::default()
                }
            }),
            Ok(None) => CancelOutcome::default(),
            Err(e) => {
                tracing::warn!("cancel request failed: {e}");
                CancelOutcome {
                    error: Some(e.user_message()),
                    ..Default::default()
                }
            }
        }
    }
}
