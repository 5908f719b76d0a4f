//! Background polling workers for Responses-API generations. One worker per
//! response id polls the provider until a terminal state, keeping the stored
//! generation state current so the client never observes a message stuck in
//! `thinking`.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::error::GatewayError;
use crate::persist::{
    EncryptionPreference, GenerationState, MessageWriter, StoredMessage,
};
use crate::responses::{responses_poll_url, RESPONSE_ID_PREFIX};
use crate::router::ResolvedEndpoint;
use crate::stream::extract;

/// Polls at the base interval this many times before switching to the max
/// interval.
const SLOW_POLL_AFTER: u32 = 10;

/// Per-request timeout for one status poll.
const POLL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The completed payload is large; the final fetch gets its own deadline.
const COMPLETION_FETCH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub max_interval: Duration,
    pub deadline: Duration,
    pub max_concurrent: usize,
}

impl From<&RuntimeConfig> for PollerConfig {
    fn from(cfg: &RuntimeConfig) -> Self {
        Self {
            interval: cfg.poll_interval,
            max_interval: cfg.poll_max_interval,
            deadline: cfg.poll_deadline,
            max_concurrent: cfg.max_concurrent_pollers,
        }
    }
}

/// Durable handle of one background generation.
#[derive(Debug, Clone)]
pub struct PollingJob {
    pub response_id: String,
    pub user_id: String,
    pub chat_id: String,
    pub message_id: String,
    pub model: String,
    pub encryption: EncryptionPreference,
    pub started_at: SystemTime,
}

impl PollingJob {
    pub fn new(
        response_id: String,
        user_id: String,
        chat_id: String,
        message_id: String,
        model: String,
        encryption: EncryptionPreference,
    ) -> Result<Self, GatewayError> {
        if !response_id.starts_with(RESPONSE_ID_PREFIX) {
            return Err(GatewayError::BadRequest(format!(
                "response id must start with {RESPONSE_ID_PREFIX}: {response_id}"
            )));
        }
        Ok(Self {
            response_id,
            user_id,
            chat_id,
            message_id,
            model,
            encryption,
            started_at: SystemTime::now(),
        })
    }
}

/// Spawns and bounds the polling workers.
pub struct PollerSupervisor {
    client: reqwest::Client,
    cfg: PollerConfig,
    writer: Arc<MessageWriter>,
    limit: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl PollerSupervisor {
    pub fn new(
        client: reqwest::Client,
        cfg: PollerConfig,
        writer: Arc<MessageWriter>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let limit = Arc::new(Semaphore::new(cfg.max_concurrent.max(1)));
        Arc::new(Self {
            client,
            cfg,
            writer,
            limit,
            shutdown,
        })
    }

    /// Launch one polling worker for a background generation.
    pub fn spawn(self: &Arc<Self>, job: PollingJob, endpoint: ResolvedEndpoint) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = supervisor.limit.acquire().await else {
                return; // semaphore closed during shutdown
            };
            supervisor.run(job, endpoint).await;
        });
    }

    async fn run(&self, job: PollingJob, endpoint: ResolvedEndpoint) {
        let url = responses_poll_url(&endpoint.base_url, &job.response_id);
        let deadline = Instant::now() + self.cfg.deadline;
        let mut polls: u32 = 0;

        tracing::info!(
            response_id = %job.response_id,
            chat_id = %job.chat_id,
            message_id = %job.message_id,
            model = %job.model,
            "background polling started"
        );

        loop {
            let interval = if polls >= SLOW_POLL_AFTER {
                self.cfg.max_interval
            } else {
                self.cfg.interval
            };
            if Instant::now() + interval > deadline {
                self.write_failed(&job, "background generation timed out").await;
                return;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            polls += 1;

            let body = match self.poll_once(&url, &endpoint).await {
                Ok(body) => body,
                Err(e) => {
                    // transient: retry next tick
                    tracing::warn!(
                        response_id = %job.response_id,
                        polls,
                        "poll failed: {e}"
                    );
                    continue;
                }
            };

            match body.get("status").and_then(Value::as_str) {
                Some("completed") => {
                    self.finish_completed(&job, &endpoint, &url).await;
                    return;
                }
                Some("failed") => {
                    let message = body
                        .get("error")
                        .and_then(|e| e.get("message"))
                        .and_then(Value::as_str)
                        .unwrap_or("provider reported failure");
                    self.write_failed(&job, message).await;
                    return;
                }
                // queued, in_progress, and anything unrecognized stay thinking
                _ => {
                    // fire-and-forget: a failed state write never stops polling
                    if let Err(e) = self
                        .writer
                        .update_generation_state(
                            &job.user_id,
                            &job.chat_id,
                            &job.message_id,
                            GenerationState::Thinking,
                            None,
                            None,
                        )
                        .await
                    {
                        tracing::warn!(
                            response_id = %job.response_id,
                            "thinking state write failed: {e}"
                        );
                    }
                }
            }
        }
    }

    async fn poll_once(
        &self,
        url: &str,
        endpoint: &ResolvedEndpoint,
    ) -> Result<Value, GatewayError> {
        let send = self
            .client
            .get(url)
            .bearer_auth(&endpoint.credential)
            .send();
        let response = tokio::time::timeout(POLL_REQUEST_TIMEOUT, send)
            .await
            .map_err(|_| GatewayError::Timeout(POLL_REQUEST_TIMEOUT.as_millis() as u64))??;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::UpstreamUnavailable {
                provider: endpoint.provider.clone(),
                message: format!("poll returned {status}"),
            });
        }
        Ok(response.json().await?)
    }

    async fn finish_completed(
        &self,
        job: &PollingJob,
        endpoint: &ResolvedEndpoint,
        url: &str,
    ) {
        let send = self
            .client
            .get(url)
            .bearer_auth(&endpoint.credential)
            .send();
        let body: Result<Value, GatewayError> =
            match tokio::time::timeout(COMPLETION_FETCH_TIMEOUT, send).await {
                Ok(Ok(resp)) if resp.status().is_success() => {
                    resp.json().await.map_err(GatewayError::from)
                }
                Ok(Ok(resp)) => Err(GatewayError::UpstreamUnavailable {
                    provider: endpoint.provider.clone(),
                    message: format!("completion fetch returned {}", resp.status()),
                }),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(GatewayError::Timeout(
                    COMPLETION_FETCH_TIMEOUT.as_millis() as u64,
                )),
            };

        let body = match body {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(
                    response_id = %job.response_id,
                    "completed response fetch failed: {e}"
                );
                self.write_failed(job, "failed to fetch completed response").await;
                return;
            }
        };

        let content = extract::completion_content(&body).unwrap_or_default();
        if let Some(usage) = extract::scan_usage(&body) {
            tracing::info!(
                response_id = %job.response_id,
                model = %job.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                total_tokens = usage.total_tokens,
                "background generation token usage"
            );
        }

        let msg = StoredMessage {
            user_id: job.user_id.clone(),
            chat_id: job.chat_id.clone(),
            message_id: job.message_id.clone(),
            is_from_user: false,
            content,
            encryption: job.encryption,
            stopped_by: None,
            stop_reason: None,
            model: Some(job.model.clone()),
            generation_state: GenerationState::Completed,
            generation_started_at: Some(job.started_at),
            generation_completed_at: Some(SystemTime::now()),
        };
        if let Err(e) = self.writer.store_async(msg).await {
            tracing::error!(
                response_id = %job.response_id,
                "completed message enqueue failed: {e}"
            );
            return;
        }
        tracing::info!(
            response_id = %job.response_id,
            chat_id = %job.chat_id,
            message_id = %job.message_id,
            "background generation completed"
        );
    }

    /// The single `failed` terminal transition.
    async fn write_failed(&self, job: &PollingJob, message: &str) {
        if let Err(e) = self
            .writer
            .update_generation_state(
                &job.user_id,
                &job.chat_id,
                &job.message_id,
                GenerationState::Failed,
                Some(message),
                None,
            )
            .await
        {
            tracing::error!(
                response_id = %job.response_id,
                "failed state write failed: {e}"
            );
        }
        tracing::warn!(
            response_id = %job.response_id,
            chat_id = %job.chat_id,
            message_id = %job.message_id,
            "background generation failed: {message}"
        );
    }
}
