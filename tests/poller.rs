//! Tests for the Responses-API adapter (request translation, response-id
//! extraction) and the background polling worker's terminal transitions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use derecho::error::GatewayError;
use derecho::persist::store::{
    message_path, DocumentStore, MemoryDocumentStore, UserPublicKey,
};
use derecho::persist::{EncryptionPreference, MessageWriter, PersistOptions};
use derecho::poller::{PollerConfig, PollerSupervisor, PollingJob};
use derecho::responses::{
    extract_response_id, responses_base_url, responses_poll_url, translate_to_responses,
};
use derecho::router::{ApiFlavor, ResolvedEndpoint};

// ---------------------------------------------------------------------------
// Request translation
// ---------------------------------------------------------------------------

#[test]
fn translation_strips_renames_and_forces_background() {
    let body = json!({
        "model": "gpt-pro",
        "chatId": "c1",
        "messageId": "m1",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": true,
        "stream_options": {"include_usage": true},
        "temperature": 0.7,
        "top_p": 0.9,
        "frequency_penalty": 0.1,
        "presence_penalty": 0.1,
        "n": 2,
        "reasoning_effort": "low",
        "max_completion_tokens": 2048,
    });
    let out = translate_to_responses(&body, Some("resp_prev"));

    for gone in [
        "chatId",
        "messageId",
        "messages",
        "stream",
        "stream_options",
        "temperature",
        "top_p",
        "frequency_penalty",
        "presence_penalty",
        "n",
        "reasoning_effort",
        "max_completion_tokens",
        "max_tokens",
    ] {
        assert!(out.get(gone).is_none(), "{gone} should be removed");
    }
    assert_eq!(out["input"][0]["content"], "hi");
    assert_eq!(out["reasoning"]["effort"], "low");
    assert_eq!(out["max_output_tokens"], 2048);
    assert_eq!(out["store"], true);
    assert_eq!(out["background"], true);
    assert_eq!(out["previous_response_id"], "resp_prev");
}

#[test]
fn translation_defaults_reasoning_effort_to_high() {
    let out = translate_to_responses(&json!({"messages": []}), None);
    assert_eq!(out["reasoning"]["effort"], "high");
    assert!(out.get("previous_response_id").is_none());
}

#[test]
fn translation_renames_max_tokens_when_completion_variant_absent() {
    let out = translate_to_responses(&json!({"max_tokens": 512}), None);
    assert_eq!(out["max_output_tokens"], 512);
}

// ---------------------------------------------------------------------------
// Response-id extraction and URLs
// ---------------------------------------------------------------------------

#[test]
fn response_id_requires_the_resp_prefix() {
    assert_eq!(
        extract_response_id(r#"{"id":"resp_abc123"}"#),
        Some("resp_abc123".to_string())
    );
    assert_eq!(
        extract_response_id(r#"data: {"id":"resp_abc123"}"#),
        Some("resp_abc123".to_string())
    );
    assert_eq!(extract_response_id(r#"{"id":"chatcmpl-9"}"#), None);
    assert_eq!(extract_response_id("[DONE]"), None);
}

#[test]
fn responses_urls_tolerate_v1_suffixed_bases() {
    assert_eq!(
        responses_base_url("https://api.openai.com/v1"),
        "https://api.openai.com/v1/responses"
    );
    assert_eq!(
        responses_base_url("https://host.example.com"),
        "https://host.example.com/v1/responses"
    );
    assert_eq!(
        responses_poll_url("https://api.openai.com/v1", "resp_x"),
        "https://api.openai.com/v1/responses/resp_x"
    );
}

#[test]
fn polling_job_rejects_malformed_response_id() {
    let job = PollingJob::new(
        "chatcmpl-9".to_string(),
        "u1".to_string(),
        "c1".to_string(),
        "m1".to_string(),
        "gpt-pro".to_string(),
        EncryptionPreference::Unspecified,
    );
    assert!(matches!(job, Err(GatewayError::BadRequest(_))));
}

// ---------------------------------------------------------------------------
// Polling worker
// ---------------------------------------------------------------------------

/// Records every state-bearing write so tests can assert transition order.
struct RecordingStore {
    inner: MemoryDocumentStore,
    log: Mutex<Vec<String>>,
}

impl RecordingStore {
    fn new() -> Self {
        Self {
            inner: MemoryDocumentStore::new(),
            log: Mutex::new(Vec::new()),
        }
    }

    fn log_entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentStore for RecordingStore {
    async fn get_account_key(
        &self,
        user_id: &str,
    ) -> Result<Option<UserPublicKey>, GatewayError> {
        self.inner.get_account_key(user_id).await
    }

    async fn get_chat_last_response_id(
        &self,
        user_id: &str,
        chat_id: &str,
    ) -> Result<Option<String>, GatewayError> {
        self.inner.get_chat_last_response_id(user_id, chat_id).await
    }

    async fn set_message(
        &self,
        user_id: &str,
        chat_id: &str,
        message_id: &str,
        doc: Value,
    ) -> Result<(), GatewayError> {
        let state = doc["generationState"].as_str().unwrap_or("?").to_string();
        self.log.lock().unwrap().push(format!("set:{state}"));
        self.inner.set_message(user_id, chat_id, message_id, doc).await
    }

    async fn update_message(
        &self,
        user_id: &str,
        chat_id: &str,
        message_id: &str,
        fields: Value,
    ) -> Result<(), GatewayError> {
        let state = fields["generationState"].as_str().unwrap_or("?").to_string();
        self.log.lock().unwrap().push(format!("update:{state}"));
        self.inner
            .update_message(user_id, chat_id, message_id, fields)
            .await
    }

    async fn update_chat(
        &self,
        user_id: &str,
        chat_id: &str,
        fields: Value,
    ) -> Result<(), GatewayError> {
        self.inner.update_chat(user_id, chat_id, fields).await
    }
}

async fn write_json_response(socket: &mut tokio::net::TcpStream, body: &str) {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    socket.write_all(response.as_bytes()).await.unwrap();
}

fn test_endpoint(port: u16) -> ResolvedEndpoint {
    ResolvedEndpoint {
        provider: "openai".to_string(),
        base_url: format!("http://127.0.0.1:{port}/v1"),
        credential: "fake".to_string(),
        upstream_model: "gpt-pro-upstream".to_string(),
        api_flavor: ApiFlavor::Responses,
        token_multiplier: 1.0,
    }
}

fn fast_config() -> PollerConfig {
    PollerConfig {
        interval: Duration::from_millis(25),
        max_interval: Duration::from_millis(50),
        deadline: Duration::from_secs(10),
        max_concurrent: 4,
    }
}

fn test_job(encryption: EncryptionPreference) -> PollingJob {
    PollingJob::new(
        "resp_abc".to_string(),
        "u1".to_string(),
        "c1".to_string(),
        "m1".to_string(),
        "gpt-pro".to_string(),
        encryption,
    )
    .unwrap()
}

async fn seeded_writer(
    store: Arc<RecordingStore>,
) -> Arc<MessageWriter> {
    // the thinking message document exists before polling begins
    store
        .inner
        .put(
            message_path("u1", "c1", "m1"),
            json!({"generationState": "thinking", "content": ""}),
        )
        .await;
    MessageWriter::new(
        store,
        PersistOptions {
            workers: 2,
            buffer: 16,
            op_timeout: Duration::from_secs(5),
            strict_encryption: false,
        },
    )
}

async fn wait_for_state(store: &RecordingStore, state: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(doc) = store.inner.get(&message_path("u1", "c1", "m1")).await
            && doc["generationState"] == state
        {
            return doc;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for state {state}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn happy_path_polls_thinking_until_completed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let in_progress = json!({"status": "in_progress"}).to_string();
        let completed_status = json!({"status": "completed"}).to_string();
        let completed_full = json!({
            "status": "completed",
            "output": [{
                "type": "message",
                "content": [{"type": "output_text", "text": "deep answer"}],
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 4, "total_tokens": 13},
        })
        .to_string();

        for i in 0..5 {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let body = match i {
                0..=2 => &in_progress,
                3 => &completed_status,
                _ => &completed_full,
            };
            write_json_response(&mut socket, body).await;
        }
    });

    let store = Arc::new(RecordingStore::new());
    let writer = seeded_writer(store.clone()).await;
    let supervisor = PollerSupervisor::new(
        reqwest::Client::new(),
        fast_config(),
        writer,
        CancellationToken::new(),
    );
    supervisor.spawn(test_job(EncryptionPreference::Forbid), test_endpoint(port));

    let doc = wait_for_state(&store, "completed").await;
    assert_eq!(doc["content"], "deep answer");
    assert!(doc.get("generationCompletedAt").is_some());

    let log = store.log_entries();
    assert_eq!(
        log,
        vec!["update:thinking", "update:thinking", "update:thinking", "set:completed"]
    );
    // exactly one terminal transition
    let terminals = log
        .iter()
        .filter(|e| e.contains("completed") || e.contains("failed"))
        .count();
    assert_eq!(terminals, 1);
}

#[tokio::test]
async fn provider_failure_writes_failed_with_message() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let failed = json!({
            "status": "failed",
            "error": {"message": "kaput"},
        })
        .to_string();
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = socket.read(&mut buf).await;
        write_json_response(&mut socket, &failed).await;
    });

    let store = Arc::new(RecordingStore::new());
    let writer = seeded_writer(store.clone()).await;
    let supervisor = PollerSupervisor::new(
        reqwest::Client::new(),
        fast_config(),
        writer,
        CancellationToken::new(),
    );
    supervisor.spawn(test_job(EncryptionPreference::Forbid), test_endpoint(port));

    let doc = wait_for_state(&store, "failed").await;
    assert_eq!(doc["generationError"], "kaput");
    assert_eq!(store.log_entries(), vec!["update:failed"]);
}

#[tokio::test]
async fn deadline_elapsing_writes_timeout_failure() {
    let store = Arc::new(RecordingStore::new());
    let writer = seeded_writer(store.clone()).await;
    let supervisor = PollerSupervisor::new(
        reqwest::Client::new(),
        PollerConfig {
            interval: Duration::from_millis(50),
            max_interval: Duration::from_millis(50),
            // shorter than one interval: the worker must fail before polling
            deadline: Duration::from_millis(10),
            max_concurrent: 4,
        },
        writer,
        CancellationToken::new(),
    );
    // port 1 is never reachable, but no poll should even be attempted
    supervisor.spawn(test_job(EncryptionPreference::Forbid), test_endpoint(1));

    let doc = wait_for_state(&store, "failed").await;
    assert!(doc["generationError"]
        .as_str()
        .unwrap()
        .contains("timed out"));
}
