use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::responses::RESPONSE_ID_PREFIX;
use crate::router::ResolvedEndpoint;
use crate::stream::chunk::{
    StreamChunk, COMPACT_HEAD, DONE_PAYLOAD, MAX_BUFFERED_CHUNKS,
};
use crate::stream::extract::{self, TokenUsage};
use crate::stream::subscriber::{
    clamp_buffer, SubscribeOptions, SubscriberSlot, Subscription,
};
use crate::tools::continuation;
use crate::tools::executor::{NotificationSink, ToolExecutor, ToolNotification};
use crate::tools::{AssembledToolCall, Observation, ToolCallAssembler};

/// Live broadcast send timeout per subscriber; a slower consumer misses
/// the chunk, the stream is never held back.
const BROADCAST_SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Grace after a stop broadcast before subscriber queues close, letting the
/// stop event flush.
const STOP_FLUSH_GRACE: Duration = Duration::from_millis(10);

/// Hard deadline on upstream reading for one session, continuations included.
const UPSTREAM_READ_DEADLINE: Duration = Duration::from_secs(10 * 60);

/// Tool-call continuation cap per session.
const MAX_CONTINUATIONS: u32 = 5;

/// User-visible delta emitted when the continuation cap is hit.
const TOOL_LOOP_APOLOGY: &str =
    "I wasn't able to finish running tools for this request. Here is what I have so far.";

#[derive(Debug, Clone)]
pub struct StopInfo {
    pub stopped_by: String,
    pub reason: String,
    pub at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Reading,
    Completed,
}

struct SessionState {
    phase: Phase,
    created_at: SystemTime,
    started_at: Option<SystemTime>,
    completed_at: Option<Instant>,
    completed_wall: Option<SystemTime>,
    stop: Option<StopInfo>,
    error: Option<String>,
}

/// Everything needed to reopen the same endpoint for a tool continuation.
pub struct UpstreamOrigin {
    pub endpoint: ResolvedEndpoint,
    /// The client-facing model id this generation was requested under.
    pub model: String,
    /// The upstream-shaped request body as last sent.
    pub request_body: Value,
}

/// The broadcast object for one assistant response. One reader task consumes
/// the upstream SSE body and fans chunks out to every current and future
/// subscriber; reading proceeds whether or not anyone is attached.
pub struct StreamSession {
    pub chat_id: String,
    pub message_id: String,
    state: RwLock<SessionState>,
    chunks: RwLock<Vec<Arc<StreamChunk>>>,
    next_index: AtomicU64,
    subscribers: RwLock<HashMap<u64, SubscriberSlot>>,
    next_subscriber: AtomicU64,
    usage: RwLock<Option<TokenUsage>>,
    response_id: RwLock<Option<String>>,
    origin: RwLock<Option<UpstreamOrigin>>,
    /// Cancels the upstream read. Only `stop` (or the read deadline) cancels
    /// it — a subscriber disconnect never does.
    stop_token: CancellationToken,
    /// Completion signal, observable by any number of waiters.
    done: CancellationToken,
    /// Serializes notification appends from parallel tool tasks so chunk
    /// indices stay monotone.
    notify_gate: Mutex<()>,
    continuations: AtomicU32,
    buffered_bytes: AtomicUsize,
    shared_bytes: Arc<AtomicUsize>,
}

impl StreamSession {
    pub fn new(
        chat_id: impl Into<String>,
        message_id: impl Into<String>,
        shared_bytes: Arc<AtomicUsize>,
    ) -> Arc<Self> {
        Arc::new(Self {
            chat_id: chat_id.into(),
            message_id: message_id.into(),
            state: RwLock::new(SessionState {
                phase: Phase::Pending,
                created_at: SystemTime::now(),
                started_at: None,
                completed_at: None,
                completed_wall: None,
                stop: None,
                error: None,
            }),
            chunks: RwLock::new(Vec::new()),
            next_index: AtomicU64::new(0),
            subscribers: RwLock::new(HashMap::new()),
            next_subscriber: AtomicU64::new(0),
            usage: RwLock::new(None),
            response_id: RwLock::new(None),
            origin: RwLock::new(None),
            stop_token: CancellationToken::new(),
            done: CancellationToken::new(),
            notify_gate: Mutex::new(()),
            continuations: AtomicU32::new(0),
            buffered_bytes: AtomicUsize::new(0),
            shared_bytes,
        })
    }

    // --- lifecycle -------------------------------------------------------

    /// Attach the upstream body and start the reader task. Returns false if
    /// the session already left `Pending` (a stop issued before the upstream
    /// connection returned wins, and a duplicate create must drop its body).
    pub async fn attach_upstream(
        self: &Arc<Self>,
        response: reqwest::Response,
        origin: UpstreamOrigin,
        tools: Option<Arc<ToolExecutor>>,
        client: reqwest::Client,
    ) -> bool {
        {
            let mut st = self.state.write().await;
            if st.phase != Phase::Pending {
                return false;
            }
            st.phase = Phase::Reading;
            st.started_at = Some(SystemTime::now());
        }
        *self.origin.write().await = Some(origin);
        let session = self.clone();
        tokio::spawn(session.run_reader(response, tools, client));
        true
    }

    async fn run_reader(
        self: Arc<Self>,
        first: reqwest::Response,
        tools: Option<Arc<ToolExecutor>>,
        client: reqwest::Client,
    ) {
        let deadline = tokio::time::sleep(UPSTREAM_READ_DEADLINE);
        tokio::pin!(deadline);
        let mut assembler = tools.as_ref().map(|_| ToolCallAssembler::new());

        let mut next_response = Some(first);
        'legs: while let Some(response) = next_response.take() {
            let mut stream = response.bytes_stream().eventsource();
            loop {
                tokio::select! {
                    // stop() owns completion on this path
                    _ = self.stop_token.cancelled() => return,
                    _ = &mut deadline => {
                        self.append_error_chunk("upstream read deadline exceeded").await;
                        self.finish(Some("upstream read deadline exceeded".to_string())).await;
                        self.close_subscribers().await;
                        return;
                    }
                    event = stream.next() => match event {
                        Some(Ok(ev)) => {
                            if ev.data == "[DONE]" {
                                self.append(DONE_PAYLOAD.to_string(), true, false).await;
                                self.finish(None).await;
                                self.close_subscribers().await;
                                return;
                            }
                            if let Some(calls) =
                                self.handle_data(&ev.data, assembler.as_mut()).await
                            {
                                let executor = tools
                                    .as_ref()
                                    .expect("tool calls observed without executor");
                                match self
                                    .run_tool_round(calls, executor, &client)
                                    .await
                                {
                                    Some(resp) => {
                                        if let Some(a) = assembler.as_mut() {
                                            a.reset();
                                        }
                                        next_response = Some(resp);
                                        continue 'legs;
                                    }
                                    None => return,
                                }
                            }
                        }
                        Some(Err(e)) => {
                            // a cancellation propagated from an unrelated
                            // downstream client: partial data in a streaming
                            // protocol is complete data
                            if is_caller_cancelled(&e) {
                                tracing::debug!(
                                    chat_id = %self.chat_id,
                                    message_id = %self.message_id,
                                    "upstream read cancelled — completing with chunks so far"
                                );
                                self.finish(None).await;
                            } else {
                                let msg = format!("upstream read error: {e}");
                                tracing::warn!(
                                    chat_id = %self.chat_id,
                                    message_id = %self.message_id,
                                    "{msg}"
                                );
                                self.append_error_chunk(&msg).await;
                                self.finish(Some(msg)).await;
                            }
                            self.close_subscribers().await;
                            return;
                        }
                        None => {
                            tracing::debug!(
                                chat_id = %self.chat_id,
                                message_id = %self.message_id,
                                "upstream stream ended without [DONE]"
                            );
                            self.finish(None).await;
                            self.close_subscribers().await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Process one SSE data payload. Returns assembled tool calls when the
    /// detector saw `finish_reason = "tool_calls"`.
    async fn handle_data(
        &self,
        data: &str,
        assembler: Option<&mut ToolCallAssembler>,
    ) -> Option<Vec<AssembledToolCall>> {
        let parsed: Option<Value> = serde_json::from_str(data).ok();

        if let Some(value) = &parsed {
            if let Some(usage) = extract::scan_usage(value) {
                // last usage record before [DONE] wins
                *self.usage.write().await = Some(usage);
            }
            if let Some(id) = value.get("id").and_then(Value::as_str)
                && id.starts_with(RESPONSE_ID_PREFIX)
            {
                let mut slot = self.response_id.write().await;
                if slot.is_none() {
                    *slot = Some(id.to_string());
                }
            }
            if let Some(assembler) = assembler {
                match assembler.observe(value) {
                    Observation::Suppress => return None,
                    Observation::Complete(calls) => return Some(calls),
                    Observation::Pass => {}
                }
            }
        }

        let is_error = parsed
            .as_ref()
            .is_some_and(|v| v.get("error").is_some());
        self.append(format!("data: {data}"), false, is_error).await;
        None
    }

    /// Execute one round of tool calls and open the continuation. Returns
    /// the continuation response, or None when the session finished here.
    async fn run_tool_round(
        self: &Arc<Self>,
        calls: Vec<AssembledToolCall>,
        executor: &Arc<ToolExecutor>,
        client: &reqwest::Client,
    ) -> Option<reqwest::Response> {
        let session = self.clone();
        let sink: NotificationSink = Arc::new(move |note: ToolNotification| {
            let session = session.clone();
            Box::pin(async move { session.append_notification(note).await })
        });

        let results = executor
            .execute(&self.chat_id, &self.message_id, &calls, sink)
            .await;

        let round = self.continuations.fetch_add(1, Ordering::SeqCst) + 1;
        if round > MAX_CONTINUATIONS {
            tracing::warn!(
                chat_id = %self.chat_id,
                message_id = %self.message_id,
                rounds = round,
                "tool continuation cap hit"
            );
            let apology = serde_json::json!({
                "choices": [{"delta": {"content": TOOL_LOOP_APOLOGY}}]
            });
            self.append(format!("data: {apology}"), false, false).await;
            self.append(DONE_PAYLOAD.to_string(), true, false).await;
            self.finish(None).await;
            self.close_subscribers().await;
            return None;
        }

        let (endpoint, body) = {
            let origin = self.origin.read().await;
            let Some(origin) = origin.as_ref() else {
                self.append_error_chunk("continuation requested with no upstream origin")
                    .await;
                self.finish(Some("missing upstream origin".to_string())).await;
                self.close_subscribers().await;
                return None;
            };
            let defs = executor
                .supports_tools()
                .then(|| executor.definitions());
            let body = continuation::build_continuation_body(
                &origin.request_body,
                &calls,
                &results,
                defs,
            );
            (origin.endpoint.clone(), body)
        };

        match continuation::open_continuation(client, &endpoint, &body).await {
            Ok(response) => {
                // the next round continues from this request, not the first
                if let Some(origin) = self.origin.write().await.as_mut() {
                    origin.request_body = body;
                }
                Some(response)
            }
            Err(e) => {
                tracing::warn!(
                    chat_id = %self.chat_id,
                    message_id = %self.message_id,
                    "continuation failed: {e}"
                );
                self.append_error_chunk(&e.user_message()).await;
                self.finish(Some(e.to_string())).await;
                self.close_subscribers().await;
                None
            }
        }
    }

    /// Idempotent stop: only the first call wins. Cancels the upstream read,
    /// broadcasts a synthetic `stream_stopped` final chunk, and completes.
    pub async fn stop(&self, stopped_by: &str, reason: &str) -> Result<(), GatewayError> {
        {
            let mut st = self.state.write().await;
            if st.stop.is_some() {
                return Err(GatewayError::AlreadyStopped);
            }
            if st.phase == Phase::Completed {
                return Err(GatewayError::AlreadyCompleted);
            }
            st.stop = Some(StopInfo {
                stopped_by: stopped_by.to_string(),
                reason: reason.to_string(),
                at: SystemTime::now(),
            });
        }
        self.stop_token.cancel();

        let payload = serde_json::json!({
            "event": "stream_stopped",
            "stopped_by": stopped_by,
            "reason": reason,
        });
        self.append(format!("data: {payload}"), true, false).await;
        self.finish(None).await;
        tokio::time::sleep(STOP_FLUSH_GRACE).await;
        self.close_subscribers().await;
        Ok(())
    }

    /// Complete the session with a synthetic error chunk. Used when the
    /// upstream could not be opened at all.
    pub async fn fail(&self, message: &str) {
        self.append_error_chunk(message).await;
        self.finish(Some(message.to_string())).await;
        self.close_subscribers().await;
    }

    async fn finish(&self, error: Option<String>) {
        {
            let mut st = self.state.write().await;
            if st.phase == Phase::Completed {
                return;
            }
            st.phase = Phase::Completed;
            st.completed_at = Some(Instant::now());
            st.completed_wall = Some(SystemTime::now());
            if st.error.is_none() {
                st.error = error;
            }
        }
        self.done.cancel();
    }

    async fn close_subscribers(&self) {
        // dropping the senders closes each queue once it drains
        self.subscribers.write().await.clear();
    }

    // --- chunk path ------------------------------------------------------

    async fn append(
        &self,
        payload: String,
        is_final: bool,
        is_error: bool,
    ) -> Option<Arc<StreamChunk>> {
        // once completed, no further chunks are stored
        if self.state.read().await.phase == Phase::Completed {
            return None;
        }
        let mut chunks = self.chunks.write().await;
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let chunk = Arc::new(StreamChunk::new(index, payload, is_final, is_error));
        self.buffered_bytes.fetch_add(chunk.size(), Ordering::Relaxed);
        self.shared_bytes.fetch_add(chunk.size(), Ordering::Relaxed);
        if chunks.len() >= MAX_BUFFERED_CHUNKS {
            // head + tail + the new chunk add back up to the cap
            let tail_keep = MAX_BUFFERED_CHUNKS - COMPACT_HEAD - 1;
            let drain_end = chunks.len() - tail_keep;
            let freed: usize = chunks
                .drain(COMPACT_HEAD..drain_end)
                .map(|c| c.size())
                .sum();
            self.buffered_bytes.fetch_sub(freed, Ordering::Relaxed);
            self.shared_bytes.fetch_sub(freed, Ordering::Relaxed);
            tracing::debug!(
                chat_id = %self.chat_id,
                message_id = %self.message_id,
                freed_bytes = freed,
                "chunk buffer compacted"
            );
        }
        chunks.push(chunk.clone());
        // broadcast while still holding the buffer lock: replay catch-up
        // registers under this lock, so a chunk is either in a replay
        // snapshot or delivered live, never both
        self.broadcast(&chunk).await;
        drop(chunks);
        Some(chunk)
    }

    async fn append_error_chunk(&self, message: &str) {
        let payload = serde_json::json!({"error": {"message": message}});
        self.append(format!("data: {payload}"), false, true).await;
    }

    /// Append a tool lifecycle notification. Serialized through the notify
    /// gate because executor tasks emit concurrently.
    async fn append_notification(&self, note: ToolNotification) {
        let _gate = self.notify_gate.lock().await;
        match serde_json::to_string(&note) {
            Ok(json) => {
                self.append(format!("data: {json}"), false, false).await;
            }
            Err(e) => tracing::error!("unserializable tool notification: {e}"),
        }
    }

    async fn broadcast(&self, chunk: &Arc<StreamChunk>) {
        let mut closed: Vec<u64> = Vec::new();
        {
            let subs = self.subscribers.read().await;
            for slot in subs.values() {
                if slot.cancel.is_cancelled() {
                    closed.push(slot.id);
                    continue;
                }
                match tokio::time::timeout(
                    BROADCAST_SEND_TIMEOUT,
                    slot.tx.send(chunk.clone()),
                )
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => closed.push(slot.id),
                    Err(_) => tracing::debug!(
                        subscriber = slot.id,
                        index = chunk.index,
                        "slow subscriber — chunk dropped"
                    ),
                }
            }
        }
        if !closed.is_empty() {
            let mut subs = self.subscribers.write().await;
            for id in closed {
                subs.remove(&id);
            }
        }
    }

    // --- subscription ----------------------------------------------------

    pub async fn subscribe(self: &Arc<Self>, opts: SubscribeOptions) -> Subscription {
        let buffer = clamp_buffer(opts.buffer_size);
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(buffer);
        let cancel = CancellationToken::new();

        let completed = self.state.read().await.phase == Phase::Completed;
        if opts.replay_from_start || completed {
            let session = self.clone();
            tokio::spawn(session.run_replay(id, tx, cancel.clone()));
        } else {
            // register under the chunks lock so no append slips between a
            // would-be snapshot and the live registration
            let chunks = self.chunks.read().await;
            self.subscribers.write().await.insert(
                id,
                SubscriberSlot {
                    id,
                    joined_at: Instant::now(),
                    tx,
                    cancel: cancel.clone(),
                },
            );
            drop(chunks);
            // completion racing the registration: make sure the queue closes
            if self.state.read().await.phase == Phase::Completed {
                self.subscribers.write().await.remove(&id);
            }
        }
        Subscription::new(id, rx, cancel)
    }

    /// Replay delivery: blocking sends of all buffered chunks so a late
    /// joiner misses no history, then either close (completed session) or
    /// hand over to live broadcast once caught up.
    async fn run_replay(
        self: Arc<Self>,
        id: u64,
        tx: mpsc::Sender<Arc<StreamChunk>>,
        cancel: CancellationToken,
    ) {
        let mut next_wanted: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let batch: Vec<Arc<StreamChunk>> = {
                let chunks = self.chunks.read().await;
                let start = chunks.partition_point(|c| c.index < next_wanted);
                if start == chunks.len() {
                    if self.state.read().await.phase == Phase::Completed {
                        return; // dropping tx closes the queue after drain
                    }
                    // caught up on a live session: register for broadcast
                    // while still holding the chunks lock so no append can
                    // slip past both the snapshot and the live set
                    self.subscribers.write().await.insert(
                        id,
                        SubscriberSlot {
                            id,
                            joined_at: Instant::now(),
                            tx,
                            cancel: cancel.clone(),
                        },
                    );
                    drop(chunks);
                    if self.state.read().await.phase == Phase::Completed {
                        self.subscribers.write().await.remove(&id);
                    }
                    return;
                }
                chunks[start..].to_vec()
            };
            for chunk in batch {
                next_wanted = chunk.index + 1;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(chunk) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    // --- accessors -------------------------------------------------------

    /// Concatenated visible content of all buffered chunks.
    pub async fn get_content(&self) -> String {
        extract::buffered_content(&self.chunks.read().await)
    }

    pub async fn phase(&self) -> Phase {
        self.state.read().await.phase
    }

    pub async fn is_completed(&self) -> bool {
        self.phase().await == Phase::Completed
    }

    /// Total chunks ever generated (buffer compaction does not reduce this).
    pub fn chunks_generated(&self) -> u64 {
        self.next_index.load(Ordering::Relaxed)
    }

    pub async fn buffered_chunks(&self) -> usize {
        self.chunks.read().await.len()
    }

    pub async fn snapshot_chunks(&self) -> Vec<Arc<StreamChunk>> {
        self.chunks.read().await.clone()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes.load(Ordering::Relaxed)
    }

    pub async fn stop_info(&self) -> Option<StopInfo> {
        self.state.read().await.stop.clone()
    }

    pub async fn error(&self) -> Option<String> {
        self.state.read().await.error.clone()
    }

    pub async fn usage(&self) -> Option<TokenUsage> {
        *self.usage.read().await
    }

    pub async fn response_id(&self) -> Option<String> {
        self.response_id.read().await.clone()
    }

    pub async fn set_response_id(&self, id: String) {
        *self.response_id.write().await = Some(id);
    }

    pub async fn model(&self) -> Option<String> {
        self.origin.read().await.as_ref().map(|o| o.model.clone())
    }

    pub async fn created_at(&self) -> SystemTime {
        self.state.read().await.created_at
    }

    pub async fn started_at(&self) -> Option<SystemTime> {
        self.state.read().await.started_at
    }

    pub async fn completed_at(&self) -> Option<Instant> {
        self.state.read().await.completed_at
    }

    pub async fn completed_wall(&self) -> Option<SystemTime> {
        self.state.read().await.completed_wall
    }

    /// Resolves once the session completes, for any number of waiters.
    pub async fn wait_completed(&self) {
        self.done.cancelled().await;
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.shared_bytes
            .fetch_sub(self.buffered_bytes.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}

/// A read error that is semantically "caller cancelled": a downstream HTTP
/// library propagated a cancellation from an unrelated client.
fn is_caller_cancelled<E: std::fmt::Display>(e: &E) -> bool {
    let msg = e.to_string().to_lowercase();
    msg.contains("canceled") || msg.contains("cancelled")
}
