//! Tests for tool-call interception: incremental assembly from SSE deltas,
//! continuation request composition, and the full intercept → execute →
//! continue → finish flow against a mock upstream.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use derecho::error::GatewayError;
use derecho::router::{ApiFlavor, ResolvedEndpoint};
use derecho::stream::session::{StreamSession, UpstreamOrigin};
use derecho::stream::subscriber::SubscribeOptions;
use derecho::tools::continuation::{build_continuation_body, chat_completions_url};
use derecho::tools::executor::{Tool, ToolExecutor, ToolRegistry, ToolResult};
use derecho::tools::{Observation, ToolCallAssembler};

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

fn delta_with_tool_fragment(fragment: Value) -> Value {
    json!({"choices": [{"delta": {"tool_calls": [fragment]}}]})
}

#[test]
fn assembler_joins_argument_fragments_by_index() {
    let mut assembler = ToolCallAssembler::new();

    let obs = assembler.observe(&delta_with_tool_fragment(json!({
        "index": 0,
        "id": "call_1",
        "type": "function",
        "function": {"name": "web_search", "arguments": "{\"q\":"}
    })));
    assert!(matches!(obs, Observation::Suppress));

    let obs = assembler.observe(&delta_with_tool_fragment(json!({
        "index": 0,
        "function": {"arguments": "\"x\"}"}
    })));
    assert!(matches!(obs, Observation::Suppress));

    let obs = assembler.observe(&json!({
        "choices": [{"delta": {}, "finish_reason": "tool_calls"}]
    }));
    let Observation::Complete(calls) = obs else {
        panic!("expected completed tool calls");
    };
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, "call_1");
    assert_eq!(calls[0].name, "web_search");
    assert_eq!(calls[0].arguments, "{\"q\":\"x\"}");
}

#[test]
fn assembler_tracks_parallel_calls_by_index() {
    let mut assembler = ToolCallAssembler::new();
    assembler.observe(&delta_with_tool_fragment(json!({
        "index": 1,
        "id": "call_b",
        "function": {"name": "second", "arguments": "{}"}
    })));
    assembler.observe(&delta_with_tool_fragment(json!({
        "index": 0,
        "id": "call_a",
        "function": {"name": "first", "arguments": "{}"}
    })));
    let Observation::Complete(calls) = assembler.observe(&json!({
        "choices": [{"delta": {}, "finish_reason": "tool_calls"}]
    })) else {
        panic!("expected completed tool calls");
    };
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].name, "first");
    assert_eq!(calls[1].name, "second");
    // a missing type defaults to "function"
    assert_eq!(calls[0].call_type, "function");
}

#[test]
fn plain_content_chunks_pass_through() {
    let mut assembler = ToolCallAssembler::new();
    let obs = assembler.observe(&json!({
        "choices": [{"delta": {"content": "hello"}}]
    }));
    assert!(matches!(obs, Observation::Pass));
}

// ---------------------------------------------------------------------------
// Continuation request composition
// ---------------------------------------------------------------------------

#[test]
fn continuation_body_extends_conversation_and_forces_stream() {
    let original = json!({
        "model": "gpt-4",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": true,
        "tools": [{"type": "function"}],
        "temperature": 0.5,
    });
    let calls = {
        let mut assembler = ToolCallAssembler::new();
        assembler.observe(&delta_with_tool_fragment(json!({
            "index": 0,
            "id": "call_1",
            "type": "function",
            "function": {"name": "web_search", "arguments": "{}"}
        })));
        let Observation::Complete(calls) = assembler.observe(&json!({
            "choices": [{"delta": {}, "finish_reason": "tool_calls"}]
        })) else {
            panic!("expected completed tool calls");
        };
        calls
    };
    let results = vec![ToolResult {
        tool_call_id: "call_1".to_string(),
        role: "tool".to_string(),
        name: "web_search".to_string(),
        content: "R".to_string(),
    }];

    let body = build_continuation_body(&original, &calls, &results, None);

    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");
    assert!(messages[1]["content"].is_null());
    assert_eq!(messages[1]["tool_calls"][0]["id"], "call_1");
    assert_eq!(messages[2]["role"], "tool");
    assert_eq!(messages[2]["tool_call_id"], "call_1");
    assert_eq!(messages[2]["content"], "R");

    assert_eq!(body["stream"], true);
    assert!(body.get("tools").is_none());
    // unrelated sampling params survive the copy
    assert_eq!(body["temperature"], 0.5);
}

#[test]
fn chat_completions_url_appends_only_when_missing() {
    assert_eq!(
        chat_completions_url("https://api.openai.com/v1"),
        "https://api.openai.com/v1/chat/completions"
    );
    assert_eq!(
        chat_completions_url("https://api.openai.com/v1/chat/completions"),
        "https://api.openai.com/v1/chat/completions"
    );
    assert_eq!(
        chat_completions_url("https://host/v1/"),
        "https://host/v1/chat/completions"
    );
}

// ---------------------------------------------------------------------------
// Full intercept → execute → continue flow
// ---------------------------------------------------------------------------

struct FakeSearch;

#[async_trait]
impl Tool for FakeSearch {
    fn name(&self) -> &str {
        "web_search"
    }

    fn definition(&self) -> Value {
        json!({
            "type": "function",
            "function": {"name": "web_search", "parameters": {"type": "object"}}
        })
    }

    async fn invoke(&self, _arguments: &str) -> Result<String, GatewayError> {
        Ok("R".to_string())
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read one full HTTP request (headers + content-length body) and return
/// the body.
async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf: Vec<u8> = Vec::new();
    let mut tmp = [0u8; 4096];
    loop {
        let n = socket.read(&mut tmp).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&buf[..pos]).to_lowercase();
            let content_length = headers
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= pos + 4 + content_length {
                return String::from_utf8_lossy(&buf[pos + 4..pos + 4 + content_length])
                    .to_string();
            }
        }
    }
    String::new()
}

const SSE_HEADERS: &[u8] = b"HTTP/1.1 200 OK\r\n\
    Content-Type: text/event-stream\r\n\
    Connection: close\r\n\r\n";

#[tokio::test]
async fn tool_call_continuation_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (body_tx, body_rx) = oneshot::channel::<String>();

    tokio::spawn(async move {
        // leg 1: the initial stream emits one tool call and finishes with
        // finish_reason = tool_calls
        let (mut socket, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut socket).await;
        socket.write_all(SSE_HEADERS).await.unwrap();
        socket.write_all(
            b"data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"type\":\"function\",\"function\":{\"name\":\"web_search\",\"arguments\":\"{\\\"q\\\":\\\"x\\\"}\"}}]}}]}\n\n",
        )
        .await
        .unwrap();
        socket
            .write_all(b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n")
            .await
            .unwrap();
        drop(socket);

        // leg 2: the continuation request
        let (mut socket, _) = listener.accept().await.unwrap();
        let body = read_request(&mut socket).await;
        let _ = body_tx.send(body);
        socket.write_all(SSE_HEADERS).await.unwrap();
        socket
            .write_all(b"data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n")
            .await
            .unwrap();
        socket.write_all(b"data: [DONE]\n\n").await.unwrap();
    });

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(FakeSearch));
    let executor = Arc::new(ToolExecutor::new(Arc::new(registry)));

    let session = StreamSession::new("c1", "m1", Arc::new(AtomicUsize::new(0)));
    let mut sub = session.subscribe(SubscribeOptions::default()).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://127.0.0.1:{port}/"))
        .send()
        .await
        .unwrap();
    let origin = UpstreamOrigin {
        endpoint: ResolvedEndpoint {
            provider: "mock".to_string(),
            base_url: format!("http://127.0.0.1:{port}"),
            credential: "fake".to_string(),
            upstream_model: "mock-model".to_string(),
            api_flavor: ApiFlavor::ChatCompletions,
            token_multiplier: 1.0,
        },
        model: "mock-model".to_string(),
        request_body: json!({
            "model": "mock-model",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
        }),
    };
    assert!(
        session
            .attach_upstream(response, origin, Some(executor), client)
            .await
    );

    let mut received = Vec::new();
    while let Some(chunk) = sub.next().await {
        received.push(chunk);
    }

    // started + completed notifications, then "ok", then [DONE] — the
    // tool-call deltas themselves are not broadcast
    assert_eq!(received.len(), 4);
    assert!(received[0].payload.contains("\"status\":\"started\""));
    assert!(received[1].payload.contains("\"status\":\"completed\""));
    assert!(received[2].payload.contains("ok"));
    assert!(received[3].is_final);
    assert!(received.iter().all(|c| !c.payload.contains("tool_calls")));
    assert_eq!(
        received.iter().map(|c| c.index).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );

    assert_eq!(session.get_content().await, "ok");

    // the continuation carried the extended conversation
    let body: Value = serde_json::from_str(&body_rx.await.unwrap()).unwrap();
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["content"], "hi");
    assert_eq!(messages[1]["tool_calls"][0]["function"]["name"], "web_search");
    assert_eq!(messages[2]["role"], "tool");
    assert_eq!(messages[2]["content"], "R");
    assert_eq!(body["stream"], true);
    // the registry advertises its tools on the continuation
    assert_eq!(body["tools"][0]["function"]["name"], "web_search");
}
