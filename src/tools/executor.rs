use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinSet;

use crate::error::GatewayError;
use crate::tools::AssembledToolCall;

/// A tool the model can invoke mid-stream.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// The OpenAI-shaped tool definition advertised to the model.
    fn definition(&self) -> Value;

    async fn invoke(&self, arguments: &str) -> Result<String, GatewayError>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn definitions(&self) -> Vec<Value> {
        let mut defs: Vec<(String, Value)> = self
            .tools
            .iter()
            .map(|(name, tool)| (name.clone(), tool.definition()))
            .collect();
        defs.sort_by(|a, b| a.0.cmp(&b.0));
        defs.into_iter().map(|(_, d)| d).collect()
    }
}

/// One tool's outcome, shaped for a `role: "tool"` conversation message.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub role: String,
    pub name: String,
    pub content: String,
}

impl ToolResult {
    fn new(call: &AssembledToolCall, content: String) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            role: "tool".to_string(),
            name: call.name.clone(),
            content,
        }
    }
}

/// Lifecycle notification pushed into the broadcast stream while tools run.
#[derive(Debug, Clone, Serialize)]
pub struct ToolNotification {
    pub event: String,
    pub tool_call_id: String,
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolNotification {
    fn status(call: &AssembledToolCall, status: &str, error: Option<String>) -> Self {
        Self {
            event: "tool_execution".to_string(),
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            status: status.to_string(),
            error,
        }
    }
}

/// Callback through which executor tasks emit notifications. The receiver
/// serializes appends so chunk indices stay monotone.
pub type NotificationSink =
    Arc<dyn Fn(ToolNotification) -> BoxFuture<'static, ()> + Send + Sync>;

/// Dispatches assembled tool calls in parallel. One tool erroring never
/// fails the batch: its result carries a human-readable error string and an
/// `error` notification is raised instead.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn supports_tools(&self) -> bool {
        !self.registry.is_empty()
    }

    pub fn definitions(&self) -> Vec<Value> {
        self.registry.definitions()
    }

    pub async fn execute(
        &self,
        chat_id: &str,
        message_id: &str,
        calls: &[AssembledToolCall],
        on_event: NotificationSink,
    ) -> Vec<ToolResult> {
        let mut set = JoinSet::new();
        for (slot, call) in calls.iter().cloned().enumerate() {
            let registry = self.registry.clone();
            let sink = on_event.clone();
            let chat = chat_id.to_string();
            let message = message_id.to_string();
            set.spawn(async move {
                sink(ToolNotification::status(&call, "started", None)).await;
                let outcome = match registry.get(&call.name) {
                    Some(tool) => tool.invoke(&call.arguments).await,
                    None => Err(GatewayError::Other(format!("unknown tool: {}", call.name))),
                };
                let result = match outcome {
                    Ok(content) => {
                        sink(ToolNotification::status(&call, "completed", None)).await;
                        ToolResult::new(&call, content)
                    }
                    Err(e) => {
                        tracing::warn!(
                            chat_id = %chat,
                            message_id = %message,
                            tool = %call.name,
                            "tool execution failed: {e}"
                        );
                        sink(ToolNotification::status(
                            &call,
                            "error",
                            Some(e.user_message()),
                        ))
                        .await;
                        ToolResult::new(
                            &call,
                            format!("tool {} failed: {}", call.name, e.user_message()),
                        )
                    }
                };
                (slot, result)
            });
        }

        let mut results: Vec<Option<ToolResult>> = vec![None; calls.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((slot, result)) => results[slot] = Some(result),
                Err(e) => tracing::error!("tool task panicked: {e}"),
            }
        }
        // substitute for any task that died without producing a result
        results
            .into_iter()
            .enumerate()
            .map(|(slot, r)| {
                r.unwrap_or_else(|| {
                    ToolResult::new(&calls[slot], "tool execution aborted".to_string())
                })
            })
            .collect()
    }
}
