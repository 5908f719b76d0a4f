pub mod continuation;
pub mod executor;

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// A tool call fully assembled from streamed deltas.
#[derive(Debug, Clone, Serialize)]
pub struct AssembledToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub name: String,
    pub arguments: String,
}

impl AssembledToolCall {
    /// The `tool_calls` array element shape for a continuation request.
    pub fn to_message_fragment(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "type": self.call_type,
            "function": { "name": self.name, "arguments": self.arguments },
        })
    }
}

/// What the reader should do with an observed SSE payload.
#[derive(Debug)]
pub enum Observation {
    /// Not tool-related: buffer and broadcast as usual.
    Pass,
    /// Carries only tool-call fragments: not part of the visible response.
    Suppress,
    /// `finish_reason = "tool_calls"` seen: execute the assembled calls.
    Complete(Vec<AssembledToolCall>),
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    call_type: String,
    name: String,
    arguments: String,
}

/// Incrementally assembles tool calls from Chat-Completions SSE deltas.
/// Fragments are keyed by the provider-supplied integer `index`; argument
/// fragments are concatenated in arrival order.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    partial: BTreeMap<u64, PartialToolCall>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear assembled state for the next upstream leg of the same session.
    pub fn reset(&mut self) {
        self.partial.clear();
    }

    pub fn observe(&mut self, value: &Value) -> Observation {
        let Some(choice) = value.get("choices").and_then(|c| c.get(0)) else {
            return Observation::Pass;
        };

        let mut saw_fragments = false;
        if let Some(fragments) = choice
            .get("delta")
            .and_then(|d| d.get("tool_calls"))
            .and_then(Value::as_array)
        {
            for fragment in fragments {
                let index = fragment.get("index").and_then(Value::as_u64).unwrap_or(0);
                let entry = self.partial.entry(index).or_default();
                if let Some(id) = fragment.get("id").and_then(Value::as_str) {
                    entry.id = id.to_string();
                }
                if let Some(ty) = fragment.get("type").and_then(Value::as_str) {
                    entry.call_type = ty.to_string();
                }
                if let Some(function) = fragment.get("function") {
                    if let Some(name) = function.get("name").and_then(Value::as_str) {
                        entry.name.push_str(name);
                    }
                    if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                        entry.arguments.push_str(args);
                    }
                }
                saw_fragments = true;
            }
        }

        if choice.get("finish_reason").and_then(Value::as_str) == Some("tool_calls") {
            return Observation::Complete(self.take());
        }

        let has_content = choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
            .is_some_and(|c| !c.is_empty());

        if saw_fragments && !has_content {
            Observation::Suppress
        } else {
            Observation::Pass
        }
    }

    fn take(&mut self) -> Vec<AssembledToolCall> {
        std::mem::take(&mut self.partial)
            .into_values()
            .map(|p| AssembledToolCall {
                id: p.id,
                call_type: if p.call_type.is_empty() {
                    "function".to_string()
                } else {
                    p.call_type
                },
                name: p.name,
                arguments: p.arguments,
            })
            .collect()
    }
}
