use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who produced a chunk. Agents only report what they produce, so there is no
/// user or system role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Assistant => f.write_str("assistant"),
            Role::Tool => f.write_str("tool"),
        }
    }
}

/// Structured tool invocation carried by a chunk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub args: serde_json::Map<String, serde_json::Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Builds a tool call from a JSON value; non-object values become an empty map.
    pub fn from_value(name: impl Into<String>, args: serde_json::Value) -> Self {
        let args = match args {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Self::new(name, args)
    }
}

/// Content delta of a chunk: a text fragment or a structured payload (tool
/// results are usually structured).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Json(serde_json::Value),
}

impl Content {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(text) => Some(text),
            Content::Json(_) => None,
        }
    }
}

impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Content::Text(value.to_string())
    }
}

impl From<String> for Content {
    fn from(value: String) -> Self {
        Content::Text(value)
    }
}

impl From<serde_json::Value> for Content {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(text) => Content::Text(text),
            other => Content::Json(other),
        }
    }
}

/// One increment of a streamed message.
///
/// Chunks sharing `stream_id` form one logical message; `index` is the
/// reordering key within that stream and need not be contiguous. Exactly one
/// chunk per stream is expected to carry `is_terminal`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    #[serde(rename = "id")]
    pub stream_id: Uuid,
    pub index: u64,
    pub role: Role,
    #[serde(rename = "reasoning_content", default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    #[serde(rename = "is_stop")]
    pub is_terminal: bool,
}

impl ExecutionRecord {
    pub fn new(stream_id: Uuid, index: u64, role: Role) -> Self {
        Self {
            stream_id,
            index,
            role,
            reasoning: None,
            content: None,
            tool_call: None,
            is_terminal: false,
        }
    }

    pub fn with_content(mut self, content: impl Into<Content>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_tool_call(mut self, tool_call: ToolCall) -> Self {
        self.tool_call = Some(tool_call);
        self
    }

    /// Marks this chunk as the last one of its stream.
    pub fn terminal(mut self) -> Self {
        self.is_terminal = true;
        self
    }
}
