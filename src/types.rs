use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One of the four roles a message can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// `content` is either a plain string or an ordered sequence of content
/// blocks. Both wire shapes are accepted on ingest (`Message::new` normalizes
/// neither away — it only offers a uniform *view* over either shape via
/// `tool_uses`/`tool_result_ids`, so persistence round-trips byte-for-byte).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<Block>),
}

/// A single content block. `arguments` uses a JSON object rather than a
/// JSON-string, matching the inline-block wire shape (as opposed to the
/// sibling `tool_calls` shape, whose `function.arguments` is itself a
/// JSON-encoded string — see `ToolCall`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        arguments: Map<String, Value>,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

/// Sibling-field tool call representation (OpenAI-style), as opposed to
/// inline `Block::ToolUse`. Exactly one of the two shapes is used per
/// message on ingest, per spec; both are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded string, matching provider convention (spec §6 wire contract).
    pub arguments: String,
}

/// The atomic unit of the conversation stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A normalized view of a tool invocation, regardless of which of the two
/// wire shapes (inline block vs sibling `tool_calls`) produced it.
pub struct ToolUseView<'a> {
    pub id: &'a str,
    pub name: &'a str,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(Content::Text(text.into())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(Content::Text(content.into())),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }

    pub fn assistant_tool_use(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(Content::Blocks(vec![Block::ToolUse {
                id: id.into(),
                name: name.into(),
                arguments,
            }])),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user_tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(Content::Blocks(vec![Block::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
            }])),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    /// Every tool invocation this message carries, from either wire shape.
    pub fn tool_uses(&self) -> Vec<ToolUseView<'_>> {
        let mut out = Vec::new();
        if let Some(Content::Blocks(blocks)) = &self.content {
            for block in blocks {
                if let Block::ToolUse { id, name, .. } = block {
                    out.push(ToolUseView { id, name });
                }
            }
        }
        if let Some(calls) = &self.tool_calls {
            for call in calls {
                out.push(ToolUseView {
                    id: &call.id,
                    name: &call.function.name,
                });
            }
        }
        out
    }

    /// Every `tool_use_id` this message resolves, from either an inline
    /// `tool_result` block or the sibling `tool_call_id` field.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(Content::Blocks(blocks)) = &self.content {
            for block in blocks {
                if let Block::ToolResult { tool_use_id, .. } = block {
                    out.push(tool_use_id.as_str());
                }
            }
        }
        if self.role == Role::Tool {
            if let Some(id) = &self.tool_call_id {
                out.push(id.as_str());
            }
        }
        out
    }

    pub fn has_tool_activity(&self) -> bool {
        !self.tool_uses().is_empty() || !self.tool_result_ids().is_empty()
    }

    /// Text representation used for token estimation and the compression
    /// prompt (mirrors the original `_extract_text_content`).
    pub fn extract_text(&self) -> String {
        match &self.content {
            None => String::new(),
            Some(Content::Text(s)) => s.clone(),
            Some(Content::Blocks(blocks)) => blocks
                .iter()
                .map(|b| match b {
                    Block::Text { text } => text.clone(),
                    Block::ToolUse { name, .. } => format!("[Tool: {name}]"),
                    Block::ToolResult { .. } => "[Tool Result]".to_string(),
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}
