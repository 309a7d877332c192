use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::tools::ToolResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TurnContent {
    Text(String),
    ToolResult(ToolResult),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: Value,
}

/// One persisted message in a session. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: TurnContent,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolCallRecord>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: TurnContent::Text(text.into()), timestamp: Utc::now(), tool: None }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: TurnContent::Text(text.into()), timestamp: Utc::now(), tool: None }
    }

    pub fn tool(name: impl Into<String>, arguments: Value, result: ToolResult) -> Self {
        Self {
            role: Role::Tool,
            content: TurnContent::ToolResult(result),
            timestamp: Utc::now(),
            tool: Some(ToolCallRecord { name: name.into(), arguments }),
        }
    }

    /// Plain-text rendering used for embeddings and prompts.
    pub fn text(&self) -> String {
        match &self.content {
            TurnContent::Text(t) => t.clone(),
            TurnContent::ToolResult(r) => r.observation(),
        }
    }
}
