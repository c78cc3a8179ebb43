use serde::{Deserialize, Serialize};

use crate::events::ChatRole;

/// One history entry sent to the completions endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Canonical request payload for a streamed chat completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    /// Default: true.
    #[serde(default = "default_true")]
    pub stream: bool,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            stream: true,
            messages,
            conversation_id: None,
            parent_message_id: None,
        }
    }

    /// Thread ids for endpoints that link turns server-side. Standard
    /// completions endpoints reject these fields.
    pub fn with_thread(
        mut self,
        conversation_id: Option<String>,
        parent_message_id: Option<String>,
    ) -> Self {
        self.conversation_id = conversation_id;
        self.parent_message_id = parent_message_id;
        self
    }
}
