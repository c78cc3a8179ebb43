use serde::{Deserialize, Serialize};

/// Author role carried by chat messages and role-delta frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "system" => Self::System,
            "user" => Self::User,
            "assistant" => Self::Assistant,
            _ => return None,
        })
    }
}

/// Identifiers a content frame carries for threading the next turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameIds {
    pub message_id: Option<String>,
    pub conversation_id: Option<String>,
}

/// One decoded frame of the completion event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// Role marker that opens a message; carries no text.
    Role { role: ChatRole },
    /// Incremental text of the message.
    Content { text: String, ids: FrameIds },
    /// The model finished the message (`finish_reason` set).
    Finish { reason: String },
    /// The `[DONE]` sentinel.
    Done,
}

impl StreamFrame {
    /// Returns true when no further frames belong to the current message.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. } | Self::Done)
    }
}
