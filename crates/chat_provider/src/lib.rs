//! Provider-agnostic contract for a streamed chat conversation.
//!
//! This crate defines the message, turn and error types shared by every
//! backend, plus [`ConversationLog`], the history and turn-threading state a
//! backend keeps for one conversation. Transport details live in the backend
//! crates.

use std::error::Error as StdError;
use std::fmt;
use std::sync::{atomic::AtomicBool, Arc};

use thiserror::Error;

/// Shared cancellation flag for one session.
pub type CancelSignal = Arc<AtomicBool>;

/// Lazily produced parts of one model message.
///
/// The stream borrows its conversation; the response is committed to the
/// conversation history when the stream is dropped.
pub type PartStream<'a> = Box<dyn Iterator<Item = Result<MessagePart, ConversationError>> + 'a>;

/// Author of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One incremental fragment of a model message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePart {
    pub text: String,
}

impl MessagePart {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// One role-attributed entry of the conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
}

impl ChatTurn {
    #[must_use]
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

/// Identifiers threading the next outgoing turn to the previous response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationTurnState {
    pub conversation_id: Option<String>,
    pub last_response_message_id: Option<String>,
}

impl ConversationTurnState {
    /// Apply the identifiers of a response's first content-bearing frame.
    ///
    /// The message id always replaces the previous one. A missing conversation
    /// id keeps the known conversation.
    pub fn apply(&mut self, conversation_id: Option<String>, message_id: Option<String>) {
        if conversation_id.is_some() {
            self.conversation_id = conversation_id;
        }
        self.last_response_message_id = message_id;
    }
}

/// Fatal failures of one exchange with the chat service.
#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("response stream ended with an unresolved parse error: {0}")]
    StreamDecode(#[source] Box<dyn StdError + Send + Sync + 'static>),

    #[error("unexpected response from the chat service: {0}")]
    ProtocolViolation(String),

    #[error("chat service request failed: {0}")]
    Transport(String),

    #[error("no data received after sending message")]
    EmptyResponse,
}

/// Error returned while constructing a backend, before any conversation starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInitError {
    message: String,
}

impl BackendInitError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for BackendInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for BackendInitError {}

impl From<String> for BackendInitError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for BackendInitError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Immutable metadata describing a chat backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendProfile {
    pub backend_id: String,
    pub model_id: String,
}

/// One logical exchange with the remote model.
pub trait Conversation: Send {
    /// Append `text` to the history as a `role` turn, send the history and
    /// return the parts of the model's reply.
    fn send_message(&mut self, text: &str, role: Role) -> Result<PartStream<'_>, ConversationError>;

    fn turn_state(&self) -> &ConversationTurnState;

    fn history(&self) -> &[ChatTurn];
}

/// Factory of conversations against one chat service.
pub trait ChatBackend: Send + Sync + 'static {
    fn profile(&self) -> BackendProfile;

    /// Start a conversation with empty history and turn state.
    fn new_conversation(&self) -> Result<Box<dyn Conversation>, BackendInitError>;
}

/// History and turn-threading state of one conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationLog {
    history: Vec<ChatTurn>,
    turn_state: ConversationTurnState,
}

impl ConversationLog {
    #[must_use]
    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    #[must_use]
    pub fn turn_state(&self) -> &ConversationTurnState {
        &self.turn_state
    }

    pub fn push_outgoing(&mut self, role: Role, text: impl Into<String>) {
        self.history.push(ChatTurn::new(role, text));
    }

    /// Start recording a model response. The response becomes an assistant
    /// turn when the recorder is dropped.
    pub fn begin_response(&mut self) -> ResponseRecorder<'_> {
        ResponseRecorder {
            log: self,
            text: String::new(),
            ids_applied: false,
        }
    }
}

/// Accumulates one streamed response into its [`ConversationLog`].
#[derive(Debug)]
pub struct ResponseRecorder<'a> {
    log: &'a mut ConversationLog,
    text: String,
    ids_applied: bool,
}

impl ResponseRecorder<'_> {
    /// Record the identifiers of a content frame. Only the first call per
    /// response updates the turn state.
    pub fn record_ids(&mut self, conversation_id: Option<String>, message_id: Option<String>) {
        if self.ids_applied {
            return;
        }
        self.ids_applied = true;
        self.log.turn_state.apply(conversation_id, message_id);
    }

    pub fn append(&mut self, text: &str) {
        self.text.push_str(text);
    }
}

impl Drop for ResponseRecorder<'_> {
    fn drop(&mut self) {
        if self.text.is_empty() {
            return;
        }
        tracing::trace!(chars = self.text.chars().count(), "committing assistant turn");
        let text = std::mem::take(&mut self.text);
        self.log.history.push(ChatTurn::new(Role::Assistant, text));
    }
}
