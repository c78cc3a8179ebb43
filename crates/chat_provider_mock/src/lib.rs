//! Deterministic scripted implementation of the `chat_provider` contract.
//!
//! Replies are taken from a shared script in order, across every conversation
//! the backend creates, and every outgoing turn is recorded for inspection.
//! This crate contains no transport logic and is intended for local runs and
//! orchestrator tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chat_provider::{
    BackendInitError, BackendProfile, ChatBackend, ChatTurn, Conversation, ConversationError,
    ConversationLog, ConversationTurnState, MessagePart, PartStream, ResponseRecorder, Role,
};

/// Stable backend identifier used for explicit startup selection.
pub const MOCK_BACKEND_ID: &str = "mock";

const MOCK_MODEL_ID: &str = "mock";
const FALLBACK_REPLY: &str = "The mock backend has nothing more to say.\n";

/// Failure a scripted reply ends with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// The request is rejected before any part is produced.
    Transport,
    /// The response body is empty.
    EmptyResponse,
    /// The stream carries a frame the client does not understand.
    ProtocolViolation,
    /// The stream ends inside an undecodable frame.
    StreamDecode,
}

/// One scripted model reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockReply {
    pub parts: Vec<String>,
    pub failure: Option<MockFailure>,
}

impl MockReply {
    /// Reply delivered exactly as the given parts.
    #[must_use]
    pub fn parts<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            parts: parts.into_iter().map(Into::into).collect(),
            failure: None,
        }
    }

    /// Reply split into word-sized parts, the way a streamed reply arrives.
    #[must_use]
    pub fn streamed(text: &str) -> Self {
        let mut parts = Vec::new();
        let mut pending = String::new();
        for ch in text.chars() {
            pending.push(ch);
            if matches!(ch, ' ' | '\n') {
                parts.push(std::mem::take(&mut pending));
            }
        }
        if !pending.is_empty() {
            parts.push(pending);
        }
        Self {
            parts,
            failure: None,
        }
    }

    #[must_use]
    pub fn failing(failure: MockFailure) -> Self {
        Self {
            parts: Vec::new(),
            failure: Some(failure),
        }
    }

    /// Deliver the parts, then fail.
    #[must_use]
    pub fn then_fail(mut self, failure: MockFailure) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// One outgoing turn observed by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub conversation: usize,
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Default)]
struct ScriptState {
    replies: VecDeque<MockReply>,
    sent: Vec<SentMessage>,
    conversations: usize,
    responses: usize,
}

/// Scripted backend used by tests and local runs.
#[derive(Debug, Clone)]
pub struct MockBackend {
    state: Arc<Mutex<ScriptState>>,
    part_delay: Duration,
}

impl MockBackend {
    #[must_use]
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                replies: replies.into(),
                ..ScriptState::default()
            })),
            part_delay: Duration::ZERO,
        }
    }

    /// Pause between parts, to make local runs look streamed.
    #[must_use]
    pub fn with_part_delay(mut self, delay: Duration) -> Self {
        self.part_delay = delay;
        self
    }

    /// Outgoing turns in the order they were sent.
    #[must_use]
    pub fn sent_messages(&self) -> Vec<SentMessage> {
        lock_unpoisoned(&self.state).sent.clone()
    }
}

impl Default for MockBackend {
    /// A short demo session that asks to run two commands.
    fn default() -> Self {
        Self::new(vec![
            MockReply::streamed(
                "Hello! I am connected to your shell. Tell me what you would like to look at.\n",
            ),
            MockReply::streamed(concat!(
                "Sure. Let me look at the system first.\n",
                "\n",
                "=== COMMAND START ===\n",
                "uname -a\n",
                "=== COMMAND END ===\n",
                "\n",
                "And the disk usage of the working directory:\n",
                "    === COMMAND START ===\n",
                "    df -h .\n",
                "    === COMMAND END ===\n",
            )),
            MockReply::streamed(
                "Thanks, I can see the results. Anything else you would like me to run?\n",
            ),
        ])
    }
}

impl ChatBackend for MockBackend {
    fn profile(&self) -> BackendProfile {
        BackendProfile {
            backend_id: MOCK_BACKEND_ID.to_owned(),
            model_id: MOCK_MODEL_ID.to_owned(),
        }
    }

    fn new_conversation(&self) -> Result<Box<dyn Conversation>, BackendInitError> {
        let index = {
            let mut state = lock_unpoisoned(&self.state);
            state.conversations += 1;
            state.conversations
        };

        Ok(Box::new(MockConversation {
            index,
            state: Arc::clone(&self.state),
            part_delay: self.part_delay,
            log: ConversationLog::default(),
        }))
    }
}

struct MockConversation {
    index: usize,
    state: Arc<Mutex<ScriptState>>,
    part_delay: Duration,
    log: ConversationLog,
}

impl Conversation for MockConversation {
    fn send_message(&mut self, text: &str, role: Role) -> Result<PartStream<'_>, ConversationError> {
        self.log.push_outgoing(role, text);

        let (reply, response) = {
            let mut state = lock_unpoisoned(&self.state);
            state.sent.push(SentMessage {
                conversation: self.index,
                role,
                text: text.to_owned(),
            });
            state.responses += 1;
            let reply = state
                .replies
                .pop_front()
                .unwrap_or_else(|| MockReply::streamed(FALLBACK_REPLY));
            (reply, state.responses)
        };
        tracing::debug!(
            conversation = self.index,
            role = role.as_str(),
            parts = reply.parts.len(),
            "mock reply selected"
        );

        if reply.failure == Some(MockFailure::Transport) {
            return Err(ConversationError::Transport(
                "HTTP 401 Unauthorized mock rejection".to_owned(),
            ));
        }

        Ok(Box::new(MockPartStream {
            recorder: self.log.begin_response(),
            parts: reply.parts.into(),
            failure: reply.failure,
            conversation_id: format!("mock-conversation-{}", self.index),
            message_id: format!("mock-message-{response}"),
            part_delay: self.part_delay,
            delivered: false,
        }))
    }

    fn turn_state(&self) -> &ConversationTurnState {
        self.log.turn_state()
    }

    fn history(&self) -> &[ChatTurn] {
        self.log.history()
    }
}

struct MockPartStream<'a> {
    recorder: ResponseRecorder<'a>,
    parts: VecDeque<String>,
    failure: Option<MockFailure>,
    conversation_id: String,
    message_id: String,
    part_delay: Duration,
    delivered: bool,
}

impl Iterator for MockPartStream<'_> {
    type Item = Result<MessagePart, ConversationError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(text) = self.parts.pop_front() {
            if !self.part_delay.is_zero() {
                thread::sleep(self.part_delay);
            }
            self.delivered = true;
            self.recorder.record_ids(
                Some(self.conversation_id.clone()),
                Some(self.message_id.clone()),
            );
            self.recorder.append(&text);
            return Some(Ok(MessagePart::new(text)));
        }

        let error = match self.failure.take()? {
            MockFailure::Transport => ConversationError::Transport("mock transport failure".to_owned()),
            MockFailure::EmptyResponse if !self.delivered => ConversationError::EmptyResponse,
            MockFailure::EmptyResponse => return None,
            MockFailure::ProtocolViolation => ConversationError::ProtocolViolation(
                "expected exactly one choice, got 0: {\"choices\":[]}".to_owned(),
            ),
            MockFailure::StreamDecode => ConversationError::StreamDecode(Box::new(
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "EOF while parsing an object"),
            )),
        };
        Some(Err(error))
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
