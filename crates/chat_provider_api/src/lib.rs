//! `chat_api`-backed implementation of the `chat_provider` contract.
//!
//! Each conversation owns a current-thread tokio runtime and blocks on it one
//! frame at a time, so callers consume replies as a plain iterator.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chat_api::{
    AuthProvider, ChatApiClient, ChatApiConfig, ChatApiError, ChatMessage, ChatRequest, ChatRole,
    FrameStream, StaticBearerAuth, StreamFrame, TokenFileAuth,
};
use chat_provider::{
    BackendInitError, BackendProfile, ChatBackend, ChatTurn, Conversation, ConversationError,
    ConversationLog, ConversationTurnState, MessagePart, PartStream, ResponseRecorder, Role,
};
use tokio::runtime::Runtime;

/// Stable backend identifier used by startup selection.
pub const CHAT_API_BACKEND_ID: &str = "chat-api";

/// Where the backend finds its API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    ApiKey(String),
    TokenFile(PathBuf),
}

/// Runtime configuration for the chat-api backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatApiBackendConfig {
    pub credentials: Credentials,
    pub model: String,
    pub base_url: Option<String>,
    pub timeout: Option<Duration>,
    /// Send `conversation_id` and `parent_message_id` with every turn. Only
    /// endpoints that thread server-side turns accept these fields; the
    /// standard completions endpoint rejects them.
    pub thread_turns: bool,
}

impl ChatApiBackendConfig {
    #[must_use]
    pub fn new(credentials: Credentials, model: impl Into<String>) -> Self {
        Self {
            credentials,
            model: model.into(),
            base_url: None,
            timeout: None,
            thread_turns: false,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_turn_threading(mut self, enabled: bool) -> Self {
        self.thread_turns = enabled;
        self
    }

    fn into_chat_api_config(self) -> Result<ChatApiConfig, BackendInitError> {
        let model = match self.model.trim() {
            "" => chat_api::config::DEFAULT_CHAT_MODEL.to_owned(),
            model => model.to_owned(),
        };
        let mut config = ChatApiConfig::new(model);

        if let Some(base_url) = self.base_url {
            url::Url::parse(base_url.trim()).map_err(|error| {
                BackendInitError::new(format!("Invalid chat-api base URL '{base_url}': {error}"))
            })?;
            config = config.with_base_url(base_url);
        }

        if let Some(timeout) = self.timeout {
            config = config.with_timeout(timeout);
        }

        Ok(config)
    }
}

/// Opens one frame stream per outgoing request.
trait StreamTransport: Send + Sync {
    fn open(&self, runtime: &Runtime, request: &ChatRequest) -> Result<FrameStream, ChatApiError>;
}

struct HttpTransport {
    client: ChatApiClient,
    auth: Arc<dyn AuthProvider>,
}

impl StreamTransport for HttpTransport {
    fn open(&self, runtime: &Runtime, request: &ChatRequest) -> Result<FrameStream, ChatApiError> {
        runtime.block_on(
            self.client
                .open_stream_with_reauth(request, self.auth.as_ref()),
        )
    }
}

/// `ChatBackend` adapter backed by `chat_api` transport primitives.
pub struct ChatApiBackend {
    model: String,
    thread_turns: bool,
    transport: Arc<dyn StreamTransport>,
}

impl ChatApiBackend {
    /// Creates a backend using real HTTP transport.
    pub fn new(config: ChatApiBackendConfig) -> Result<Self, BackendInitError> {
        let auth: Arc<dyn AuthProvider> = match &config.credentials {
            Credentials::ApiKey(key) if key.trim().is_empty() => {
                return Err(BackendInitError::new("chat-api backend requires a non-empty API key"));
            }
            Credentials::ApiKey(key) => Arc::new(StaticBearerAuth::new(key.clone())),
            Credentials::TokenFile(path) => Arc::new(TokenFileAuth::new(path.clone())),
        };
        let thread_turns = config.thread_turns;
        let api_config = config.into_chat_api_config()?;
        let model = api_config.model.clone();
        let client = ChatApiClient::new(api_config).map_err(map_init_error)?;

        Ok(Self {
            model,
            thread_turns,
            transport: Arc::new(HttpTransport { client, auth }),
        })
    }

    #[cfg(test)]
    fn with_transport_for_tests(
        model: &str,
        thread_turns: bool,
        transport: Arc<dyn StreamTransport>,
    ) -> Self {
        Self {
            model: model.to_owned(),
            thread_turns,
            transport,
        }
    }
}

impl ChatBackend for ChatApiBackend {
    fn profile(&self) -> BackendProfile {
        BackendProfile {
            backend_id: CHAT_API_BACKEND_ID.to_owned(),
            model_id: self.model.clone(),
        }
    }

    fn new_conversation(&self) -> Result<Box<dyn Conversation>, BackendInitError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|error| {
                BackendInitError::new(format!("failed to initialize tokio runtime: {error}"))
            })?;

        Ok(Box::new(ChatApiConversation {
            model: self.model.clone(),
            thread_turns: self.thread_turns,
            transport: Arc::clone(&self.transport),
            runtime,
            log: ConversationLog::default(),
        }))
    }
}

/// One conversation against the completions endpoint.
pub struct ChatApiConversation {
    model: String,
    thread_turns: bool,
    transport: Arc<dyn StreamTransport>,
    runtime: Runtime,
    log: ConversationLog,
}

impl ChatApiConversation {
    fn build_request(&self) -> ChatRequest {
        let messages = self
            .log
            .history()
            .iter()
            .map(|turn| ChatMessage::new(chat_role(turn.role), turn.text.clone()))
            .collect();
        let request = ChatRequest::new(self.model.clone(), messages);
        if !self.thread_turns {
            return request;
        }
        let state = self.log.turn_state();
        request.with_thread(
            state.conversation_id.clone(),
            state.last_response_message_id.clone(),
        )
    }
}

impl Conversation for ChatApiConversation {
    fn send_message(&mut self, text: &str, role: Role) -> Result<PartStream<'_>, ConversationError> {
        self.log.push_outgoing(role, text);
        let request = self.build_request();
        tracing::debug!(
            role = role.as_str(),
            turns = request.messages.len(),
            "sending conversation turn"
        );

        let frames = self
            .transport
            .open(&self.runtime, &request)
            .map_err(map_stream_error)?;

        Ok(Box::new(ApiPartStream {
            runtime: &self.runtime,
            frames,
            recorder: self.log.begin_response(),
            finished: false,
        }))
    }

    fn turn_state(&self) -> &ConversationTurnState {
        self.log.turn_state()
    }

    fn history(&self) -> &[ChatTurn] {
        self.log.history()
    }
}

struct ApiPartStream<'a> {
    runtime: &'a Runtime,
    frames: FrameStream,
    recorder: ResponseRecorder<'a>,
    finished: bool,
}

impl Iterator for ApiPartStream<'_> {
    type Item = Result<MessagePart, ConversationError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let frame = match self.runtime.block_on(self.frames.next_frame()) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(error) => {
                    self.finished = true;
                    return Some(Err(map_stream_error(error)));
                }
            };

            match frame {
                StreamFrame::Role { .. } => {}
                StreamFrame::Content { text, ids } => {
                    self.recorder.record_ids(ids.conversation_id, ids.message_id);
                    if text.is_empty() {
                        continue;
                    }
                    self.recorder.append(&text);
                    return Some(Ok(MessagePart::new(text)));
                }
                StreamFrame::Finish { .. } | StreamFrame::Done => break,
            }
        }

        self.finished = true;
        None
    }
}

fn chat_role(role: Role) -> ChatRole {
    match role {
        Role::System => ChatRole::System,
        Role::User => ChatRole::User,
        Role::Assistant => ChatRole::Assistant,
    }
}

fn map_stream_error(error: ChatApiError) -> ConversationError {
    match error {
        ChatApiError::StreamDecode(source) => ConversationError::StreamDecode(Box::new(source)),
        ChatApiError::ProtocolViolation(message) => ConversationError::ProtocolViolation(message),
        ChatApiError::EmptyResponse => ConversationError::EmptyResponse,
        other => ConversationError::Transport(other.to_string()),
    }
}

fn map_init_error(error: ChatApiError) -> BackendInitError {
    BackendInitError::new(format!("Failed to initialize chat-api backend: {error}"))
}
