//! Session worker: runs the orchestrator on its own thread and talks to the
//! caller over channels.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chat_provider::{CancelSignal, ChatBackend, Conversation, Role};

use crate::orchestrator::{AgentError, Caller, ExchangeOutcome, Orchestrator, ResponseEvent};

/// Messages from the caller to the session worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    /// Next user message; only read while the session awaits input.
    Message(String),
    /// Answer to `ConfirmRunCommand`.
    Confirm(bool),
    /// Answer to `CommandsOverflow`.
    OverflowLength(usize),
    /// Wakes a worker blocked on an answer after the cancel flag was set.
    Cancel,
    /// Drop the conversation and start over with the bootstrap prompt.
    NewConversation,
    Shutdown,
}

/// Messages from the session worker to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Response(ResponseEvent),
    /// The worker waits for a `SessionInput::Message`.
    AwaitingInput,
    /// The current exchange was cancelled.
    Cancelled,
    /// A new conversation replaced the previous one.
    ConversationReset,
    /// Fatal error; the worker has stopped.
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("session worker has stopped")]
pub struct SessionClosed;

/// Requests cancellation of the running exchange. Cheap to clone and safe to
/// use from a signal thread.
#[derive(Debug, Clone)]
pub struct Canceller {
    flag: CancelSignal,
    inputs: Sender<SessionInput>,
}

impl Canceller {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.inputs.send(SessionInput::Cancel);
    }
}

/// Everything a session worker needs.
pub struct Session {
    backend: Arc<dyn ChatBackend>,
    orchestrator: Orchestrator,
    bootstrap_prompt: String,
}

impl Session {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        orchestrator: Orchestrator,
        bootstrap_prompt: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            orchestrator,
            bootstrap_prompt: bootstrap_prompt.into(),
        }
    }

    /// Start the worker. It sends the bootstrap prompt right away.
    pub fn spawn(self) -> std::io::Result<SessionHandle> {
        let (input_tx, input_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let cancel: CancelSignal = Arc::new(AtomicBool::new(false));

        let worker_cancel = Arc::clone(&cancel);
        let worker = thread::Builder::new()
            .name("shellmate-session".to_string())
            .spawn(move || self.run_worker(input_rx, event_tx, worker_cancel))?;

        Ok(SessionHandle {
            inputs: input_tx,
            events: event_rx,
            cancel,
            worker: Some(worker),
        })
    }

    fn run_worker(
        self,
        inputs: Receiver<SessionInput>,
        events: Sender<SessionEvent>,
        cancel: CancelSignal,
    ) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.run(&inputs, &events, &cancel)
        }));
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(AgentError::CallerGone)) => {
                tracing::debug!("session caller disconnected");
                return;
            }
            Ok(Err(error)) => error.to_string(),
            Err(_) => "session worker panicked".to_string(),
        };
        tracing::error!(error = %failure, "session failed");
        let _ = events.send(SessionEvent::Failed(failure));
    }

    fn run(
        &self,
        inputs: &Receiver<SessionInput>,
        events: &Sender<SessionEvent>,
        cancel: &CancelSignal,
    ) -> Result<(), AgentError> {
        let mut conversation = self.backend.new_conversation()?;
        let profile = self.backend.profile();
        tracing::info!(backend = %profile.backend_id, model = %profile.model_id, "session started");

        let mut next = Some((self.bootstrap_prompt.clone(), Role::User));
        loop {
            if let Some((text, role)) = next.take() {
                self.run_exchange(conversation.as_mut(), &text, role, inputs, events, cancel)?;
                send(events, SessionEvent::AwaitingInput)?;
            }

            match inputs.recv() {
                Ok(SessionInput::Message(text)) => next = Some((text, Role::User)),
                Ok(SessionInput::NewConversation) => {
                    conversation = self.backend.new_conversation()?;
                    tracing::info!("conversation reset");
                    send(events, SessionEvent::ConversationReset)?;
                    next = Some((self.bootstrap_prompt.clone(), Role::User));
                }
                Ok(SessionInput::Shutdown) | Err(_) => return Ok(()),
                Ok(other) => tracing::debug!(input = ?other, "ignoring input while idle"),
            }
        }
    }

    fn run_exchange(
        &self,
        conversation: &mut dyn Conversation,
        text: &str,
        role: Role,
        inputs: &Receiver<SessionInput>,
        events: &Sender<SessionEvent>,
        cancel: &CancelSignal,
    ) -> Result<(), AgentError> {
        let mut caller = ChannelCaller {
            inputs,
            events,
            cancel,
        };
        match self.orchestrator.exchange(conversation, text, role, &mut caller)? {
            ExchangeOutcome::Completed => Ok(()),
            ExchangeOutcome::Cancelled => send(events, SessionEvent::Cancelled),
        }
    }
}

/// Orchestrator caller backed by the session channels.
struct ChannelCaller<'a> {
    inputs: &'a Receiver<SessionInput>,
    events: &'a Sender<SessionEvent>,
    cancel: &'a CancelSignal,
}

impl ChannelCaller<'_> {
    /// Wait for the reply `accept` picks out. A cancel request answers with
    /// `on_cancel`; the orchestrator then sees the cancel flag.
    fn await_reply<T>(
        &self,
        on_cancel: T,
        accept: impl Fn(SessionInput) -> Option<T>,
    ) -> Result<T, AgentError> {
        loop {
            match self.inputs.recv() {
                Ok(SessionInput::Cancel) if self.cancel_requested() => return Ok(on_cancel),
                Ok(SessionInput::Shutdown) | Err(_) => return Err(AgentError::CallerGone),
                Ok(input) => {
                    if let Some(reply) = accept(input.clone()) {
                        return Ok(reply);
                    }
                    tracing::debug!(?input, "ignoring input while waiting for a reply");
                }
            }
        }
    }
}

impl Caller for ChannelCaller<'_> {
    fn emit(&mut self, event: ResponseEvent) -> Result<(), AgentError> {
        send(self.events, SessionEvent::Response(event))
    }

    fn confirm_command(&mut self, command: &str) -> Result<bool, AgentError> {
        self.emit(ResponseEvent::ConfirmRunCommand {
            command: command.to_string(),
        })?;
        self.await_reply(false, |input| match input {
            SessionInput::Confirm(approved) => Some(approved),
            _ => None,
        })
    }

    fn overflow_length(
        &mut self,
        default_value: usize,
        actual_length: usize,
    ) -> Result<usize, AgentError> {
        self.emit(ResponseEvent::CommandsOverflow {
            default_value,
            actual_length,
        })?;
        self.await_reply(default_value, |input| match input {
            SessionInput::OverflowLength(length) => Some(length),
            _ => None,
        })
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

fn send(events: &Sender<SessionEvent>, event: SessionEvent) -> Result<(), AgentError> {
    events.send(event).map_err(|_| AgentError::CallerGone)
}

/// Caller side of a running session.
#[derive(Debug)]
pub struct SessionHandle {
    inputs: Sender<SessionInput>,
    events: Receiver<SessionEvent>,
    cancel: CancelSignal,
    worker: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Queue `input` for the worker. Inputs that start an exchange clear the
    /// cancel flag here, so a cancel issued after this call applies to them.
    pub fn send(&self, input: SessionInput) -> Result<(), SessionClosed> {
        if matches!(
            input,
            SessionInput::Message(_) | SessionInput::NewConversation
        ) {
            self.cancel.store(false, Ordering::SeqCst);
        }
        self.inputs.send(input).map_err(|_| SessionClosed)
    }

    /// Block for the next event. `None` once the worker has stopped.
    pub fn next_event(&self) -> Option<SessionEvent> {
        self.events.recv().ok()
    }

    pub fn canceller(&self) -> Canceller {
        Canceller {
            flag: Arc::clone(&self.cancel),
            inputs: self.inputs.clone(),
        }
    }

    pub fn cancel(&self) {
        self.canceller().cancel();
    }

    /// Ask the worker to stop and wait for it.
    pub fn shutdown(mut self) {
        let _ = self.inputs.send(SessionInput::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.inputs.send(SessionInput::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.is_finished() {
                let _ = worker.join();
            }
        }
    }
}
