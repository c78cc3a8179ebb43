//! Drives one exchange: send a turn, relay the streamed reply, run the
//! commands it contains and feed their results back until the model stops
//! asking for commands.

use std::path::PathBuf;
use std::time::Duration;

use chat_provider::{BackendInitError, Conversation, ConversationError, Role};
use thiserror::Error;

use crate::budget::{
    compose_results, result_trailer, system_message, truncate_results, CommandRecord,
    ResultBudget, DEFAULT_RESULT_BUDGET, RESULT_HEADER,
};
use crate::exec::{self, ExecOutput, DEFAULT_COMMAND_TIMEOUT, UNKNOWN_EXIT_CODE};
use crate::fence::{CommandExtractor, Extracted, FenceSyntax};

/// What the caller observes while an exchange runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    /// A model message starts.
    NewMessage,
    /// Plain text of the current model message.
    MessageChunk(String),
    /// Framing or output of a command. `ignored` output exceeded the budget
    /// and is not sent back to the model.
    CommandResult { text: String, ignored: bool },
    /// Waits for a yes/no answer before the command runs.
    ConfirmRunCommand { command: String },
    /// Waits for the number of result characters to send.
    CommandsOverflow {
        default_value: usize,
        actual_length: usize,
    },
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Conversation(#[from] ConversationError),

    #[error("failed to start a conversation: {0}")]
    Backend(#[from] BackendInitError),

    #[error("session caller went away")]
    CallerGone,
}

/// The party answering suspension points.
pub trait Caller {
    fn emit(&mut self, event: ResponseEvent) -> Result<(), AgentError>;

    /// Present `ConfirmRunCommand` and wait for the answer.
    fn confirm_command(&mut self, command: &str) -> Result<bool, AgentError>;

    /// Present `CommandsOverflow` and wait for the number of characters.
    fn overflow_length(
        &mut self,
        default_value: usize,
        actual_length: usize,
    ) -> Result<usize, AgentError>;

    fn cancel_requested(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// The last model message ran no command.
    Completed,
    /// The caller cancelled; pending results were discarded.
    Cancelled,
}

enum Halt {
    Cancelled,
    Fatal(AgentError),
}

impl From<AgentError> for Halt {
    fn from(error: AgentError) -> Self {
        Self::Fatal(error)
    }
}

impl From<ConversationError> for Halt {
    fn from(error: ConversationError) -> Self {
        Self::Fatal(error.into())
    }
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    syntax: FenceSyntax,
    workdir: PathBuf,
    command_timeout: Option<Duration>,
    result_budget: usize,
}

impl Orchestrator {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            syntax: FenceSyntax::default(),
            workdir: workdir.into(),
            command_timeout: Some(DEFAULT_COMMAND_TIMEOUT),
            result_budget: DEFAULT_RESULT_BUDGET,
        }
    }

    pub fn with_fence_syntax(mut self, syntax: FenceSyntax) -> Self {
        self.syntax = syntax;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_result_budget(mut self, budget: usize) -> Self {
        self.result_budget = budget;
        self
    }

    /// Send `text` as a `role` turn, then keep answering with command results
    /// as system turns for as long as the model runs commands.
    pub fn exchange(
        &self,
        conversation: &mut dyn Conversation,
        text: &str,
        role: Role,
        caller: &mut dyn Caller,
    ) -> Result<ExchangeOutcome, AgentError> {
        let mut outgoing = text.to_string();
        let mut role = role;
        loop {
            match self.relay_message(conversation, &outgoing, role, caller) {
                Ok(Some(follow_up)) => {
                    tracing::debug!(chars = follow_up.chars().count(), "sending command results");
                    outgoing = follow_up;
                    role = Role::System;
                }
                Ok(None) => return Ok(ExchangeOutcome::Completed),
                Err(Halt::Cancelled) => {
                    tracing::info!("exchange cancelled");
                    return Ok(ExchangeOutcome::Cancelled);
                }
                Err(Halt::Fatal(error)) => return Err(error),
            }
        }
    }

    /// One model message. Returns the follow-up turn when any command ran.
    fn relay_message(
        &self,
        conversation: &mut dyn Conversation,
        text: &str,
        role: Role,
        caller: &mut dyn Caller,
    ) -> Result<Option<String>, Halt> {
        let parts = conversation.send_message(text, role)?;
        emit(caller, ResponseEvent::NewMessage)?;

        let mut extractor = CommandExtractor::new(self.syntax.clone());
        let mut pass = MessagePass {
            budget: ResultBudget::new(self.result_budget),
            records: Vec::new(),
        };
        for part in parts {
            let part = part?;
            for extracted in extractor.push(&part.text) {
                self.handle_extracted(extracted, &mut pass, caller)?;
            }
        }
        for extracted in extractor.finish() {
            self.handle_extracted(extracted, &mut pass, caller)?;
        }
        emit(caller, ResponseEvent::MessageChunk("\n".to_string()))?;

        if pass.records.is_empty() {
            return Ok(None);
        }

        let composed = compose_results(&pass.records);
        let actual_length = composed.chars().count();
        let results = if actual_length > self.result_budget {
            tracing::info!(
                actual_length,
                limit = self.result_budget,
                "command results exceed the budget"
            );
            let length = caller.overflow_length(self.result_budget, actual_length)?;
            check_cancel(caller)?;
            truncate_results(&pass.records, length)
        } else {
            composed
        };
        Ok(Some(system_message(&results)))
    }

    fn handle_extracted(
        &self,
        extracted: Extracted,
        pass: &mut MessagePass,
        caller: &mut dyn Caller,
    ) -> Result<(), Halt> {
        match extracted {
            Extracted::Text(text) => emit(caller, ResponseEvent::MessageChunk(text)),
            Extracted::Command(command) => self.offer_command(&command, pass, caller),
        }
    }

    fn offer_command(
        &self,
        command: &str,
        pass: &mut MessagePass,
        caller: &mut dyn Caller,
    ) -> Result<(), Halt> {
        let approved = caller.confirm_command(command)?;
        check_cancel(caller)?;
        if !approved {
            tracing::debug!("command declined");
            return Ok(());
        }

        emit(caller, result_event(RESULT_HEADER, false))?;
        let mut output = String::new();
        let status = match exec::execute(command, &self.workdir, self.command_timeout) {
            Ok(execution) => {
                let mut status = UNKNOWN_EXIT_CODE;
                for item in execution {
                    match item {
                        ExecOutput::Out(text) | ExecOutput::Err(text) => {
                            let (inside, excess) = pass.budget.split(&text);
                            if !inside.is_empty() {
                                output.push_str(&inside);
                                emit(caller, result_event(&inside, false))?;
                            }
                            if !excess.is_empty() {
                                emit(caller, result_event(&excess, true))?;
                            }
                        }
                        ExecOutput::Status(code) => status = code,
                    }
                }
                status
            }
            Err(error) => {
                tracing::warn!(%error, "command could not be started");
                let text = format!("Failed to execute the command: {error}");
                output.push_str(&text);
                emit(caller, result_event(&text, false))?;
                UNKNOWN_EXIT_CODE
            }
        };
        emit(caller, result_event(&result_trailer(status), false))?;
        pass.records.push(CommandRecord::new(output, status));
        Ok(())
    }
}

struct MessagePass {
    budget: ResultBudget,
    records: Vec<CommandRecord>,
}

fn result_event(text: &str, ignored: bool) -> ResponseEvent {
    ResponseEvent::CommandResult {
        text: text.to_string(),
        ignored,
    }
}

fn emit(caller: &mut dyn Caller, event: ResponseEvent) -> Result<(), Halt> {
    caller.emit(event)?;
    check_cancel(caller)
}

fn check_cancel(caller: &dyn Caller) -> Result<(), Halt> {
    if caller.cancel_requested() {
        return Err(Halt::Cancelled);
    }
    Ok(())
}
