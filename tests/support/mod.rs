#![allow(dead_code)]

use std::collections::VecDeque;

use shellmate::orchestrator::{AgentError, Caller, ResponseEvent};

/// Caller answering suspension points from a script and recording every
/// event it sees.
#[derive(Default)]
pub struct ScriptedCaller {
    pub events: Vec<ResponseEvent>,
    confirmations: VecDeque<bool>,
    overflow_answers: VecDeque<usize>,
    cancel_when: Option<fn(&ResponseEvent) -> bool>,
    cancelled: bool,
}

impl ScriptedCaller {
    pub fn approving(count: usize) -> Self {
        Self::with_confirmations(vec![true; count])
    }

    pub fn with_confirmations(confirmations: Vec<bool>) -> Self {
        Self {
            confirmations: confirmations.into(),
            ..Self::default()
        }
    }

    pub fn answer_overflow(mut self, length: usize) -> Self {
        self.overflow_answers.push_back(length);
        self
    }

    /// Request cancellation right after the first event matching `when`.
    pub fn cancel_on(mut self, when: fn(&ResponseEvent) -> bool) -> Self {
        self.cancel_when = Some(when);
        self
    }

    pub fn chunks(&self) -> String {
        self.events
            .iter()
            .filter_map(|event| match event {
                ResponseEvent::MessageChunk(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Command output characters, split into (relayed, ignored).
    pub fn result_text(&self, ignored: bool) -> String {
        self.events
            .iter()
            .filter_map(|event| match event {
                ResponseEvent::CommandResult {
                    text,
                    ignored: flag,
                } if *flag == ignored => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_command_results(&self) -> bool {
        self.events
            .iter()
            .any(|event| matches!(event, ResponseEvent::CommandResult { .. }))
    }

    fn record(&mut self, event: ResponseEvent) {
        if self.cancel_when.is_some_and(|when| when(&event)) {
            self.cancelled = true;
        }
        self.events.push(event);
    }
}

impl Caller for ScriptedCaller {
    fn emit(&mut self, event: ResponseEvent) -> Result<(), AgentError> {
        self.record(event);
        Ok(())
    }

    fn confirm_command(&mut self, command: &str) -> Result<bool, AgentError> {
        self.record(ResponseEvent::ConfirmRunCommand {
            command: command.to_string(),
        });
        Ok(self.confirmations.pop_front().unwrap_or(false))
    }

    fn overflow_length(
        &mut self,
        default_value: usize,
        actual_length: usize,
    ) -> Result<usize, AgentError> {
        self.record(ResponseEvent::CommandsOverflow {
            default_value,
            actual_length,
        });
        Ok(self.overflow_answers.pop_front().unwrap_or(default_value))
    }

    fn cancel_requested(&self) -> bool {
        self.cancelled
    }
}

pub fn fenced(command: &str) -> String {
    format!("=== COMMAND START ===\n{command}\n=== COMMAND END ===")
}
