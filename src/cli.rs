//! Line-oriented terminal front end for a session.

use std::io::{BufRead, Write};

use anyhow::{bail, Context, Result};

use crate::commands::{parse_slash_command, SlashCommand, HELP_TEXT};
use crate::orchestrator::ResponseEvent;
use crate::session::{SessionEvent, SessionHandle, SessionInput};

pub const ASSISTANT_LABEL: &str = "Assistant: ";
pub const USER_LABEL: &str = "You: ";
pub const CONFIRM_PROMPT: &str = "\nRun command? [y/N]: ";

pub fn overflow_prompt(default_value: usize, actual_length: usize) -> String {
    format!(
        "\nResults length exceeds the limit ({actual_length}/{default_value}), \
         how many characters do you want to send? (default: {default_value}): "
    )
}

/// Empty input picks the default; anything else must be a non-negative integer.
pub fn parse_overflow_answer(answer: &str, default_value: usize) -> Option<usize> {
    let answer = answer.trim();
    if answer.is_empty() {
        return Some(default_value);
    }
    answer.parse().ok()
}

pub fn parse_confirmation(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Relay session events to `output` and answers read from `input` back to
/// the session until the user quits, input ends or the session stops.
pub struct Cli<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Cli<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn into_output(self) -> W {
        self.output
    }

    pub fn run(&mut self, session: &SessionHandle) -> Result<()> {
        while let Some(event) = session.next_event() {
            let keep_going = match event {
                SessionEvent::Response(response) => self.on_response(session, response)?,
                SessionEvent::AwaitingInput => self.on_awaiting_input(session)?,
                SessionEvent::Cancelled => {
                    self.write("\n[cancelled]\n")?;
                    true
                }
                SessionEvent::ConversationReset => {
                    self.write("[new conversation]\n")?;
                    true
                }
                SessionEvent::Failed(error) => bail!("session failed: {error}"),
            };
            if !keep_going {
                let _ = session.send(SessionInput::Shutdown);
                return Ok(());
            }
        }
        Ok(())
    }

    fn on_response(&mut self, session: &SessionHandle, event: ResponseEvent) -> Result<bool> {
        match event {
            ResponseEvent::NewMessage => self.write(ASSISTANT_LABEL)?,
            ResponseEvent::MessageChunk(text) => self.write(&text)?,
            ResponseEvent::CommandResult { text, .. } => self.write(&text)?,
            ResponseEvent::ConfirmRunCommand { .. } => {
                self.write(CONFIRM_PROMPT)?;
                let approved = self.read_line()?.is_some_and(|answer| parse_confirmation(&answer));
                send(session, SessionInput::Confirm(approved))?;
            }
            ResponseEvent::CommandsOverflow {
                default_value,
                actual_length,
            } => {
                let length = loop {
                    self.write(&overflow_prompt(default_value, actual_length))?;
                    let Some(answer) = self.read_line()? else {
                        break default_value;
                    };
                    if let Some(length) = parse_overflow_answer(&answer, default_value) {
                        break length;
                    }
                    self.write("Please enter a number.")?;
                };
                send(session, SessionInput::OverflowLength(length))?;
            }
        }
        Ok(true)
    }

    fn on_awaiting_input(&mut self, session: &SessionHandle) -> Result<bool> {
        loop {
            self.write(USER_LABEL)?;
            let Some(line) = self.read_line()? else {
                self.write("\n")?;
                return Ok(false);
            };
            match parse_slash_command(&line) {
                None if line.trim().is_empty() => continue,
                None => {
                    send(session, SessionInput::Message(line.trim().to_string()))?;
                    return Ok(true);
                }
                Some(SlashCommand::Help) => self.write(HELP_TEXT)?,
                Some(SlashCommand::New) => {
                    send(session, SessionInput::NewConversation)?;
                    return Ok(true);
                }
                Some(SlashCommand::Quit) => return Ok(false),
                Some(SlashCommand::Unknown(name)) => {
                    self.write(&format!("Unknown command {name}; try /help\n"))?
                }
            }
        }
    }

    fn write(&mut self, text: &str) -> Result<()> {
        self.output
            .write_all(text.as_bytes())
            .and_then(|()| self.output.flush())
            .context("failed to write to the terminal")
    }

    /// One line without its line break, or `None` at end of input.
    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .context("failed to read from the terminal")?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
    }
}

fn send(session: &SessionHandle, input: SessionInput) -> Result<()> {
    session
        .send(input)
        .context("session stopped while waiting for an answer")
}

#[cfg(test)]
mod tests {
    use super::{overflow_prompt, parse_confirmation, parse_overflow_answer};

    #[test]
    fn confirmation_defaults_to_no() {
        assert!(parse_confirmation("y"));
        assert!(parse_confirmation(" YES "));
        assert!(!parse_confirmation(""));
        assert!(!parse_confirmation("sure"));
    }

    #[test]
    fn overflow_answer_defaults_when_empty() {
        assert_eq!(parse_overflow_answer("", 1000), Some(1000));
        assert_eq!(parse_overflow_answer(" 250 ", 1000), Some(250));
        assert_eq!(parse_overflow_answer("0", 1000), Some(0));
        assert_eq!(parse_overflow_answer("-3", 1000), None);
    }

    #[test]
    fn overflow_prompt_shows_both_lengths() {
        assert_eq!(
            overflow_prompt(1000, 1234),
            "\nResults length exceeds the limit (1234/1000), how many characters do you want to send? (default: 1000): "
        );
    }
}
