#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Help,
    New,
    Quit,
    Unknown(String),
}

pub const HELP_TEXT: &str = "\
Commands:
  /help   show this help
  /new    start a new conversation
  /quit   exit
Ctrl-C cancels the current reply. Anything else is sent to the model.
";

pub fn parse_slash_command(input: &str) -> Option<SlashCommand> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let command = trimmed
        .split_whitespace()
        .next()
        .unwrap_or(trimmed)
        .to_string();

    let parsed = match command.as_str() {
        "/help" => SlashCommand::Help,
        "/new" => SlashCommand::New,
        "/quit" | "/exit" => SlashCommand::Quit,
        _ => SlashCommand::Unknown(command),
    };

    Some(parsed)
}
