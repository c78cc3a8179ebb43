//! Command fence detection in streamed model text.
//!
//! A fence is a start marker line, a body, and an end marker line. Both marker
//! lines carry the same leading whitespace, which is also stripped from every
//! body line:
//!
//! ```text
//!   === COMMAND START ===
//!   ls -la
//!   === COMMAND END ===
//! ```
//!
//! Marker lines may end in `\r\n`; the carriage returns are dropped from the
//! command body.

pub const DEFAULT_START_MARKER: &str = "=== COMMAND START ===";
pub const DEFAULT_END_MARKER: &str = "=== COMMAND END ===";

/// Marker lines that open and close a command fence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FenceSyntax {
    start: String,
    end: String,
}

impl Default for FenceSyntax {
    fn default() -> Self {
        Self::new(DEFAULT_START_MARKER, DEFAULT_END_MARKER)
    }
}

impl FenceSyntax {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Markers keyed to a session token, e.g. `=== COMMAND START <token> ===`.
    pub fn with_token(token: &str) -> Self {
        let token = token.trim();
        if token.is_empty() {
            return Self::default();
        }
        Self::new(
            format!("=== COMMAND START {token} ==="),
            format!("=== COMMAND END {token} ==="),
        )
    }

    pub fn start_marker(&self) -> &str {
        &self.start
    }

    pub fn end_marker(&self) -> &str {
        &self.end
    }
}

/// First complete fence found in a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMatch {
    /// Text before the start marker line.
    pub preceding_text: String,
    /// Fence body with the shared indentation removed.
    pub command: String,
    /// Leading whitespace shared by both marker lines.
    pub indentation: String,
    /// Text after the end marker; its line break, if any, stays here.
    pub remainder: String,
}

/// Find the leftmost complete fence in `buffer`, read as a whole message.
///
/// Returns `None` until both marker lines are present.
pub fn scan_fence(syntax: &FenceSyntax, buffer: &str) -> Option<CommandMatch> {
    find_fence(syntax, buffer, true, true)
}

/// `starts_line` tells whether `buffer` begins at a line start. With
/// `complete` unset the buffer may still grow, so an end marker that is the
/// last thing in it does not close the fence yet.
fn find_fence(
    syntax: &FenceSyntax,
    buffer: &str,
    starts_line: bool,
    complete: bool,
) -> Option<CommandMatch> {
    for line_start in line_starts(buffer, starts_line) {
        let line = &buffer[line_start..];
        let indentation = leading_whitespace(line);
        let Some(after_marker) = line[indentation.len()..].strip_prefix(syntax.start_marker())
        else {
            continue;
        };
        let break_len = match after_marker.as_bytes() {
            [b'\n', ..] => 1,
            [b'\r', b'\n', ..] => 2,
            _ => continue,
        };

        let body_start = buffer.len() - after_marker.len() + break_len;
        let Some((body_end, fence_end)) =
            find_end_marker(syntax, buffer, body_start, indentation, complete)
        else {
            continue;
        };

        return Some(CommandMatch {
            preceding_text: buffer[..line_start].to_string(),
            command: strip_indentation(&buffer[body_start..body_end], indentation),
            indentation: indentation.to_string(),
            remainder: buffer[fence_end..].to_string(),
        });
    }
    None
}

/// Locate `"\n" + indentation + end marker` ending its line. Returns the body
/// end and the fence end offsets.
fn find_end_marker(
    syntax: &FenceSyntax,
    buffer: &str,
    body_start: usize,
    indentation: &str,
    complete: bool,
) -> Option<(usize, usize)> {
    let needle = format!("\n{indentation}{}", syntax.end_marker());
    let mut from = body_start;
    while let Some(offset) = buffer.get(from..)?.find(&needle) {
        let body_end = from + offset;
        let fence_end = body_end + needle.len();
        match buffer[fence_end..].as_bytes() {
            [b'\n', ..] | [b'\r', b'\n', ..] => return Some((body_end, fence_end)),
            [] | [b'\r'] => return complete.then_some((body_end, fence_end)),
            _ => from = body_end + 1,
        }
    }
    None
}

fn line_starts(buffer: &str, starts_line: bool) -> impl Iterator<Item = usize> + '_ {
    starts_line.then_some(0).into_iter().chain(
        buffer
            .match_indices('\n')
            .map(|(index, _)| index + 1)
            .filter(move |start| *start < buffer.len()),
    )
}

fn leading_whitespace(line: &str) -> &str {
    let end = line
        .find(|ch: char| ch != ' ' && ch != '\t')
        .unwrap_or(line.len());
    &line[..end]
}

fn strip_indentation(body: &str, indentation: &str) -> String {
    body.split('\n')
        .map(|line| {
            let line = line.strip_suffix('\r').unwrap_or(line);
            line.strip_prefix(indentation).unwrap_or(line)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Offset from which `buffer` may still turn into a fence. Text before it can
/// be shown right away.
fn holdback_offset(syntax: &FenceSyntax, buffer: &str, starts_line: bool) -> usize {
    for line_start in line_starts(buffer, starts_line) {
        let line = &buffer[line_start..];
        let (line, terminated) = match line.find('\n') {
            Some(end) => (&line[..end], true),
            None => (line, false),
        };
        let marker_part = &line[leading_whitespace(line).len()..];
        let is_marker =
            marker_part.strip_suffix('\r').unwrap_or(marker_part) == syntax.start_marker();

        let may_open_fence = !terminated && syntax.start_marker().starts_with(marker_part);
        if is_marker || may_open_fence {
            return line_start;
        }
    }
    buffer.len()
}

/// One step of extractor output, in message order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    Text(String),
    Command(String),
}

/// Splits the parts of one model message into plain text and fenced commands.
///
/// Text that could still be the beginning of a fence is held back until the
/// fence completes or the message ends, so every character of plain text is
/// reported exactly once and the split points of the message do not matter.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    syntax: FenceSyntax,
    buffer: String,
    /// Whether `buffer` begins at a line start of the message.
    at_line_start: bool,
}

impl Default for CommandExtractor {
    fn default() -> Self {
        Self::new(FenceSyntax::default())
    }
}

impl CommandExtractor {
    pub fn new(syntax: FenceSyntax) -> Self {
        Self {
            syntax,
            buffer: String::new(),
            at_line_start: true,
        }
    }

    /// Feed the next part of the message.
    pub fn push(&mut self, part: &str) -> Vec<Extracted> {
        self.buffer.push_str(part);
        let mut out = self.drain_fences(false);

        let safe = holdback_offset(&self.syntax, &self.buffer, self.at_line_start);
        let held = self.buffer.split_off(safe);
        let flushed = std::mem::replace(&mut self.buffer, held);
        self.flush(&mut out, flushed);
        out
    }

    /// End of message: report the last fence, if it closes at the very end,
    /// and release everything still held back.
    pub fn finish(&mut self) -> Vec<Extracted> {
        let mut out = self.drain_fences(true);
        let rest = std::mem::take(&mut self.buffer);
        self.flush(&mut out, rest);
        self.at_line_start = true;
        out
    }

    /// Text currently held back.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn drain_fences(&mut self, complete: bool) -> Vec<Extracted> {
        let mut out = Vec::new();
        while let Some(found) =
            find_fence(&self.syntax, &self.buffer, self.at_line_start, complete)
        {
            self.flush(&mut out, found.preceding_text);
            tracing::debug!(
                indented = !found.indentation.is_empty(),
                "command fence completed"
            );
            out.push(Extracted::Command(found.command));
            self.buffer = found.remainder;
            self.at_line_start = false;
        }
        out
    }

    fn flush(&mut self, out: &mut Vec<Extracted>, text: String) {
        if let Some(last) = text.chars().last() {
            self.at_line_start = last == '\n';
            push_text(out, text);
        }
    }
}

fn push_text(out: &mut Vec<Extracted>, text: String) {
    if !text.is_empty() {
        out.push(Extracted::Text(text));
    }
}
