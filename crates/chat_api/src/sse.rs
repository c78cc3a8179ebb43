use serde::Deserialize;
use serde_json::Value;

use crate::error::ChatApiError;
use crate::events::{ChatRole, FrameIds, StreamFrame};

pub const FRAME_SEPARATOR: &str = "\n\n";
pub const DATA_PREFIX: &str = "data: ";
pub const DONE_SENTINEL: &str = "[DONE]";

const VIOLATION_PREVIEW_CHARS: usize = 200;

/// Incremental decoder for completion event streams.
///
/// Bytes are buffered until a decode pass leaves nothing pending. A frame whose
/// JSON does not parse yet is kept, together with everything after it, and
/// decoded again once the next chunk arrives. Segments that were already
/// decoded from the retained buffer are skipped on the retry.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    consumed: usize,
    pending: Option<serde_json::Error>,
    terminated: bool,
}

impl FrameDecoder {
    /// Feed arbitrary bytes into the decoder and drain complete frames.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<StreamFrame>, ChatApiError> {
        let mut frames = Vec::new();
        if self.terminated {
            return Ok(frames);
        }

        self.buffer.extend_from_slice(bytes);
        let text = String::from_utf8_lossy(&self.buffer).into_owned();
        let segments: Vec<&str> = text.split(FRAME_SEPARATOR).collect();
        let last_index = segments.len() - 1;

        let mut carried: Option<(String, usize)> = None;
        let mut parse_error = None;
        let mut holding_tail = false;

        for (index, segment) in segments.iter().enumerate().skip(self.consumed) {
            let (candidate, span) = match carried.take() {
                Some((mut joined, span)) => {
                    joined.push_str(FRAME_SEPARATOR);
                    joined.push_str(segment);
                    (joined, span + 1)
                }
                None => (segment.trim_start().to_string(), 1),
            };
            let is_tail = index == last_index;

            let Some(payload) = candidate.strip_prefix(DATA_PREFIX) else {
                if is_tail && !candidate.is_empty() && DATA_PREFIX.starts_with(candidate.as_str()) {
                    holding_tail = true;
                } else {
                    self.consumed += span;
                }
                continue;
            };

            let payload = payload.trim();
            if payload == DONE_SENTINEL {
                self.terminated = true;
                self.reset();
                frames.push(StreamFrame::Done);
                return Ok(frames);
            }

            if payload.is_empty() {
                if is_tail {
                    holding_tail = true;
                } else {
                    self.consumed += span;
                }
                continue;
            }

            match serde_json::from_str::<Value>(payload) {
                Ok(value) => {
                    self.consumed += span;
                    parse_error = None;
                    frames.push(classify_frame(value)?);
                }
                Err(error) => {
                    tracing::trace!(%error, segments = span, "frame JSON incomplete; retaining for retry");
                    parse_error = Some(error);
                    carried = Some((candidate, span));
                }
            }
        }

        if parse_error.is_some() || holding_tail {
            self.pending = parse_error;
        } else {
            self.reset();
        }

        Ok(frames)
    }

    /// Signal end of input. Fails when a parse error is still outstanding.
    pub fn finish(&mut self) -> Result<(), ChatApiError> {
        let pending = self.pending.take();
        self.reset();
        match pending {
            Some(error) => Err(ChatApiError::StreamDecode(error)),
            None => Ok(()),
        }
    }

    /// Decode a complete payload string in one shot.
    pub fn parse_frames(input: &str) -> Result<Vec<StreamFrame>, ChatApiError> {
        let mut decoder = Self::default();
        let frames = decoder.feed(input.as_bytes())?;
        decoder.finish()?;
        Ok(frames)
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Returns true once the `[DONE]` sentinel has been seen.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.consumed = 0;
        self.pending = None;
    }
}

#[derive(Debug, Deserialize)]
struct RawChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    choices: Vec<RawChoice>,
}

#[derive(Debug, Deserialize)]
struct RawChoice {
    #[serde(default)]
    delta: Option<RawDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDelta {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

fn classify_frame(value: Value) -> Result<StreamFrame, ChatApiError> {
    let raw = match RawChunk::deserialize(&value) {
        Ok(raw) => raw,
        Err(error) => return Err(violation(&value, &error.to_string())),
    };

    let choice = match <[RawChoice; 1]>::try_from(raw.choices) {
        Ok([choice]) => choice,
        Err(choices) => {
            return Err(violation(
                &value,
                &format!("expected exactly one choice, got {}", choices.len()),
            ))
        }
    };

    if let Some(reason) = choice.finish_reason {
        return Ok(StreamFrame::Finish { reason });
    }

    let Some(delta) = choice.delta else {
        return Err(violation(&value, "choice carries neither delta nor finish_reason"));
    };

    match (delta.role, delta.content) {
        (_, Some(text)) => Ok(StreamFrame::Content {
            text,
            ids: FrameIds {
                message_id: raw.id,
                conversation_id: raw.conversation_id,
            },
        }),
        (Some(role), None) => match ChatRole::parse(&role) {
            Some(role) => Ok(StreamFrame::Role { role }),
            None => Err(violation(&value, &format!("unknown role '{role}'"))),
        },
        (None, None) => Err(violation(&value, "delta carries neither role nor content")),
    }
}

fn violation(value: &Value, reason: &str) -> ChatApiError {
    let preview: String = value
        .to_string()
        .chars()
        .take(VIOLATION_PREVIEW_CHARS)
        .collect();
    tracing::warn!(reason, frame = %preview, "unrecognized stream frame");
    ChatApiError::ProtocolViolation(format!("{reason}: {preview}"))
}
