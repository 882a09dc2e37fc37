use serde::Deserialize;
use serde_json::Value;

use crate::error::{ApiErrorFields, ChatApiError};
use crate::events::ChatStreamEvent;

const KNOWN_FRAME_TYPES: &[&str] = &["delta", "session", "ack", "done", "error"];

/// Incremental parser for SSE text streams.
///
/// Bytes are buffered until a frame is complete, so a UTF-8 sequence split
/// across network chunks decodes intact.
#[derive(Debug, Default)]
pub struct SseStreamParser {
    buffer: Vec<u8>,
}

impl SseStreamParser {
    /// Feed arbitrary bytes into the parser and drain complete frames.
    ///
    /// Frames are separated by a blank line. Unknown frame types are skipped;
    /// malformed frames, including ones that are not valid UTF-8, surface as
    /// [`ChatApiError::MalformedFrame`] in order with the surrounding events.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<ChatStreamEvent, ChatApiError>> {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.contains(&b'\r') {
            self.buffer = normalize_crlf(&self.buffer);
        }
        let mut events = Vec::new();

        while let Some(split) = find_frame_end(&self.buffer) {
            let frame_bytes: Vec<u8> = self.buffer.drain(..split + 2).take(split).collect();
            let frame = match String::from_utf8(frame_bytes) {
                Ok(frame) => frame,
                Err(error) => {
                    events.push(Err(ChatApiError::MalformedFrame(format!(
                        "frame is not valid UTF-8: {error}"
                    ))));
                    continue;
                }
            };

            let Some(payload) = extract_data_payload(&frame) else {
                continue;
            };
            if payload == "[DONE]" || payload.is_empty() {
                continue;
            }

            if let Some(event) = map_frame(&payload).transpose() {
                events.push(event);
            }
        }

        events
    }

    /// Parse a complete SSE payload string in one shot.
    pub fn parse_frames(input: &str) -> Vec<Result<ChatStreamEvent, ChatApiError>> {
        let mut parser = Self::default();
        parser.feed(input.as_bytes())
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.iter().all(u8::is_ascii_whitespace)
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

/// Collapses `\r\n` to `\n`. A trailing lone `\r` is kept until its `\n`
/// arrives in the next chunk.
fn normalize_crlf(buffer: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(buffer.len());
    for (index, byte) in buffer.iter().enumerate() {
        if *byte == b'\r' && buffer.get(index + 1) == Some(&b'\n') {
            continue;
        }
        out.push(*byte);
    }
    out
}

fn extract_data_payload(frame: &str) -> Option<String> {
    let data_lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .collect();

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireFrame {
    Delta {
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    Session {
        session_id: String,
        #[serde(default)]
        server_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Ack {
        client_message_id: String,
        server_message_id: String,
    },
    Done,
    Error(ApiErrorFields),
}

fn map_frame(payload: &str) -> Result<Option<ChatStreamEvent>, ChatApiError> {
    let value = serde_json::from_str::<Value>(payload)
        .map_err(|error| ChatApiError::MalformedFrame(format!("invalid JSON: {error}")))?;
    let Some(frame_type) = value.get("type").and_then(Value::as_str) else {
        return Err(ChatApiError::MalformedFrame(
            "frame has no string 'type'".to_owned(),
        ));
    };
    if !KNOWN_FRAME_TYPES.contains(&frame_type) {
        tracing::debug!(frame_type, "ignoring unknown stream frame");
        return Ok(None);
    }

    let frame_type = frame_type.to_owned();
    let frame = serde_json::from_value::<WireFrame>(value)
        .map_err(|error| ChatApiError::MalformedFrame(format!("'{frame_type}' frame: {error}")))?;

    let event = match frame {
        WireFrame::Delta { content } => ChatStreamEvent::ContentDelta { text: content },
        WireFrame::Session {
            session_id,
            server_id,
        } => {
            if session_id.trim().is_empty() {
                return Err(ChatApiError::MalformedFrame(
                    "'session' frame has a blank sessionId".to_owned(),
                ));
            }
            ChatStreamEvent::SessionAssigned {
                server_id: server_id.filter(|value| !value.trim().is_empty()),
                session_id,
            }
        }
        WireFrame::Ack {
            client_message_id,
            server_message_id,
        } => ChatStreamEvent::MessageAck {
            client_message_id,
            server_message_id,
        },
        WireFrame::Done => ChatStreamEvent::Done,
        WireFrame::Error(fields) => ChatStreamEvent::Error {
            failure: fields.into_failure(None),
        },
    };
    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::SseStreamParser;
    use crate::events::ChatStreamEvent;

    #[test]
    fn parse_sse_frames_incrementally() {
        let mut parser = SseStreamParser::default();
        let mut events = Vec::new();

        events.extend(parser.feed(b"data: {\"type\":\"delta\",\"con"));
        assert!(events.is_empty());
        assert!(!parser.is_empty_buffer());

        events.extend(parser.feed(b"tent\":\"Hello\"}\n\n"));
        assert_eq!(events.len(), 1);

        events.extend(parser.feed(b"data: [DONE]\n\n"));
        assert_eq!(events.len(), 1);
        assert!(parser.is_empty_buffer());

        assert!(matches!(
            &events[0],
            Ok(ChatStreamEvent::ContentDelta { text }) if text == "Hello"
        ));
    }

    #[test]
    fn crlf_split_across_chunks_is_accepted() {
        let mut parser = SseStreamParser::default();
        assert!(parser.feed(b"data: {\"type\":\"done\"}\r\n\r").is_empty());
        let events = parser.feed(b"\n");
        assert!(matches!(events.as_slice(), [Ok(ChatStreamEvent::Done)]));
        assert!(parser.is_empty_buffer());
    }

    #[test]
    fn crlf_framing_is_accepted() {
        let events = SseStreamParser::parse_frames("data: {\"type\":\"done\"}\r\n\r\n");
        assert!(matches!(events.as_slice(), [Ok(ChatStreamEvent::Done)]));
    }
}
