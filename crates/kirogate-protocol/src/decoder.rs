use std::collections::HashMap;

use serde_json::Value as JsonValue;

use crate::stream::{BlockDelta, ContentBlockStart, StreamEvent};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame declares {0} bytes, below the 16-byte minimum")]
    FrameTooShort(u32),
    #[error("frame header section is malformed")]
    HeaderSyntax,
    #[error("frame exceeds maximum size ({0} bytes)")]
    FrameTooLarge(u32),
}

/// Upper bound on a single frame; anything larger is a corrupt length
/// prefix, not a real payload.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;
const PRELUDE_LEN: usize = 12;
const CRC_LEN: usize = 4;

/// Incremental decoder for the upstream's binary event-stream framing.
///
/// Emits Anthropic-shaped [`StreamEvent`]s: the decoder owns block index
/// assignment and open/close bookkeeping, so a `content_block_delta` is
/// always preceded by its `content_block_start` and tool blocks are closed
/// exactly once on their terminal fragment.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    next_index: usize,
    open_text: Option<usize>,
    /// (block index, tool_use_id) of the tool block currently receiving
    /// argument fragments.
    open_tool: Option<(usize, String)>,
}

#[derive(Debug, Default)]
struct FrameHeaders {
    message_type: Option<String>,
    event_type: Option<String>,
    exception_type: Option<String>,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every event completed by it. Frames with an
    /// undecodable JSON payload are skipped rather than failing the stream.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>, DecodeError> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            if self.buffer.len() < PRELUDE_LEN {
                break;
            }
            let total_len = u32::from_be_bytes(self.buffer[0..4].try_into().unwrap());
            if total_len > MAX_FRAME_LEN {
                self.buffer.clear();
                return Err(DecodeError::FrameTooLarge(total_len));
            }
            if (total_len as usize) < PRELUDE_LEN + CRC_LEN {
                self.buffer.clear();
                return Err(DecodeError::FrameTooShort(total_len));
            }
            if self.buffer.len() < total_len as usize {
                break;
            }

            let headers_len = u32::from_be_bytes(self.buffer[4..8].try_into().unwrap()) as usize;
            let frame: Vec<u8> = self.buffer.drain(..total_len as usize).collect();
            let payload_end = frame.len() - CRC_LEN;
            if PRELUDE_LEN + headers_len > payload_end {
                return Err(DecodeError::HeaderSyntax);
            }
            // CRC fields are not verified; the transport already checksums.
            let headers = parse_headers(&frame[PRELUDE_LEN..PRELUDE_LEN + headers_len])?;
            let payload = &frame[PRELUDE_LEN + headers_len..payload_end];
            self.handle_frame(&headers, payload, &mut events);
        }

        Ok(events)
    }

    /// Close any block the upstream left open; call once at end of stream.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if let Some((index, _)) = self.open_tool.take() {
            events.push(StreamEvent::ContentBlockStop { index });
        }
        if let Some(index) = self.open_text.take() {
            events.push(StreamEvent::ContentBlockStop { index });
        }
        events
    }

    fn handle_frame(&mut self, headers: &FrameHeaders, payload: &[u8], out: &mut Vec<StreamEvent>) {
        if headers.message_type.as_deref() == Some("exception") {
            let body: JsonValue = serde_json::from_slice(payload).unwrap_or(JsonValue::Null);
            let exception_type = headers
                .exception_type
                .clone()
                .or_else(|| json_string(&body, &["__type", "exceptionType"]))
                .unwrap_or_default();
            let message = json_string(&body, &["message", "Message"])
                .unwrap_or_else(|| String::from_utf8_lossy(payload).into_owned());
            out.push(StreamEvent::Exception {
                exception_type,
                message,
            });
            return;
        }

        let Some(event_type) = headers.event_type.as_deref() else {
            return;
        };
        let body: JsonValue = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(_) => return,
        };

        match event_type {
            "assistantResponseEvent" => {
                let Some(text) = json_string(&body, &["content"]) else {
                    return;
                };
                if text.is_empty() {
                    return;
                }
                if let Some((index, _)) = self.open_tool.take() {
                    out.push(StreamEvent::ContentBlockStop { index });
                }
                let index = match self.open_text {
                    Some(index) => index,
                    None => {
                        let index = self.next_index;
                        self.next_index += 1;
                        self.open_text = Some(index);
                        out.push(StreamEvent::ContentBlockStart {
                            index,
                            content_block: ContentBlockStart::Text {
                                text: String::new(),
                            },
                        });
                        index
                    }
                };
                out.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::TextDelta { text },
                });
            }
            "toolUseEvent" => {
                let tool_use_id = json_string(&body, &["toolUseId"]).unwrap_or_default();
                let name = json_string(&body, &["name"]).unwrap_or_default();
                let fragment = json_string(&body, &["input"]).unwrap_or_default();
                let stop = body.get("stop").and_then(JsonValue::as_bool).unwrap_or(false);

                let same_tool = matches!(&self.open_tool, Some((_, id)) if *id == tool_use_id);
                if !same_tool {
                    if let Some((index, _)) = self.open_tool.take() {
                        out.push(StreamEvent::ContentBlockStop { index });
                    }
                    if let Some(index) = self.open_text.take() {
                        out.push(StreamEvent::ContentBlockStop { index });
                    }
                    let index = self.next_index;
                    self.next_index += 1;
                    self.open_tool = Some((index, tool_use_id.clone()));
                    out.push(StreamEvent::ContentBlockStart {
                        index,
                        content_block: ContentBlockStart::ToolUse {
                            id: tool_use_id,
                            name,
                            input: JsonValue::Object(Default::default()),
                        },
                    });
                }

                let index = self.open_tool.as_ref().map(|(i, _)| *i).unwrap_or(0);
                if !fragment.is_empty() {
                    out.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: BlockDelta::InputJsonDelta {
                            partial_json: fragment,
                        },
                    });
                }
                if stop {
                    self.open_tool = None;
                    out.push(StreamEvent::ContentBlockStop { index });
                }
            }
            "meteringEvent" => {
                if let Some(credit) = json_f64(&body, &["credit_usage", "creditUsage", "usage"]) {
                    out.push(StreamEvent::Metering {
                        credit_usage: credit,
                    });
                }
            }
            "contextUsageEvent" => {
                if let Some(percent) =
                    json_f64(&body, &["context_usage_percent", "contextUsagePercent", "percent"])
                {
                    out.push(StreamEvent::ContextUsage {
                        context_usage_percent: percent,
                    });
                }
            }
            "messageStopEvent" => {
                out.extend(self.finish());
                out.push(StreamEvent::MessageDelta {
                    delta: crate::stream::MessageDeltaBody {
                        stop_reason: json_string(&body, &["stopReason", "stop_reason"]),
                        stop_sequence: None,
                    },
                    usage: Default::default(),
                });
            }
            // Metadata and unknown event kinds carry nothing a client needs.
            _ => {}
        }
    }
}

fn parse_headers(mut raw: &[u8]) -> Result<FrameHeaders, DecodeError> {
    let mut headers = FrameHeaders::default();
    while !raw.is_empty() {
        let name_len = raw[0] as usize;
        raw = &raw[1..];
        if raw.len() < name_len + 1 {
            return Err(DecodeError::HeaderSyntax);
        }
        let name = std::str::from_utf8(&raw[..name_len]).map_err(|_| DecodeError::HeaderSyntax)?;
        let value_type = raw[name_len];
        raw = &raw[name_len + 1..];

        let value = match value_type {
            // 7 = string: u16 length prefix.
            7 => {
                if raw.len() < 2 {
                    return Err(DecodeError::HeaderSyntax);
                }
                let len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
                if raw.len() < 2 + len {
                    return Err(DecodeError::HeaderSyntax);
                }
                let value = std::str::from_utf8(&raw[2..2 + len])
                    .map_err(|_| DecodeError::HeaderSyntax)?
                    .to_string();
                raw = &raw[2 + len..];
                Some(value)
            }
            // 0/1 = bool true/false, no body.
            0 | 1 => None,
            // 2..6 = fixed-width integers.
            2 => {
                raw = raw.get(1..).ok_or(DecodeError::HeaderSyntax)?;
                None
            }
            3 => {
                raw = raw.get(2..).ok_or(DecodeError::HeaderSyntax)?;
                None
            }
            4 => {
                raw = raw.get(4..).ok_or(DecodeError::HeaderSyntax)?;
                None
            }
            5 | 8 => {
                raw = raw.get(8..).ok_or(DecodeError::HeaderSyntax)?;
                None
            }
            // 6 = byte array, 9 = uuid.
            6 => {
                if raw.len() < 2 {
                    return Err(DecodeError::HeaderSyntax);
                }
                let len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
                raw = raw.get(2 + len..).ok_or(DecodeError::HeaderSyntax)?;
                None
            }
            9 => {
                raw = raw.get(16..).ok_or(DecodeError::HeaderSyntax)?;
                None
            }
            _ => return Err(DecodeError::HeaderSyntax),
        };

        if let Some(value) = value {
            match name {
                ":message-type" => headers.message_type = Some(value),
                ":event-type" => headers.event_type = Some(value),
                ":exception-type" => headers.exception_type = Some(value),
                _ => {}
            }
        }
    }
    Ok(headers)
}

fn json_string(body: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| body.get(k).and_then(JsonValue::as_str))
        .map(str::to_string)
}

fn json_f64(body: &JsonValue, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| body.get(k).and_then(JsonValue::as_f64))
}

#[derive(Debug, Clone)]
pub struct ParsedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: JsonValue,
}

/// Aggregate view of a fully-buffered response, for the non-streaming path.
#[derive(Debug, Default)]
pub struct ParsedCompletion {
    pub text: String,
    pub tool_calls: Vec<ParsedToolCall>,
    pub credit_usage: Option<f64>,
    pub context_usage_percent: Option<f64>,
    pub stop_reason: Option<String>,
    /// Set when the upstream aborted with a content-length exception; the
    /// caller renders this as a successful `max_tokens` response.
    pub length_exceeded: bool,
    pub exception: Option<(String, String)>,
}

pub fn decode_full(body: &[u8]) -> Result<ParsedCompletion, DecodeError> {
    let mut decoder = EventStreamDecoder::new();
    let mut events = decoder.push(body)?;
    events.extend(decoder.finish());

    let mut parsed = ParsedCompletion::default();
    let mut open_tools: HashMap<usize, (String, String, String)> = HashMap::new();

    for event in events {
        match event {
            StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlockStart::ToolUse { id, name, .. },
            } => {
                open_tools.insert(index, (id, name, String::new()));
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => parsed.text.push_str(&text),
                BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some((_, _, args)) = open_tools.get_mut(&index) {
                        args.push_str(&partial_json);
                    }
                }
                BlockDelta::ThinkingDelta { .. } => {}
            },
            StreamEvent::ContentBlockStop { index } => {
                if let Some((id, name, args)) = open_tools.remove(&index) {
                    let arguments = if args.trim().is_empty() {
                        JsonValue::Object(Default::default())
                    } else {
                        serde_json::from_str(&args)
                            .unwrap_or(JsonValue::Object(Default::default()))
                    };
                    parsed.tool_calls.push(ParsedToolCall { id, name, arguments });
                }
            }
            StreamEvent::Metering { credit_usage } => parsed.credit_usage = Some(credit_usage),
            StreamEvent::ContextUsage {
                context_usage_percent,
            } => parsed.context_usage_percent = Some(context_usage_percent),
            StreamEvent::MessageDelta { delta, .. } => {
                if delta.stop_reason.is_some() {
                    parsed.stop_reason = delta.stop_reason;
                }
            }
            StreamEvent::Exception {
                exception_type,
                message,
            } => {
                if exception_type == "ContentLengthExceededException"
                    || exception_type.contains("CONTENT_LENGTH_EXCEEDS")
                {
                    parsed.length_exceeded = true;
                } else {
                    parsed.exception = Some((exception_type, message));
                }
            }
            _ => {}
        }
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_header(name: &str, value: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(name.len() as u8);
        out.extend_from_slice(name.as_bytes());
        out.push(7u8);
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
        out
    }

    fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
        let mut header_bytes = Vec::new();
        for (name, value) in headers {
            header_bytes.extend(string_header(name, value));
        }
        let total = PRELUDE_LEN + header_bytes.len() + payload.len() + CRC_LEN;
        let mut frame = Vec::with_capacity(total);
        frame.extend_from_slice(&(total as u32).to_be_bytes());
        frame.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.extend_from_slice(&header_bytes);
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame
    }

    fn event_frame(event_type: &str, payload: serde_json::Value) -> Vec<u8> {
        encode_frame(
            &[(":message-type", "event"), (":event-type", event_type)],
            payload.to_string().as_bytes(),
        )
    }

    #[test]
    fn text_then_tool_produces_ordered_blocks() {
        let mut decoder = EventStreamDecoder::new();
        let mut bytes = Vec::new();
        bytes.extend(event_frame(
            "assistantResponseEvent",
            serde_json::json!({"content": "hello "}),
        ));
        bytes.extend(event_frame(
            "assistantResponseEvent",
            serde_json::json!({"content": "world"}),
        ));
        bytes.extend(event_frame(
            "toolUseEvent",
            serde_json::json!({"toolUseId": "tu_1", "name": "get_weather", "input": "{\"ci"}),
        ));
        bytes.extend(event_frame(
            "toolUseEvent",
            serde_json::json!({"toolUseId": "tu_1", "name": "get_weather", "input": "ty\":\"SF\"}", "stop": true}),
        ));

        let mut events = decoder.push(&bytes).unwrap();
        events.extend(decoder.finish());

        let kinds: Vec<&str> = events.iter().map(|e| e.event_name()).collect();
        assert_eq!(
            kinds,
            vec![
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
            ]
        );
        // Text block index 0 was auto-closed when the tool block opened.
        assert!(matches!(
            events[3],
            StreamEvent::ContentBlockStop { index: 0 }
        ));
        assert!(matches!(
            events[4],
            StreamEvent::ContentBlockStart { index: 1, .. }
        ));
    }

    #[test]
    fn split_frames_across_pushes() {
        let frame = event_frame(
            "assistantResponseEvent",
            serde_json::json!({"content": "chunked"}),
        );
        let mut decoder = EventStreamDecoder::new();
        let first = decoder.push(&frame[..7]).unwrap();
        assert!(first.is_empty());
        let rest = decoder.push(&frame[7..]).unwrap();
        assert_eq!(rest.len(), 2); // block start + delta
    }

    #[test]
    fn metering_and_context_usage_are_decoded() {
        let mut bytes = Vec::new();
        bytes.extend(event_frame(
            "meteringEvent",
            serde_json::json!({"credit_usage": 0.25}),
        ));
        bytes.extend(event_frame(
            "contextUsageEvent",
            serde_json::json!({"context_usage_percent": 12.5}),
        ));
        let mut decoder = EventStreamDecoder::new();
        let events = decoder.push(&bytes).unwrap();
        assert!(matches!(
            events[0],
            StreamEvent::Metering { credit_usage } if credit_usage == 0.25
        ));
        assert!(matches!(
            events[1],
            StreamEvent::ContextUsage { context_usage_percent } if context_usage_percent == 12.5
        ));
    }

    #[test]
    fn exception_frames_carry_type_and_message() {
        let frame = encode_frame(
            &[
                (":message-type", "exception"),
                (":exception-type", "ContentLengthExceededException"),
            ],
            br#"{"message":"too long"}"#,
        );
        let mut decoder = EventStreamDecoder::new();
        let events = decoder.push(&frame).unwrap();
        assert!(matches!(
            &events[0],
            StreamEvent::Exception { exception_type, message }
                if exception_type == "ContentLengthExceededException" && message == "too long"
        ));
    }

    #[test]
    fn decode_full_accumulates_tool_arguments() {
        let mut bytes = Vec::new();
        bytes.extend(event_frame(
            "assistantResponseEvent",
            serde_json::json!({"content": "calling"}),
        ));
        bytes.extend(event_frame(
            "toolUseEvent",
            serde_json::json!({"toolUseId": "tu_9", "name": "lookup", "input": "{\"q\":"}),
        ));
        bytes.extend(event_frame(
            "toolUseEvent",
            serde_json::json!({"toolUseId": "tu_9", "name": "lookup", "input": "\"rust\"}", "stop": true}),
        ));
        bytes.extend(event_frame(
            "meteringEvent",
            serde_json::json!({"credit_usage": 1.5}),
        ));

        let parsed = decode_full(&bytes).unwrap();
        assert_eq!(parsed.text, "calling");
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "lookup");
        assert_eq!(parsed.tool_calls[0].arguments["q"], "rust");
        assert_eq!(parsed.credit_usage, Some(1.5));
    }

    #[test]
    fn corrupt_length_prefix_is_an_error() {
        let mut decoder = EventStreamDecoder::new();
        let mut bad = vec![0xFFu8; 16];
        bad[0] = 0xFF;
        assert!(decoder.push(&bad).is_err());
    }
}
