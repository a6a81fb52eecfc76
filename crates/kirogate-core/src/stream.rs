use std::collections::{HashMap, HashSet};
use std::time::Instant;

use bytes::Bytes;

use kirogate_protocol::anthropic::Usage;
use kirogate_protocol::openai::{ChatCompletionChunk, ChunkDelta, ChunkFunction, ChunkToolCall};
use kirogate_protocol::stream::{
    sse_frame, BlockDelta, ContentBlockStart, MessageDeltaBody, MessageStart, StreamEvent,
    StreamErrorBody,
};
use kirogate_translate::{chat_finish_reason, ParsedChunk, ThinkingParser, TokenEstimator};

/// Stop-reason selection: tool activity wins, then the upstream's reported
/// reason, then `end_turn`. A max-tokens abort overrides everything.
pub fn compute_stop_reason(
    saw_tool_use: bool,
    upstream: Option<&str>,
    max_tokens_hit: bool,
) -> &'static str {
    if max_tokens_hit {
        return "max_tokens";
    }
    if saw_tool_use {
        return "tool_use";
    }
    match upstream {
        Some("end_turn") => "end_turn",
        Some("stop_sequence") => "stop_sequence",
        _ => "end_turn",
    }
}

/// Client-protocol rendering of the internal event sequence.
pub trait StreamEmitter: Send {
    fn emit(&mut self, event: &StreamEvent) -> Vec<Bytes>;
    /// Trailing terminator after `message_stop` (OpenAI's `[DONE]`).
    fn emit_done(&mut self) -> Vec<Bytes>;
    fn emit_error(&mut self, error_type: &str, message: &str) -> Vec<Bytes>;
}

/// Anthropic SSE: one `event:`/`data:` frame per internal event.
#[derive(Debug, Default)]
pub struct AnthropicEmitter;

impl StreamEmitter for AnthropicEmitter {
    fn emit(&mut self, event: &StreamEvent) -> Vec<Bytes> {
        vec![sse_frame(event.event_name(), event)]
    }

    fn emit_done(&mut self) -> Vec<Bytes> {
        Vec::new()
    }

    fn emit_error(&mut self, error_type: &str, message: &str) -> Vec<Bytes> {
        let event = StreamEvent::Error {
            error: StreamErrorBody {
                error_type: error_type.to_string(),
                message: message.to_string(),
            },
        };
        vec![sse_frame("error", &event)]
    }
}

/// OpenAI Chat Completions adapter: the same internal events rendered as
/// `chat.completion.chunk` frames terminated by `data: [DONE]`.
pub struct OpenAiEmitter {
    message_id: String,
    model: String,
    created: i64,
    tool_index_by_out_index: HashMap<usize, u32>,
    next_tool_index: u32,
    sent_final: bool,
}

impl OpenAiEmitter {
    pub fn new(message_id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            message_id: message_id.into(),
            model: model.into(),
            created,
            tool_index_by_out_index: HashMap::new(),
            next_tool_index: 0,
            sent_final: false,
        }
    }

    fn chunk(&self, delta: ChunkDelta, finish: Option<String>) -> Bytes {
        let chunk =
            ChatCompletionChunk::new(&self.message_id, self.created, &self.model, delta, finish);
        let json = serde_json::to_string(&chunk).unwrap_or_else(|_| "{}".to_string());
        Bytes::from(format!("data: {json}\n\n"))
    }
}

impl StreamEmitter for OpenAiEmitter {
    fn emit(&mut self, event: &StreamEvent) -> Vec<Bytes> {
        match event {
            StreamEvent::MessageStart { .. } => vec![self.chunk(
                ChunkDelta {
                    role: Some("assistant".to_string()),
                    ..Default::default()
                },
                None,
            )],
            StreamEvent::Ping => Vec::new(),
            StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlockStart::ToolUse { id, name, .. },
            } => {
                let tool_index = match self.tool_index_by_out_index.get(index) {
                    Some(existing) => *existing,
                    None => {
                        let next = self.next_tool_index;
                        self.next_tool_index += 1;
                        self.tool_index_by_out_index.insert(*index, next);
                        next
                    }
                };
                vec![self.chunk(
                    ChunkDelta {
                        tool_calls: vec![ChunkToolCall {
                            index: tool_index,
                            id: Some(id.clone()),
                            call_type: "function".to_string(),
                            function: ChunkFunction {
                                name: Some(name.clone()),
                                arguments: Some(String::new()),
                            },
                        }],
                        ..Default::default()
                    },
                    None,
                )]
            }
            StreamEvent::ContentBlockStart { .. } => Vec::new(),
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => vec![self.chunk(
                    ChunkDelta {
                        content: Some(text.clone()),
                        ..Default::default()
                    },
                    None,
                )],
                BlockDelta::InputJsonDelta { partial_json } => {
                    let Some(tool_index) = self.tool_index_by_out_index.get(index).copied() else {
                        return Vec::new();
                    };
                    vec![self.chunk(
                        ChunkDelta {
                            tool_calls: vec![ChunkToolCall {
                                index: tool_index,
                                id: None,
                                call_type: "function".to_string(),
                                function: ChunkFunction {
                                    name: None,
                                    arguments: Some(partial_json.clone()),
                                },
                            }],
                            ..Default::default()
                        },
                        None,
                    )]
                }
                // Thinking has no OpenAI rendering.
                BlockDelta::ThinkingDelta { .. } => Vec::new(),
            },
            StreamEvent::ContentBlockStop { .. } => Vec::new(),
            StreamEvent::MessageDelta { delta, .. } => {
                if self.sent_final {
                    return Vec::new();
                }
                self.sent_final = true;
                let finish = chat_finish_reason(delta.stop_reason.as_deref().unwrap_or("end_turn"));
                vec![self.chunk(ChunkDelta::default(), Some(finish.to_string()))]
            }
            StreamEvent::MessageStop => Vec::new(),
            _ => Vec::new(),
        }
    }

    fn emit_done(&mut self) -> Vec<Bytes> {
        vec![Bytes::from_static(b"data: [DONE]\n\n")]
    }

    fn emit_error(&mut self, _error_type: &str, message: &str) -> Vec<Bytes> {
        let body = serde_json::json!({
            "error": {"message": message, "type": "server_error", "code": "internal_error"}
        });
        vec![Bytes::from(format!("data: {body}\n\n"))]
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct BlockState {
    started: bool,
    stopped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SynthesizedKind {
    Thinking,
    Text,
}

/// Stateful translator from decoded upstream events to client SSE.
///
/// Owns output block-index assignment (so thinking extraction can split one
/// upstream text block into several client blocks), enforces start/stop
/// ordering per block, accumulates billing counters, and converts
/// content-length exceptions into a clean `max_tokens` termination.
pub struct StreamProcessor<E: StreamEmitter> {
    emitter: E,
    message_id: String,
    model: String,
    input_tokens: u64,

    blocks: HashMap<usize, BlockState>,
    index_map: HashMap<usize, usize>,
    next_out_index: usize,

    thinking: ThinkingParser,
    /// Active synthesized block while thinking extraction is on.
    synthesized: Option<(usize, SynthesizedKind)>,

    estimator: TokenEstimator,
    tool_use_id_by_out_index: HashMap<usize, String>,
    completed_tool_ids: HashSet<String>,
    json_bytes_by_out_index: HashMap<usize, usize>,

    total_output_tokens: u64,
    processed_events: usize,
    credit_usage: Option<f64>,
    context_usage_percent: Option<f64>,
    upstream_stop_reason: Option<String>,
    max_tokens_hit: bool,
    finished: bool,

    started_at: Instant,
    first_content_at: Option<Instant>,
}

impl<E: StreamEmitter> StreamProcessor<E> {
    pub fn new(
        emitter: E,
        message_id: impl Into<String>,
        model: impl Into<String>,
        input_tokens: u64,
        thinking_enabled: bool,
    ) -> Self {
        Self {
            emitter,
            message_id: message_id.into(),
            model: model.into(),
            input_tokens,
            blocks: HashMap::new(),
            index_map: HashMap::new(),
            next_out_index: 0,
            thinking: ThinkingParser::new(thinking_enabled),
            synthesized: None,
            estimator: TokenEstimator::new(),
            tool_use_id_by_out_index: HashMap::new(),
            completed_tool_ids: HashSet::new(),
            json_bytes_by_out_index: HashMap::new(),
            total_output_tokens: 0,
            processed_events: 0,
            credit_usage: None,
            context_usage_percent: None,
            upstream_stop_reason: None,
            max_tokens_hit: false,
            finished: false,
            started_at: Instant::now(),
            first_content_at: None,
        }
    }

    /// `message_start` + `ping`; content blocks open lazily when content
    /// actually arrives.
    pub fn initial_events(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        out.extend(self.emitter.emit(&StreamEvent::MessageStart {
            message: MessageStart::new(&self.message_id, &self.model, self.input_tokens),
        }));
        out.extend(self.emitter.emit(&StreamEvent::Ping));
        out
    }

    pub fn process(&mut self, event: StreamEvent) -> Vec<Bytes> {
        if self.finished {
            return Vec::new();
        }
        self.processed_events += 1;

        match event {
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => self.on_block_start(index, content_block),
            StreamEvent::ContentBlockDelta { index, delta } => self.on_block_delta(index, delta),
            StreamEvent::ContentBlockStop { index } => self.on_block_stop(index),
            StreamEvent::MessageDelta { delta, .. } => {
                if delta.stop_reason.is_some() {
                    self.upstream_stop_reason = delta.stop_reason;
                }
                Vec::new()
            }
            StreamEvent::Metering { credit_usage } => {
                // Accounting only; never forwarded.
                self.credit_usage = Some(credit_usage);
                Vec::new()
            }
            StreamEvent::ContextUsage {
                context_usage_percent,
            } => {
                self.context_usage_percent = Some(context_usage_percent);
                Vec::new()
            }
            StreamEvent::Exception {
                exception_type,
                message,
            } => self.on_exception(&exception_type, &message),
            // The upstream's own framing events are replaced by ours.
            StreamEvent::MessageStart { .. }
            | StreamEvent::Ping
            | StreamEvent::MessageStop
            | StreamEvent::Error { .. } => Vec::new(),
        }
    }

    fn on_block_start(&mut self, upstream_index: usize, block: ContentBlockStart) -> Vec<Bytes> {
        match &block {
            ContentBlockStart::Text { .. } if self.thinking.enabled() => {
                // The thinking splitter owns text blocks; starts are
                // synthesized when classified content arrives.
                Vec::new()
            }
            ContentBlockStart::ToolUse { id, name, .. } => {
                let mut out = self.close_synthesized();
                let out_index = self.alloc_out_index(upstream_index);
                self.tool_use_id_by_out_index
                    .insert(out_index, id.clone());
                // Structural fields of a tool block bill a fixed overhead
                // plus the tool name.
                self.total_output_tokens += 12 + self.estimator.estimate_text_tokens(name);
                out.extend(self.emit_started(out_index, block));
                out
            }
            _ => {
                let out_index = self.alloc_out_index(upstream_index);
                self.emit_started(out_index, block)
            }
        }
    }

    fn on_block_delta(&mut self, upstream_index: usize, delta: BlockDelta) -> Vec<Bytes> {
        match delta {
            BlockDelta::TextDelta { text } => {
                if text.is_empty() {
                    return Vec::new();
                }
                self.touch_ttfb();
                if self.thinking.enabled() {
                    return self.on_thinking_text(&text);
                }
                let (mut out, out_index) = self.ensure_text_block(upstream_index);
                self.total_output_tokens += self.estimator.estimate_text_tokens(&text);
                out.extend(self.emit_event(StreamEvent::ContentBlockDelta {
                    index: out_index,
                    delta: BlockDelta::TextDelta { text },
                }));
                out
            }
            BlockDelta::InputJsonDelta { partial_json } => {
                self.touch_ttfb();
                let Some(out_index) = self.index_map.get(&upstream_index).copied() else {
                    return Vec::new();
                };
                // Bytes accumulate per block and are billed once at stop;
                // per-fragment division would truncate to zero on small
                // fragments.
                *self.json_bytes_by_out_index.entry(out_index).or_insert(0) +=
                    partial_json.len();
                self.emit_event(StreamEvent::ContentBlockDelta {
                    index: out_index,
                    delta: BlockDelta::InputJsonDelta { partial_json },
                })
            }
            BlockDelta::ThinkingDelta { thinking } => {
                self.touch_ttfb();
                let Some(out_index) = self.index_map.get(&upstream_index).copied() else {
                    return Vec::new();
                };
                self.total_output_tokens += self.estimator.estimate_text_tokens(&thinking);
                self.emit_event(StreamEvent::ContentBlockDelta {
                    index: out_index,
                    delta: BlockDelta::ThinkingDelta { thinking },
                })
            }
        }
    }

    fn on_block_stop(&mut self, upstream_index: usize) -> Vec<Bytes> {
        if self.thinking.enabled() && self.synthesized.is_some() {
            // The upstream text block carrying the thinking stream closed;
            // close whichever synthesized block is open.
            return self.close_synthesized();
        }
        let Some(out_index) = self.index_map.get(&upstream_index).copied() else {
            return Vec::new();
        };
        self.finish_block_accounting(out_index);
        self.emit_stop(out_index)
    }

    fn on_exception(&mut self, exception_type: &str, message: &str) -> Vec<Bytes> {
        if exception_type == "ContentLengthExceededException"
            || exception_type.contains("CONTENT_LENGTH_EXCEEDS")
        {
            // Converted, not forwarded: the client sees an orderly
            // max_tokens termination.
            self.max_tokens_hit = true;
            let mut out = self.close_open_blocks();
            out.extend(self.final_message_events("max_tokens"));
            self.finished = true;
            return out;
        }
        tracing::warn!(exception_type, "forwarding upstream exception");
        self.emitter.emit_error("api_error", message)
    }

    fn on_thinking_text(&mut self, text: &str) -> Vec<Bytes> {
        let chunks = self.thinking.parse(text);
        let mut out = Vec::new();
        for chunk in chunks {
            match chunk {
                ParsedChunk::Thinking(content) => {
                    if content.is_empty() {
                        continue;
                    }
                    let index = match self.synthesized {
                        Some((index, SynthesizedKind::Thinking)) => index,
                        _ => {
                            out.extend(self.close_synthesized());
                            let index = self.next_out_index;
                            self.next_out_index += 1;
                            self.synthesized = Some((index, SynthesizedKind::Thinking));
                            out.extend(self.emit_started(
                                index,
                                ContentBlockStart::Thinking {
                                    thinking: String::new(),
                                },
                            ));
                            index
                        }
                    };
                    self.total_output_tokens += self.estimator.estimate_text_tokens(&content);
                    out.extend(self.emit_event(StreamEvent::ContentBlockDelta {
                        index,
                        delta: BlockDelta::ThinkingDelta { thinking: content },
                    }));
                }
                ParsedChunk::Text(content) => {
                    // Residual tags can survive odd splits; strip them.
                    let content = content
                        .replace("</thinking>", "")
                        .replace("<thinking>", "");
                    let content = content.trim_start_matches('\n');
                    if content.is_empty() {
                        continue;
                    }
                    let index = match self.synthesized {
                        Some((index, SynthesizedKind::Text)) => index,
                        _ => {
                            out.extend(self.close_synthesized());
                            let index = self.next_out_index;
                            self.next_out_index += 1;
                            self.synthesized = Some((index, SynthesizedKind::Text));
                            out.extend(self.emit_started(
                                index,
                                ContentBlockStart::Text {
                                    text: String::new(),
                                },
                            ));
                            index
                        }
                    };
                    self.total_output_tokens += self.estimator.estimate_text_tokens(content);
                    out.extend(self.emit_event(StreamEvent::ContentBlockDelta {
                        index,
                        delta: BlockDelta::TextDelta {
                            text: content.to_string(),
                        },
                    }));
                }
            }
        }
        out
    }

    /// Close the stream: stop every open block, settle pending tool-json
    /// billing, and emit the terminal `message_delta` + `message_stop`.
    pub fn finalize(&mut self) -> Vec<Bytes> {
        if self.finished {
            // Already terminated (max_tokens conversion); everything
            // including the trailing terminator went out then.
            return Vec::new();
        }
        self.finished = true;

        let mut out = self.close_open_blocks();

        // Minimum-token guard: content flowed, so the bill is never zero.
        if self.total_output_tokens == 0 {
            let saw_content = self.processed_events > 0
                || !self.completed_tool_ids.is_empty()
                || !self.tool_use_id_by_out_index.is_empty();
            if saw_content {
                self.total_output_tokens = 1;
            }
        }

        let saw_tool_use =
            !self.completed_tool_ids.is_empty() || !self.tool_use_id_by_out_index.is_empty();
        let stop_reason = compute_stop_reason(
            saw_tool_use,
            self.upstream_stop_reason.as_deref(),
            self.max_tokens_hit,
        );
        out.extend(self.final_message_events(stop_reason));
        out
    }

    pub fn error_events(&mut self, error_type: &str, message: &str) -> Vec<Bytes> {
        self.emitter.emit_error(error_type, message)
    }

    // ----- accessors for accounting -----

    pub fn output_tokens(&self) -> u64 {
        self.total_output_tokens
    }

    pub fn input_tokens(&self) -> u64 {
        self.input_tokens
    }

    pub fn credit_usage(&self) -> Option<f64> {
        self.credit_usage
    }

    pub fn context_usage_percent(&self) -> Option<f64> {
        self.context_usage_percent
    }

    pub fn ttfb_ms(&self) -> Option<i64> {
        self.first_content_at
            .map(|at| at.duration_since(self.started_at).as_millis() as i64)
    }

    // ----- internals -----

    fn touch_ttfb(&mut self) {
        if self.first_content_at.is_none() {
            self.first_content_at = Some(Instant::now());
        }
    }

    fn alloc_out_index(&mut self, upstream_index: usize) -> usize {
        let out = self.next_out_index;
        self.next_out_index += 1;
        self.index_map.insert(upstream_index, out);
        out
    }

    /// Text deltas may arrive without a mapped start (the upstream start
    /// was swallowed or never sent); synthesize one.
    fn ensure_text_block(&mut self, upstream_index: usize) -> (Vec<Bytes>, usize) {
        if let Some(out) = self.index_map.get(&upstream_index).copied() {
            if self.blocks.get(&out).is_some_and(|b| b.started && !b.stopped) {
                return (Vec::new(), out);
            }
        }
        let out = self.alloc_out_index(upstream_index);
        let frames = self.emit_started(
            out,
            ContentBlockStart::Text {
                text: String::new(),
            },
        );
        (frames, out)
    }

    fn emit_started(&mut self, out_index: usize, block: ContentBlockStart) -> Vec<Bytes> {
        let state = self.blocks.entry(out_index).or_default();
        if state.started {
            return Vec::new();
        }
        state.started = true;
        self.emitter.emit(&StreamEvent::ContentBlockStart {
            index: out_index,
            content_block: block,
        })
    }

    fn emit_event(&mut self, event: StreamEvent) -> Vec<Bytes> {
        if let StreamEvent::ContentBlockDelta { index, .. } = &event {
            // A delta may only follow its block's start.
            let started = self
                .blocks
                .get(index)
                .is_some_and(|b| b.started && !b.stopped);
            if !started {
                return Vec::new();
            }
        }
        self.emitter.emit(&event)
    }

    fn emit_stop(&mut self, out_index: usize) -> Vec<Bytes> {
        let state = self.blocks.entry(out_index).or_default();
        if !state.started || state.stopped {
            return Vec::new();
        }
        state.stopped = true;
        self.emitter
            .emit(&StreamEvent::ContentBlockStop { index: out_index })
    }

    fn finish_block_accounting(&mut self, out_index: usize) {
        if let Some(bytes) = self.json_bytes_by_out_index.remove(&out_index) {
            if bytes > 0 {
                self.total_output_tokens += bytes.div_ceil(4) as u64;
            }
        }
        if let Some(tool_id) = self.tool_use_id_by_out_index.remove(&out_index) {
            // Remember the tool ran; stop-reason selection happens after
            // the index map has drained.
            self.completed_tool_ids.insert(tool_id);
        }
    }

    fn close_synthesized(&mut self) -> Vec<Bytes> {
        match self.synthesized.take() {
            Some((index, _)) => self.emit_stop(index),
            None => Vec::new(),
        }
    }

    fn close_open_blocks(&mut self) -> Vec<Bytes> {
        let mut out = self.close_synthesized();
        let mut open: Vec<usize> = self
            .blocks
            .iter()
            .filter(|(_, state)| state.started && !state.stopped)
            .map(|(index, _)| *index)
            .collect();
        open.sort_unstable();
        for index in open {
            self.finish_block_accounting(index);
            out.extend(self.emit_stop(index));
        }
        out
    }

    fn final_message_events(&mut self, stop_reason: &str) -> Vec<Bytes> {
        let mut out = self.emitter.emit(&StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop_reason.to_string()),
                stop_sequence: None,
            },
            usage: Usage {
                input_tokens: self.input_tokens,
                output_tokens: self.total_output_tokens,
            },
        });
        out.extend(self.emitter.emit(&StreamEvent::MessageStop));
        out.extend(self.emitter.emit_done());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_start(index: usize) -> StreamEvent {
        StreamEvent::ContentBlockStart {
            index,
            content_block: ContentBlockStart::Text {
                text: String::new(),
            },
        }
    }

    fn text_delta(index: usize, text: &str) -> StreamEvent {
        StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::TextDelta {
                text: text.to_string(),
            },
        }
    }

    fn tool_start(index: usize, id: &str, name: &str) -> StreamEvent {
        StreamEvent::ContentBlockStart {
            index,
            content_block: ContentBlockStart::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: serde_json::json!({}),
            },
        }
    }

    fn json_delta(index: usize, fragment: &str) -> StreamEvent {
        StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::InputJsonDelta {
                partial_json: fragment.to_string(),
            },
        }
    }

    fn stop(index: usize) -> StreamEvent {
        StreamEvent::ContentBlockStop { index }
    }

    fn frames_to_events(frames: &[Bytes]) -> Vec<(String, serde_json::Value)> {
        let mut out = Vec::new();
        for frame in frames {
            let text = std::str::from_utf8(frame).unwrap();
            let mut event_name = String::new();
            for line in text.lines() {
                if let Some(name) = line.strip_prefix("event: ") {
                    event_name = name.to_string();
                }
                if let Some(data) = line.strip_prefix("data: ") {
                    out.push((event_name.clone(), serde_json::from_str(data).unwrap()));
                }
            }
        }
        out
    }

    fn run(
        processor: &mut StreamProcessor<AnthropicEmitter>,
        events: Vec<StreamEvent>,
    ) -> Vec<(String, serde_json::Value)> {
        let mut frames = processor.initial_events();
        for event in events {
            frames.extend(processor.process(event));
        }
        frames.extend(processor.finalize());
        frames_to_events(&frames)
    }

    /// Per block the sequence must be start, deltas, stop, with one
    /// terminal message_stop.
    fn assert_well_formed(events: &[(String, serde_json::Value)]) {
        use std::collections::HashMap;
        let mut state: HashMap<i64, &str> = HashMap::new();
        let mut message_stops = 0;
        for (name, data) in events {
            match name.as_str() {
                "content_block_start" => {
                    let index = data["index"].as_i64().unwrap();
                    assert!(
                        !state.contains_key(&index),
                        "block {index} started twice"
                    );
                    state.insert(index, "open");
                }
                "content_block_delta" => {
                    let index = data["index"].as_i64().unwrap();
                    assert_eq!(state.get(&index), Some(&"open"), "delta outside block");
                }
                "content_block_stop" => {
                    let index = data["index"].as_i64().unwrap();
                    assert_eq!(state.get(&index), Some(&"open"), "stop without start");
                    state.insert(index, "closed");
                }
                "message_stop" => message_stops += 1,
                _ => {}
            }
        }
        assert!(state.values().all(|s| *s == "closed"), "unclosed block");
        assert_eq!(message_stops, 1, "exactly one message_stop");
    }

    #[test]
    fn plain_text_stream_is_well_formed() {
        let mut p = StreamProcessor::new(AnthropicEmitter, "msg_1", "claude-sonnet-4-5", 10, false);
        let events = run(
            &mut p,
            vec![text_start(0), text_delta(0, "hello"), stop(0)],
        );
        assert_well_formed(&events);

        let delta = events
            .iter()
            .find(|(n, _)| n == "message_delta")
            .map(|(_, d)| d)
            .unwrap();
        assert_eq!(delta["delta"]["stop_reason"], "end_turn");
        assert_eq!(delta["usage"]["input_tokens"], 10);
        assert_eq!(delta["usage"]["output_tokens"], 1);
    }

    #[test]
    fn json_delta_tokens_are_additive_across_splits() {
        // The billed tokens depend only on total bytes, not the split.
        let payload = r#"{"city":"SF","unit":"c"}"#;
        let whole = {
            let mut p =
                StreamProcessor::new(AnthropicEmitter, "m", "claude-sonnet-4-5", 1, false);
            p.process(tool_start(0, "tu_1", "get_weather"));
            p.process(json_delta(0, payload));
            p.process(stop(0));
            p.finalize();
            p.output_tokens()
        };
        let fragmented = {
            let mut p =
                StreamProcessor::new(AnthropicEmitter, "m", "claude-sonnet-4-5", 1, false);
            p.process(tool_start(0, "tu_1", "get_weather"));
            for chunk in payload.as_bytes().chunks(3) {
                p.process(json_delta(0, std::str::from_utf8(chunk).unwrap()));
            }
            p.process(stop(0));
            p.finalize();
            p.output_tokens()
        };
        assert_eq!(whole, fragmented);
        let structural = 12 + 2; // "get_weather" is 11 ascii chars
        assert_eq!(whole, structural + (payload.len() as u64).div_ceil(4));
    }

    #[test]
    fn tool_use_sets_stop_reason_even_after_block_closed() {
        let mut p = StreamProcessor::new(AnthropicEmitter, "m", "claude-sonnet-4-5", 1, false);
        let events = run(
            &mut p,
            vec![
                tool_start(0, "tu_1", "run"),
                json_delta(0, "{}"),
                stop(0),
            ],
        );
        assert_well_formed(&events);
        let delta = events
            .iter()
            .find(|(n, _)| n == "message_delta")
            .map(|(_, d)| d)
            .unwrap();
        assert_eq!(delta["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn unclosed_blocks_are_closed_before_terminal_events() {
        let mut p = StreamProcessor::new(AnthropicEmitter, "m", "claude-sonnet-4-5", 1, false);
        // The upstream never sends the tool block stop.
        let events = run(
            &mut p,
            vec![tool_start(0, "tu_1", "run"), json_delta(0, "{\"a\":1}")],
        );
        assert_well_formed(&events);
        // Pending json bytes were still billed at close.
        assert!(p.output_tokens() >= 12 + 2);
    }

    #[test]
    fn metering_and_context_usage_are_stashed_not_forwarded() {
        let mut p = StreamProcessor::new(AnthropicEmitter, "m", "claude-sonnet-4-5", 1, false);
        let events = run(
            &mut p,
            vec![
                text_start(0),
                text_delta(0, "hi there"),
                StreamEvent::Metering { credit_usage: 0.75 },
                StreamEvent::ContextUsage {
                    context_usage_percent: 22.5,
                },
                stop(0),
            ],
        );
        assert!(events.iter().all(|(n, _)| n != "metering" && n != "context_usage"));
        assert_eq!(p.credit_usage(), Some(0.75));
        assert_eq!(p.context_usage_percent(), Some(22.5));
    }

    #[test]
    fn content_length_exception_becomes_max_tokens() {
        let mut p = StreamProcessor::new(AnthropicEmitter, "m", "claude-sonnet-4-5", 5, false);
        let mut frames = p.initial_events();
        frames.extend(p.process(text_start(0)));
        frames.extend(p.process(text_delta(0, "partial answer")));
        frames.extend(p.process(StreamEvent::Exception {
            exception_type: "ContentLengthExceededException".to_string(),
            message: "too long".to_string(),
        }));
        frames.extend(p.finalize());

        let events = frames_to_events(&frames);
        assert_well_formed(&events);
        let delta = events
            .iter()
            .find(|(n, _)| n == "message_delta")
            .map(|(_, d)| d)
            .unwrap();
        assert_eq!(delta["delta"]["stop_reason"], "max_tokens");
        assert!(events.iter().all(|(n, _)| n != "exception" && n != "error"));
    }

    #[test]
    fn other_exceptions_surface_as_error_events() {
        let mut p = StreamProcessor::new(AnthropicEmitter, "m", "claude-sonnet-4-5", 5, false);
        let frames = p.process(StreamEvent::Exception {
            exception_type: "ThrottlingException".to_string(),
            message: "slow down".to_string(),
        });
        let events = frames_to_events(&frames);
        assert_eq!(events[0].0, "error");
    }

    #[test]
    fn thinking_stream_with_tool_matches_expected_sequence() {
        // The streaming scenario: thinking extraction plus a tool call.
        let mut p = StreamProcessor::new(AnthropicEmitter, "m", "claude-sonnet-4-5", 50, true);
        let mut frames = p.initial_events();
        for event in [
            text_start(0),
            text_delta(0, "<thinking>plan</thinking>now calling"),
            stop(0),
            tool_start(1, "tu_1", "get_weather"),
            json_delta(1, "{\"ci"),
            json_delta(1, "ty\":\"SF\"}"),
            stop(1),
            StreamEvent::Metering { credit_usage: 0.1 },
        ] {
            frames.extend(p.process(event));
        }
        frames.extend(p.finalize());
        let events = frames_to_events(&frames);
        assert_well_formed(&events);

        let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "ping",
                "content_block_start", // thinking
                "content_block_delta",
                "content_block_stop",
                "content_block_start", // text
                "content_block_delta",
                "content_block_stop",
                "content_block_start", // tool_use
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        assert_eq!(events[2].1["content_block"]["type"], "thinking");
        assert_eq!(events[3].1["delta"]["thinking"], "plan");
        assert_eq!(events[5].1["content_block"]["type"], "text");
        assert_eq!(events[6].1["delta"]["text"], "now calling");
        assert_eq!(events[8].1["content_block"]["type"], "tool_use");
        assert_eq!(events[8].1["content_block"]["name"], "get_weather");
        assert_eq!(events[9].1["delta"]["partial_json"], "{\"ci");
        assert_eq!(events[10].1["delta"]["partial_json"], "ty\":\"SF\"}");

        let delta = &events[12].1;
        assert_eq!(delta["delta"]["stop_reason"], "tool_use");
        // 13 json bytes -> ceil(13/4) = 4 tokens, plus tool structural
        // overhead.
        assert!(delta["usage"]["output_tokens"].as_u64().unwrap() >= 4 + 12);
    }

    #[test]
    fn openai_adapter_renders_chunks_and_done() {
        let emitter = OpenAiEmitter::new("chatcmpl-1", "claude-sonnet-4-5", 1_700_000_000);
        let mut p = StreamProcessor::new(emitter, "chatcmpl-1", "claude-sonnet-4-5", 3, false);
        let mut frames = p.initial_events();
        for event in [
            text_start(0),
            text_delta(0, "ok"),
            stop(0),
            tool_start(1, "tu_9", "lookup"),
            json_delta(1, "{\"q\":\"rust\"}"),
            stop(1),
        ] {
            frames.extend(p.process(event));
        }
        frames.extend(p.finalize());

        let rendered: Vec<String> = frames
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect();
        assert!(rendered[0].contains("\"role\":\"assistant\""));
        assert!(rendered.iter().any(|f| f.contains("\"content\":\"ok\"")));
        assert!(rendered
            .iter()
            .any(|f| f.contains("\"name\":\"lookup\"") && f.contains("\"id\":\"tu_9\"")));
        assert!(rendered
            .iter()
            .any(|f| f.contains("{\\\"q\\\":\\\"rust\\\"}")));
        assert!(rendered
            .iter()
            .any(|f| f.contains("\"finish_reason\":\"tool_calls\"")));
        assert_eq!(rendered.last().unwrap(), "data: [DONE]\n\n");
    }

    #[test]
    fn minimum_token_guard_applies_when_content_flowed() {
        let mut p = StreamProcessor::new(AnthropicEmitter, "m", "claude-sonnet-4-5", 1, false);
        p.process(text_start(0));
        p.process(text_delta(0, "x")); // under one token at 4 chars/token
        p.process(stop(0));
        p.finalize();
        assert_eq!(p.output_tokens(), 1);
    }

    #[test]
    fn stop_reason_prefers_upstream_when_no_tools() {
        assert_eq!(compute_stop_reason(false, Some("stop_sequence"), false), "stop_sequence");
        assert_eq!(compute_stop_reason(false, None, false), "end_turn");
        assert_eq!(compute_stop_reason(true, Some("end_turn"), false), "tool_use");
        assert_eq!(compute_stop_reason(true, None, true), "max_tokens");
    }
}
