pub const THINKING_START_TAG: &str = "<thinking>";
pub const THINKING_END_TAG: &str = "</thinking>";

/// Injected into the synthesized system prompt when the client enables
/// thinking; the stream parser later strips the tags back out.
pub const THINKING_PROMPT: &str = r#"You MUST use this EXACT response format for EVERY response:

<thinking>
[Your step-by-step reasoning here]
</thinking>

[Your final answer here - this part is REQUIRED]

Here is a concrete example:

User: What is 15 + 27?
Assistant:
<thinking>
I need to add 15 and 27.
15 + 27 = 42
</thinking>

The answer is 42.

Another example:

User: Write a haiku about rain.
Assistant:
<thinking>
A haiku has 5-7-5 syllables.
Line 1 (5): "Soft rain falls gently" = 5
Line 2 (7): "Washing away yesterday" = 7
Line 3 (5): "New day begins fresh" = 5
</thinking>

Soft rain falls gently
Washing away yesterday
New day begins fresh

CRITICAL RULES:
1. Always start with <thinking> tags
2. Always close with </thinking>
3. ALWAYS provide your final answer AFTER </thinking> - this is mandatory
4. The content after </thinking> should be your actual response to the user"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedChunk {
    Thinking(String),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Text,
    Thinking,
}

/// Streaming parser for `<thinking>` tags split across deltas. A partial
/// tag at the buffer tail is held back until the next chunk decides it.
#[derive(Debug)]
pub struct ThinkingParser {
    state: State,
    buffer: String,
    enabled: bool,
}

impl ThinkingParser {
    pub fn new(enabled: bool) -> Self {
        Self {
            state: State::Text,
            buffer: String::new(),
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn parse(&mut self, text: &str) -> Vec<ParsedChunk> {
        if !self.enabled {
            return vec![ParsedChunk::Text(text.to_string())];
        }

        let mut results = Vec::new();
        self.buffer.push_str(text);
        let mut content = std::mem::take(&mut self.buffer);

        loop {
            if content.is_empty() {
                break;
            }
            let (tag, emit_thinking) = match self.state {
                State::Text => (THINKING_START_TAG, false),
                State::Thinking => (THINKING_END_TAG, true),
            };
            match content.find(tag) {
                Some(at) => {
                    if at > 0 {
                        let chunk = content[..at].to_string();
                        results.push(if emit_thinking {
                            ParsedChunk::Thinking(chunk)
                        } else {
                            ParsedChunk::Text(chunk)
                        });
                    }
                    content = content[at + tag.len()..].to_string();
                    self.state = match self.state {
                        State::Text => State::Thinking,
                        State::Thinking => State::Text,
                    };
                }
                None => {
                    if let Some(held_from) = partial_tag_start(&content, tag) {
                        let (emit, hold) = content.split_at(held_from);
                        if !emit.is_empty() {
                            results.push(if emit_thinking {
                                ParsedChunk::Thinking(emit.to_string())
                            } else {
                                ParsedChunk::Text(emit.to_string())
                            });
                        }
                        self.buffer = hold.to_string();
                    } else {
                        results.push(if emit_thinking {
                            ParsedChunk::Thinking(content)
                        } else {
                            ParsedChunk::Text(content)
                        });
                    }
                    break;
                }
            }
        }

        results
    }

    pub fn is_in_thinking(&self) -> bool {
        self.state == State::Thinking
    }

    pub fn reset(&mut self) {
        self.state = State::Text;
        self.buffer.clear();
    }
}

/// Byte offset where a trailing prefix of `tag` begins, if the buffer ends
/// with one.
fn partial_tag_start(content: &str, tag: &str) -> Option<usize> {
    let bytes = content.as_bytes();
    let tag_bytes = tag.as_bytes();
    for take in (1..tag_bytes.len()).rev() {
        if take > bytes.len() {
            continue;
        }
        if &bytes[bytes.len() - take..] == &tag_bytes[..take] {
            return Some(bytes.len() - take);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_passes_text_through() {
        let mut parser = ThinkingParser::new(false);
        assert_eq!(
            parser.parse("<thinking>x</thinking>"),
            vec![ParsedChunk::Text("<thinking>x</thinking>".to_string())]
        );
    }

    #[test]
    fn splits_thinking_and_text_in_one_chunk() {
        let mut parser = ThinkingParser::new(true);
        let chunks = parser.parse("<thinking>plan</thinking>now calling");
        assert_eq!(
            chunks,
            vec![
                ParsedChunk::Thinking("plan".to_string()),
                ParsedChunk::Text("now calling".to_string()),
            ]
        );
        assert!(!parser.is_in_thinking());
    }

    #[test]
    fn holds_partial_tag_at_buffer_tail() {
        let mut parser = ThinkingParser::new(true);
        let first = parser.parse("before<think");
        assert_eq!(first, vec![ParsedChunk::Text("before".to_string())]);

        let second = parser.parse("ing>inside</th");
        assert_eq!(second, vec![ParsedChunk::Thinking("inside".to_string())]);
        assert!(parser.is_in_thinking());

        let third = parser.parse("inking>after");
        assert_eq!(third, vec![ParsedChunk::Text("after".to_string())]);
    }

    #[test]
    fn unterminated_thinking_flushes_as_thinking() {
        let mut parser = ThinkingParser::new(true);
        let chunks = parser.parse("<thinking>never closed");
        assert_eq!(chunks, vec![ParsedChunk::Thinking("never closed".to_string())]);
    }

    #[test]
    fn false_partial_is_released_next_chunk() {
        let mut parser = ThinkingParser::new(true);
        let first = parser.parse("a <");
        assert_eq!(first, vec![ParsedChunk::Text("a ".to_string())]);
        let second = parser.parse("b then");
        assert_eq!(second, vec![ParsedChunk::Text("<b then".to_string())]);
    }
}
