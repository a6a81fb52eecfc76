use serde_json::Value as JsonValue;

use kirogate_protocol::anthropic::{
    ContentBlock, Message, MessageContent, SystemPrompt, ToolDefinition,
};

/// Character-based token estimator. ASCII runs roughly four characters per
/// token; wider scripts closer to one token per character and a half, so a
/// non-ASCII character weighs three quarters.
#[derive(Debug, Default)]
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn new() -> Self {
        Self
    }

    pub fn estimate_text_tokens(&self, text: &str) -> u64 {
        let mut weighted = 0u64;
        for ch in text.chars() {
            weighted += if ch.is_ascii() { 1 } else { 3 };
        }
        weighted / 4
    }

    /// Tool-call output: fixed structural overhead (type/id/name fields)
    /// plus the name and the serialized input.
    pub fn estimate_tool_use_tokens(&self, name: &str, input: &JsonValue) -> u64 {
        let input_len = serde_json::to_string(input).map(|s| s.len()).unwrap_or(0) as u64;
        12 + self.estimate_text_tokens(name) + input_len.div_ceil(4)
    }

    /// Input-token estimate over everything sent upstream.
    pub fn estimate_input_tokens(
        &self,
        system: Option<&SystemPrompt>,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> u64 {
        let mut total = 0u64;
        if let Some(system) = system {
            total += self.estimate_text_tokens(&system.joined_text());
        }
        for message in messages {
            total += self.estimate_content_tokens(&message.content);
            total += 3; // role framing
        }
        for tool in tools {
            total += self.estimate_text_tokens(&tool.name);
            total += self.estimate_text_tokens(&tool.description);
            let schema_len = serde_json::to_string(&tool.input_schema)
                .map(|s| s.len())
                .unwrap_or(0) as u64;
            total += schema_len / 4;
        }
        total.max(1)
    }

    fn estimate_content_tokens(&self, content: &MessageContent) -> u64 {
        match content {
            MessageContent::Text(text) => self.estimate_text_tokens(text),
            MessageContent::Blocks(blocks) => {
                let mut total = 0u64;
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => total += self.estimate_text_tokens(text),
                        ContentBlock::Image { .. } => total += 1_000,
                        ContentBlock::ToolUse { name, input, .. } => {
                            total += self.estimate_tool_use_tokens(name, input)
                        }
                        ContentBlock::ToolResult { content, .. } => {
                            if let Some(content) = content {
                                let len = serde_json::to_string(content)
                                    .map(|s| s.len())
                                    .unwrap_or(0) as u64;
                                total += len / 4;
                            }
                        }
                        ContentBlock::Thinking { thinking, .. } => {
                            total += self.estimate_text_tokens(thinking)
                        }
                    }
                }
                total
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_text_is_four_chars_per_token() {
        let est = TokenEstimator::new();
        assert_eq!(est.estimate_text_tokens("hello"), 1);
        assert_eq!(est.estimate_text_tokens("now calling"), 2);
        assert_eq!(est.estimate_text_tokens(""), 0);
    }

    #[test]
    fn wide_chars_weigh_more() {
        let est = TokenEstimator::new();
        // Four CJK characters: 4 * 3 / 4 = 3 tokens.
        assert_eq!(est.estimate_text_tokens("执行工具"), 3);
    }

    #[test]
    fn tool_use_includes_structural_overhead() {
        let est = TokenEstimator::new();
        let input = serde_json::json!({"city": "SF"});
        let tokens = est.estimate_tool_use_tokens("get_weather", &input);
        assert!(tokens >= 12 + 2);
    }

    #[test]
    fn input_estimate_counts_images_heavily() {
        let est = TokenEstimator::new();
        let messages = vec![Message {
            role: kirogate_protocol::anthropic::Role::User,
            content: MessageContent::Blocks(vec![ContentBlock::Image {
                source: kirogate_protocol::anthropic::ImageSource {
                    source_type: "base64".into(),
                    media_type: "image/png".into(),
                    data: "AAAA".into(),
                },
            }]),
        }];
        assert!(est.estimate_input_tokens(None, &messages, &[]) >= 1_000);
    }
}
