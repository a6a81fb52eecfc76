use serde_json::Value as JsonValue;

use kirogate_protocol::anthropic::{
    ContentBlock, Message, MessageContent, MessagesRequest, Role, SystemPrompt, ToolChoice,
    ToolDefinition,
};
use kirogate_protocol::openai::{
    ChatChoice, ChatChoiceMessage, ChatCompletionResponse, ChatCompletionsRequest,
    ChatFunctionCall, ChatToolCall, ChatUsage,
};

/// Normalize an OpenAI Chat Completions request into the internal Messages
/// shape; the rest of the pipeline only speaks Anthropic.
pub fn chat_to_messages(req: &ChatCompletionsRequest) -> MessagesRequest {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Message> = Vec::new();

    for chat_message in &req.messages {
        match chat_message.role.as_str() {
            "system" | "developer" => {
                let text = chat_message.text();
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "user" => messages.push(Message {
                role: Role::User,
                content: MessageContent::Text(chat_message.text()),
            }),
            "assistant" => {
                let mut blocks = Vec::new();
                let text = chat_message.text();
                if !text.is_empty() {
                    blocks.push(ContentBlock::Text { text });
                }
                for call in &chat_message.tool_calls {
                    let input: JsonValue = serde_json::from_str(&call.function.arguments)
                        .unwrap_or_else(|_| serde_json::json!({}));
                    blocks.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input,
                    });
                }
                messages.push(Message {
                    role: Role::Assistant,
                    content: MessageContent::Blocks(blocks),
                });
            }
            "tool" => {
                // Tool responses come back as user turns carrying a
                // tool_result block.
                messages.push(Message {
                    role: Role::User,
                    content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                        tool_use_id: chat_message.tool_call_id.clone().unwrap_or_default(),
                        content: Some(JsonValue::String(chat_message.text())),
                        is_error: false,
                    }]),
                });
            }
            _ => {}
        }
    }

    let tools: Vec<ToolDefinition> = req
        .tools
        .iter()
        .map(|tool| ToolDefinition {
            name: tool.function.name.clone(),
            description: tool.function.description.clone(),
            input_schema: tool.function.parameters.clone(),
        })
        .collect();

    MessagesRequest {
        model: req.model.clone(),
        messages,
        system: if system_parts.is_empty() {
            None
        } else {
            Some(SystemPrompt::Text(system_parts.join("\n")))
        },
        max_tokens: req.max_tokens.or(req.max_completion_tokens),
        stream: req.stream.unwrap_or(false),
        tools,
        tool_choice: convert_tool_choice(req.tool_choice.as_ref()),
        thinking: None,
    }
}

fn convert_tool_choice(choice: Option<&JsonValue>) -> Option<ToolChoice> {
    match choice? {
        JsonValue::String(mode) => match mode.as_str() {
            "required" => Some(ToolChoice {
                choice_type: "any".to_string(),
                name: None,
            }),
            "auto" => Some(ToolChoice {
                choice_type: "auto".to_string(),
                name: None,
            }),
            _ => None,
        },
        JsonValue::Object(obj) => {
            let name = obj
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(JsonValue::as_str)?;
            Some(ToolChoice {
                choice_type: "tool".to_string(),
                name: Some(name.to_string()),
            })
        }
        _ => None,
    }
}

/// Anthropic stop reason → OpenAI finish reason.
pub fn chat_finish_reason(stop_reason: &str) -> &'static str {
    match stop_reason {
        "tool_use" => "tool_calls",
        "max_tokens" => "length",
        _ => "stop",
    }
}

/// Render the collected completion as a single OpenAI response body.
#[allow(clippy::too_many_arguments)]
pub fn render_chat_completion(
    message_id: &str,
    created: i64,
    model: &str,
    text: &str,
    tool_calls: &[(String, String, JsonValue)],
    stop_reason: &str,
    input_tokens: u64,
    output_tokens: u64,
) -> ChatCompletionResponse {
    let tool_calls: Vec<ChatToolCall> = tool_calls
        .iter()
        .map(|(id, name, arguments)| ChatToolCall {
            id: id.clone(),
            call_type: "function".to_string(),
            function: ChatFunctionCall {
                name: name.clone(),
                arguments: serde_json::to_string(arguments).unwrap_or_else(|_| "{}".to_string()),
            },
        })
        .collect();

    ChatCompletionResponse {
        id: message_id.to_string(),
        object: "chat.completion".to_string(),
        created,
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatChoiceMessage {
                role: "assistant".to_string(),
                content: if text.is_empty() {
                    None
                } else {
                    Some(text.to_string())
                },
                tool_calls,
            },
            finish_reason: chat_finish_reason(stop_reason).to_string(),
        }],
        usage: ChatUsage {
            prompt_tokens: input_tokens,
            completion_tokens: output_tokens,
            total_tokens: input_tokens + output_tokens,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(req: JsonValue) -> ChatCompletionsRequest {
        serde_json::from_value(req).unwrap()
    }

    #[test]
    fn system_and_turns_convert() {
        let req = parse(serde_json::json!({
            "model": "claude-sonnet-4-5",
            "stream": true,
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": "hi"},
                {"role": "user", "content": "bye"}
            ]
        }));
        let converted = chat_to_messages(&req);
        assert!(converted.stream);
        assert_eq!(
            converted.system.as_ref().unwrap().joined_text(),
            "be terse"
        );
        assert_eq!(converted.messages.len(), 3);
        assert_eq!(converted.messages[0].role, Role::User);
    }

    #[test]
    fn tool_calls_and_results_convert() {
        let req = parse(serde_json::json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "tool_calls": [
                    {"id": "call_1", "type": "function",
                     "function": {"name": "get_weather", "arguments": "{\"city\":\"SF\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "sunny"}
            ],
            "tools": [
                {"type": "function", "function": {"name": "get_weather", "description": "w", "parameters": {"type": "object"}}}
            ],
            "tool_choice": "required"
        }));
        let converted = chat_to_messages(&req);
        assert_eq!(converted.tools.len(), 1);
        assert!(converted.tool_choice.as_ref().unwrap().forces_tool_use());

        match &converted.messages[1].content {
            MessageContent::Blocks(blocks) => match &blocks[0] {
                ContentBlock::ToolUse { name, input, .. } => {
                    assert_eq!(name, "get_weather");
                    assert_eq!(input["city"], "SF");
                }
                _ => panic!("expected tool_use"),
            },
            _ => panic!("expected blocks"),
        }
        assert!(converted.messages[2].content.has_tool_results());
    }

    #[test]
    fn finish_reasons_map() {
        assert_eq!(chat_finish_reason("tool_use"), "tool_calls");
        assert_eq!(chat_finish_reason("max_tokens"), "length");
        assert_eq!(chat_finish_reason("end_turn"), "stop");
    }

    #[test]
    fn rendered_completion_carries_tool_calls() {
        let resp = render_chat_completion(
            "chatcmpl-1",
            1700000000,
            "claude-sonnet-4-5",
            "",
            &[(
                "call_1".to_string(),
                "get_weather".to_string(),
                serde_json::json!({"city": "SF"}),
            )],
            "tool_use",
            10,
            5,
        );
        assert_eq!(resp.choices[0].finish_reason, "tool_calls");
        assert_eq!(resp.choices[0].message.tool_calls[0].function.name, "get_weather");
        assert_eq!(resp.usage.total_tokens, 15);
    }
}
