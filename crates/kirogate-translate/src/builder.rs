use serde_json::Value as JsonValue;

use kirogate_protocol::anthropic::{
    ContentBlock, Message, MessageContent, MessagesRequest, Role,
};
use kirogate_protocol::codewhisperer::{
    AssistantResponseMessage, CodeWhispererRequest, ConversationState, CurrentMessage, CwImage,
    CwImageSource, CwTool, CwToolResult, CwToolUse, HistoryAssistantMessage, HistoryMessage,
    HistoryUserMessage, InputSchema, ToolSpecification, UserInputMessage,
};
use kirogate_protocol::models::upstream_model_id;

use crate::thinking::THINKING_PROMPT;
use crate::tools::{is_unsupported_tool, truncate_description};

const ORIGIN: &str = "AI_EDITOR";
const AGENT_TASK_TYPE: &str = "vibe";
/// The upstream rejects conversations past ~163k tokens; trim to a safe
/// ceiling below that.
const MAX_HISTORY_TOKENS: usize = 180_000;
/// Injected when tools are present but the user turn carries no content.
const TOOL_TASK_PLACEHOLDER: &str = "执行工具任务";

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("messages array is empty")]
    EmptyMessages,
    #[error("model not found: {model}")]
    ModelNotFound {
        model: String,
        continuation_id: String,
    },
    #[error("user message carries no content, images, or tool results")]
    EmptyContent,
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub conversation_id: String,
    pub continuation_id: String,
    pub max_tool_description_len: usize,
}

/// Translate a client Messages request into the upstream request shape:
/// strict user/assistant alternation, system prompt synthesized as the
/// leading exchange, unsupported tools dropped, oldest turns trimmed once
/// the estimated context exceeds the upstream ceiling.
pub fn build_codewhisperer_request(
    req: &MessagesRequest,
    opts: &BuildOptions,
) -> Result<CodeWhispererRequest, BuildError> {
    if req.messages.is_empty() {
        return Err(BuildError::EmptyMessages);
    }

    let Some(model_id) = upstream_model_id(&req.model) else {
        return Err(BuildError::ModelNotFound {
            model: req.model.clone(),
            continuation_id: opts.continuation_id.clone(),
        });
    };

    let thinking_enabled = req.thinking.as_ref().is_some_and(|t| t.is_enabled());
    let chat_trigger_type = if !req.tools.is_empty()
        && req.tool_choice.as_ref().is_some_and(|tc| tc.forces_tool_use())
    {
        "AUTO"
    } else {
        "MANUAL"
    };

    // Current message: always the last client message.
    let last = req.messages.last().expect("checked non-empty");
    let (mut content, images, tool_results) = split_user_content(&last.content);
    if last.role == Role::User && !tool_results.is_empty() {
        // Tool-result turns must carry an empty content string upstream.
        content = String::new();
    }

    let tools = convert_tools(req, opts.max_tool_description_len);

    let mut current = UserInputMessage {
        content,
        model_id: model_id.to_string(),
        origin: ORIGIN.to_string(),
        images,
        ..Default::default()
    };
    current.user_input_message_context.tools = tools;
    current.user_input_message_context.tool_results = tool_results;

    let history = build_history(req, model_id, thinking_enabled);

    let mut cw = CodeWhispererRequest {
        conversation_state: ConversationState {
            conversation_id: opts.conversation_id.clone(),
            agent_continuation_id: opts.continuation_id.clone(),
            agent_task_type: AGENT_TASK_TYPE.to_string(),
            chat_trigger_type: chat_trigger_type.to_string(),
            current_message: CurrentMessage {
                user_input_message: current,
            },
            history,
        },
    };

    validate(&mut cw)?;
    Ok(cw)
}

fn validate(cw: &mut CodeWhispererRequest) -> Result<(), BuildError> {
    let message = &mut cw.conversation_state.current_message.user_input_message;
    let has_images = !message.images.is_empty();
    let has_tools = !message.user_input_message_context.tools.is_empty();
    let has_tool_results = !message.user_input_message_context.tool_results.is_empty();

    if has_tool_results {
        return Ok(());
    }
    if message.content.trim().is_empty() && !has_images && has_tools {
        message.content = TOOL_TASK_PLACEHOLDER.to_string();
    }
    if message.content.trim().is_empty() && !has_images {
        return Err(BuildError::EmptyContent);
    }
    Ok(())
}

fn convert_tools(req: &MessagesRequest, max_description_len: usize) -> Vec<CwTool> {
    req.tools
        .iter()
        .filter(|tool| !tool.name.is_empty() && !is_unsupported_tool(&tool.name))
        .map(|tool| CwTool {
            tool_specification: ToolSpecification {
                name: tool.name.clone(),
                description: truncate_description(&tool.description, max_description_len),
                input_schema: InputSchema {
                    json: tool.input_schema.clone(),
                },
            },
        })
        .collect()
}

fn build_history(
    req: &MessagesRequest,
    model_id: &str,
    thinking_enabled: bool,
) -> Vec<HistoryMessage> {
    let has_system = req.system.as_ref().is_some_and(|s| !s.is_empty());
    if !has_system && req.messages.len() <= 1 && req.tools.is_empty() && !thinking_enabled {
        return Vec::new();
    }

    let mut history = Vec::new();

    // Synthesized system exchange: the upstream has no system role, so the
    // prompt rides as the opening user turn answered by "OK".
    let mut system_text = String::new();
    if let Some(system) = &req.system {
        let joined = system.joined_text();
        if !joined.is_empty() {
            system_text.push_str(&joined);
            system_text.push('\n');
        }
    }
    if thinking_enabled {
        system_text.push('\n');
        system_text.push_str(THINKING_PROMPT);
        system_text.push('\n');
    }
    let system_text = system_text.trim().to_string();
    let has_system_pair = !system_text.is_empty();
    if has_system_pair {
        history.push(HistoryMessage::User(HistoryUserMessage {
            user_input_message: UserInputMessage {
                content: system_text,
                model_id: model_id.to_string(),
                origin: ORIGIN.to_string(),
                ..Default::default()
            },
        }));
        history.push(ok_assistant());
    }

    // Everything before the current message is history, except that a
    // trailing assistant turn joins the history (paired with the user turn
    // before it).
    let last_is_user = req.messages.last().is_some_and(|m| m.role == Role::User);
    let history_end = if last_is_user {
        req.messages.len() - 1
    } else {
        req.messages.len()
    };

    let mut user_buffer: Vec<&Message> = Vec::new();
    for message in &req.messages[..history_end] {
        match message.role {
            Role::User => user_buffer.push(message),
            Role::Assistant => {
                // An assistant turn with no preceding user turn is dropped;
                // the upstream cannot represent it.
                if user_buffer.is_empty() {
                    continue;
                }
                history.push(merge_user_messages(&user_buffer, model_id));
                user_buffer.clear();

                let content = message.content.joined_text();
                let tool_uses = extract_tool_uses(&message.content);
                history.push(HistoryMessage::Assistant(HistoryAssistantMessage {
                    assistant_response_message: AssistantResponseMessage {
                        content,
                        tool_uses: if tool_uses.is_empty() {
                            None
                        } else {
                            Some(tool_uses)
                        },
                    },
                }));
            }
        }
    }
    // Orphaned trailing user turns get a synthetic "OK" so alternation
    // holds when the real last message became the current message.
    if !user_buffer.is_empty() {
        history.push(merge_user_messages(&user_buffer, model_id));
        history.push(ok_assistant());
    }

    trim_history(&mut history, has_system_pair);
    history
}

fn ok_assistant() -> HistoryMessage {
    HistoryMessage::Assistant(HistoryAssistantMessage {
        assistant_response_message: AssistantResponseMessage {
            content: "OK".to_string(),
            tool_uses: None,
        },
    })
}

/// Coalesce consecutive user turns into one upstream user message: text
/// joined by newlines, images and tool results unioned. A merged turn that
/// carries tool results drops its text, per the upstream contract.
fn merge_user_messages(buffer: &[&Message], model_id: &str) -> HistoryMessage {
    let mut parts = Vec::new();
    let mut images = Vec::new();
    let mut tool_results = Vec::new();

    for message in buffer {
        let (text, mut msg_images, mut msg_results) = split_user_content(&message.content);
        if !text.is_empty() {
            parts.push(text);
        }
        images.append(&mut msg_images);
        tool_results.append(&mut msg_results);
    }

    let mut user = UserInputMessage {
        content: parts.join("\n"),
        model_id: model_id.to_string(),
        origin: ORIGIN.to_string(),
        images,
        ..Default::default()
    };
    if !tool_results.is_empty() {
        user.content = String::new();
        user.user_input_message_context.tool_results = tool_results;
    }
    HistoryMessage::User(HistoryUserMessage {
        user_input_message: user,
    })
}

fn split_user_content(content: &MessageContent) -> (String, Vec<CwImage>, Vec<CwToolResult>) {
    match content {
        MessageContent::Text(text) => (text.clone(), Vec::new(), Vec::new()),
        MessageContent::Blocks(blocks) => {
            let mut parts = Vec::new();
            let mut images = Vec::new();
            let mut tool_results = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => parts.push(text.as_str()),
                    ContentBlock::Image { source } => images.push(CwImage {
                        format: source
                            .media_type
                            .rsplit('/')
                            .next()
                            .unwrap_or("png")
                            .to_string(),
                        source: CwImageSource {
                            bytes: source.data.clone(),
                        },
                    }),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => tool_results.push(CwToolResult {
                        tool_use_id: tool_use_id.clone(),
                        content: tool_result_content(content.as_ref()),
                        status: if *is_error { "error" } else { "success" }.to_string(),
                    }),
                    ContentBlock::ToolUse { .. } | ContentBlock::Thinking { .. } => {}
                }
            }
            (parts.join("\n"), images, tool_results)
        }
    }
}

/// Tool-result content normalizes to an array of objects; bare strings are
/// wrapped as `{"text": ...}`.
fn tool_result_content(content: Option<&JsonValue>) -> Vec<JsonValue> {
    match content {
        None => Vec::new(),
        Some(JsonValue::String(text)) => vec![serde_json::json!({ "text": text })],
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter(|item| item.is_object())
            .cloned()
            .collect(),
        Some(JsonValue::Object(obj)) => vec![JsonValue::Object(obj.clone())],
        Some(other) => vec![serde_json::json!({ "text": other.to_string() })],
    }
}

fn extract_tool_uses(content: &MessageContent) -> Vec<CwToolUse> {
    content
        .blocks()
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } if !is_unsupported_tool(name) => {
                Some(CwToolUse {
                    tool_use_id: id.clone(),
                    name: name.clone(),
                    input: if input.is_object() {
                        input.clone()
                    } else {
                        serde_json::json!({})
                    },
                })
            }
            _ => None,
        })
        .collect()
}

/// Drop the oldest (user, assistant) pair past the synthetic system pair
/// until the estimate fits the upstream context budget.
fn trim_history(history: &mut Vec<HistoryMessage>, has_system_pair: bool) {
    let protected = if has_system_pair { 2 } else { 0 };
    let mut estimated = estimate_history_tokens(history);
    while estimated > MAX_HISTORY_TOKENS && history.len() > protected + 2 {
        history.drain(protected..protected + 2);
        estimated = estimate_history_tokens(history);
    }
    if estimated > MAX_HISTORY_TOKENS {
        tracing::warn!(estimated, "history still above budget after trimming");
    }
}

/// Rough context estimate: one token per three characters of mixed text,
/// with images counted as ~1000 tokens each.
fn estimate_history_tokens(history: &[HistoryMessage]) -> usize {
    let mut chars = 0usize;
    for entry in history {
        match entry {
            HistoryMessage::User(user) => {
                let m = &user.user_input_message;
                chars += m.content.len();
                chars += m.images.len() * 3000;
                for result in &m.user_input_message_context.tool_results {
                    for item in &result.content {
                        chars += item.to_string().len();
                    }
                }
            }
            HistoryMessage::Assistant(assistant) => {
                let m = &assistant.assistant_response_message;
                chars += m.content.len();
                if let Some(tool_uses) = &m.tool_uses {
                    for tool_use in tool_uses {
                        chars += tool_use.name.len() * 3;
                        chars += tool_use.input.to_string().len();
                    }
                }
            }
        }
    }
    chars / 3
}

#[cfg(test)]
mod tests {
    use super::*;
    use kirogate_protocol::anthropic::{SystemPrompt, Thinking, ToolChoice, ToolDefinition};

    fn opts() -> BuildOptions {
        BuildOptions {
            conversation_id: "conv-test".to_string(),
            continuation_id: "cont-test".to_string(),
            max_tool_description_len: 10_000,
        }
    }

    fn user(text: &str) -> Message {
        Message {
            role: Role::User,
            content: MessageContent::Text(text.to_string()),
        }
    }

    fn assistant(text: &str) -> Message {
        Message {
            role: Role::Assistant,
            content: MessageContent::Text(text.to_string()),
        }
    }

    fn roles(history: &[HistoryMessage]) -> Vec<&'static str> {
        history
            .iter()
            .map(|h| match h {
                HistoryMessage::User(_) => "user",
                HistoryMessage::Assistant(_) => "assistant",
            })
            .collect()
    }

    #[test]
    fn single_message_has_no_history() {
        let req = MessagesRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages: vec![user("ping")],
            ..Default::default()
        };
        let cw = build_codewhisperer_request(&req, &opts()).unwrap();
        assert!(cw.conversation_state.history.is_empty());
        assert_eq!(
            cw.conversation_state.current_message.user_input_message.content,
            "ping"
        );
        assert_eq!(cw.conversation_state.chat_trigger_type, "MANUAL");
    }

    #[test]
    fn unknown_model_is_an_error_with_continuation_id() {
        let req = MessagesRequest {
            model: "gpt-oss".to_string(),
            messages: vec![user("hi")],
            ..Default::default()
        };
        match build_codewhisperer_request(&req, &opts()).unwrap_err() {
            BuildError::ModelNotFound {
                model,
                continuation_id,
            } => {
                assert_eq!(model, "gpt-oss");
                assert_eq!(continuation_id, "cont-test");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn history_alternates_strictly() {
        // Consecutive user turns, an orphaned assistant, and a trailing
        // user run all normalize into strict alternation.
        let req = MessagesRequest {
            model: "claude-sonnet-4-5".to_string(),
            system: Some(SystemPrompt::Text("be brief".to_string())),
            messages: vec![
                assistant("orphan"),
                user("one"),
                user("two"),
                assistant("reply"),
                user("three"),
                user("four"),
                user("current"),
            ],
            ..Default::default()
        };
        let cw = build_codewhisperer_request(&req, &opts()).unwrap();
        let history = &cw.conversation_state.history;
        assert_eq!(
            roles(history),
            vec!["user", "assistant", "user", "assistant", "user", "assistant"]
        );
        // Merged consecutive users joined by newline.
        match &history[2] {
            HistoryMessage::User(u) => {
                assert_eq!(u.user_input_message.content, "one\ntwo")
            }
            _ => unreachable!(),
        }
        // Trailing users get the synthetic OK.
        match &history[5] {
            HistoryMessage::Assistant(a) => {
                assert_eq!(a.assistant_response_message.content, "OK")
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn trailing_assistant_joins_history() {
        let req = MessagesRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages: vec![user("q"), assistant("a")],
            ..Default::default()
        };
        // The last message is an assistant turn, so it pairs into history
        // and the current message is still the last client message.
        let cw = build_codewhisperer_request(&req, &opts()).unwrap();
        assert_eq!(roles(&cw.conversation_state.history), vec!["user", "assistant"]);
    }

    #[test]
    fn tool_choice_any_selects_auto_trigger() {
        let req = MessagesRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages: vec![user("do it")],
            tools: vec![ToolDefinition {
                name: "get_weather".to_string(),
                description: "weather".to_string(),
                input_schema: serde_json::json!({"type": "object"}),
            }],
            tool_choice: Some(ToolChoice {
                choice_type: "any".to_string(),
                name: None,
            }),
            ..Default::default()
        };
        let cw = build_codewhisperer_request(&req, &opts()).unwrap();
        assert_eq!(cw.conversation_state.chat_trigger_type, "AUTO");
    }

    #[test]
    fn unsupported_tools_are_dropped_silently() {
        let req = MessagesRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages: vec![user("hi")],
            tools: vec![
                ToolDefinition {
                    name: "web_search".to_string(),
                    description: String::new(),
                    input_schema: serde_json::json!({}),
                },
                ToolDefinition {
                    name: "get_weather".to_string(),
                    description: String::new(),
                    input_schema: serde_json::json!({}),
                },
            ],
            ..Default::default()
        };
        let cw = build_codewhisperer_request(&req, &opts()).unwrap();
        let tools = &cw
            .conversation_state
            .current_message
            .user_input_message
            .user_input_message_context
            .tools;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].tool_specification.name, "get_weather");
    }

    #[test]
    fn tool_result_turn_has_empty_content() {
        let req = MessagesRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages: vec![
                user("run it"),
                Message {
                    role: Role::Assistant,
                    content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                        id: "tu_1".to_string(),
                        name: "run".to_string(),
                        input: serde_json::json!({"cmd": "ls"}),
                    }]),
                },
                Message {
                    role: Role::User,
                    content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                        tool_use_id: "tu_1".to_string(),
                        content: Some(serde_json::json!("file.txt")),
                        is_error: false,
                    }]),
                },
            ],
            ..Default::default()
        };
        let cw = build_codewhisperer_request(&req, &opts()).unwrap();
        let current = &cw.conversation_state.current_message.user_input_message;
        assert_eq!(current.content, "");
        assert_eq!(
            current.user_input_message_context.tool_results[0].tool_use_id,
            "tu_1"
        );
        assert_eq!(
            current.user_input_message_context.tool_results[0].content[0]["text"],
            "file.txt"
        );
        // Assistant's tool use survives into history.
        match &cw.conversation_state.history[1] {
            HistoryMessage::Assistant(a) => {
                let uses = a.assistant_response_message.tool_uses.as_ref().unwrap();
                assert_eq!(uses[0].name, "run");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn thinking_prompt_lands_in_system_pair() {
        let req = MessagesRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages: vec![user("think hard")],
            thinking: Some(Thinking {
                mode: "enabled".to_string(),
                budget_tokens: None,
            }),
            ..Default::default()
        };
        let cw = build_codewhisperer_request(&req, &opts()).unwrap();
        match &cw.conversation_state.history[0] {
            HistoryMessage::User(u) => {
                assert!(u.user_input_message.content.contains("<thinking>"))
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn oversized_history_is_trimmed_but_system_pair_survives() {
        let big = "x".repeat(200_000); // ~66k estimated tokens per turn
        let req = MessagesRequest {
            model: "claude-sonnet-4-5".to_string(),
            system: Some(SystemPrompt::Text("rules".to_string())),
            messages: vec![
                user(&big),
                assistant("a1"),
                user(&big),
                assistant("a2"),
                user(&big),
                assistant("a3"),
                user(&big),
                assistant("a4"),
                user("current"),
            ],
            ..Default::default()
        };
        let cw = build_codewhisperer_request(&req, &opts()).unwrap();
        let history = &cw.conversation_state.history;
        assert!(estimate_history_tokens(history) <= MAX_HISTORY_TOKENS);
        // System pair is intact at the front.
        match &history[0] {
            HistoryMessage::User(u) => assert_eq!(u.user_input_message.content, "rules"),
            _ => unreachable!(),
        }
        match &history[1] {
            HistoryMessage::Assistant(a) => {
                assert_eq!(a.assistant_response_message.content, "OK")
            }
            _ => unreachable!(),
        }
        // The newest turns survive; a4 is still the last assistant.
        match history.last().unwrap() {
            HistoryMessage::Assistant(a) => {
                assert_eq!(a.assistant_response_message.content, "a4")
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn empty_content_with_tools_gets_placeholder() {
        let req = MessagesRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages: vec![user("   ")],
            tools: vec![ToolDefinition {
                name: "runner".to_string(),
                description: String::new(),
                input_schema: serde_json::json!({}),
            }],
            ..Default::default()
        };
        let cw = build_codewhisperer_request(&req, &opts()).unwrap();
        assert_eq!(
            cw.conversation_state.current_message.user_input_message.content,
            TOOL_TASK_PLACEHOLDER
        );
    }

    #[test]
    fn empty_content_without_tools_is_rejected() {
        let req = MessagesRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages: vec![user("")],
            ..Default::default()
        };
        assert!(matches!(
            build_codewhisperer_request(&req, &opts()).unwrap_err(),
            BuildError::EmptyContent
        ));
    }
}
