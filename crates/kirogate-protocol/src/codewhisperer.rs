use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Upstream completion request. Field names follow the upstream's camelCase
/// wire contract exactly; do not rename.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeWhispererRequest {
    pub conversation_state: ConversationState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub conversation_id: String,
    pub agent_continuation_id: String,
    /// Fixed to "vibe".
    pub agent_task_type: String,
    /// "AUTO" when tools with a forcing tool_choice are present, else "MANUAL".
    pub chat_trigger_type: String,
    pub current_message: CurrentMessage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentMessage {
    pub user_input_message: UserInputMessage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessage {
    pub content: String,
    pub model_id: String,
    /// Fixed to "AI_EDITOR".
    pub origin: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<CwImage>,
    #[serde(default)]
    pub user_input_message_context: UserInputMessageContext,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessageContext {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<CwTool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<CwToolResult>,
}

/// History strictly alternates user/assistant entries; the untagged encoding
/// keys off which wrapper field is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HistoryMessage {
    User(HistoryUserMessage),
    Assistant(HistoryAssistantMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryUserMessage {
    pub user_input_message: UserInputMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryAssistantMessage {
    pub assistant_response_message: AssistantResponseMessage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponseMessage {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_uses: Option<Vec<CwToolUse>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CwTool {
    pub tool_specification: ToolSpecification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSchema {
    pub json: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CwToolUse {
    pub tool_use_id: String,
    pub name: String,
    pub input: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CwToolResult {
    pub tool_use_id: String,
    pub content: Vec<JsonValue>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CwImage {
    pub format: String,
    pub source: CwImageSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CwImageSource {
    pub bytes: String,
}

/// SOCIAL refresh exchange.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialRefreshRequest {
    pub refresh_token: String,
}

/// IDC (OIDC device) refresh exchange.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdcRefreshRequest {
    pub client_id: String,
    pub client_secret: String,
    pub grant_type: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: i64,
}

/// Usage-limits response. Only the fields the quota math reads are modeled.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLimits {
    #[serde(default)]
    pub usage_breakdown_list: Vec<UsageBreakdown>,
    #[serde(default)]
    pub user_info: UsageUserInfo,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBreakdown {
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub usage_limit_with_precision: f64,
    #[serde(default)]
    pub current_usage_with_precision: f64,
    #[serde(default)]
    pub free_trial_info: Option<FreeTrialInfo>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeTrialInfo {
    #[serde(default)]
    pub free_trial_status: String,
    #[serde(default)]
    pub usage_limit_with_precision: f64,
    #[serde(default)]
    pub current_usage_with_precision: f64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageUserInfo {
    #[serde(default)]
    pub email: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_roundtrips_untagged() {
        let history = vec![
            HistoryMessage::User(HistoryUserMessage {
                user_input_message: UserInputMessage {
                    content: "hi".into(),
                    model_id: "m".into(),
                    origin: "AI_EDITOR".into(),
                    ..Default::default()
                },
            }),
            HistoryMessage::Assistant(HistoryAssistantMessage {
                assistant_response_message: AssistantResponseMessage {
                    content: "OK".into(),
                    tool_uses: None,
                },
            }),
        ];
        let json = serde_json::to_value(&history).unwrap();
        assert!(json[0]["userInputMessage"].is_object());
        assert!(json[1]["assistantResponseMessage"].is_object());
        let back: Vec<HistoryMessage> = serde_json::from_value(json).unwrap();
        assert!(matches!(back[0], HistoryMessage::User(_)));
        assert!(matches!(back[1], HistoryMessage::Assistant(_)));
    }
}
