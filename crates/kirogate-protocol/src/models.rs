use serde::{Deserialize, Serialize};

/// Closed mapping from client model names to upstream model ids. Unknown
/// names are a request error, never a silent fallback.
pub const MODEL_MAP: &[(&str, &str)] = &[
    // Sonnet 4.5
    ("claude-sonnet-4-5", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    ("claude-sonnet-4-5-20250929", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    // Sonnet 4
    ("claude-sonnet-4-0", "CLAUDE_SONNET_4_20250514_V1_0"),
    ("claude-sonnet-4-20250514", "CLAUDE_SONNET_4_20250514_V1_0"),
    // Sonnet 3.7
    ("claude-3-7-sonnet-latest", "CLAUDE_3_7_SONNET_20250219_V1_0"),
    ("claude-3-7-sonnet-20250219", "CLAUDE_3_7_SONNET_20250219_V1_0"),
    // Haiku
    ("claude-haiku-4-5", "auto"),
    ("claude-haiku-4-5-20251001", "auto"),
    ("claude-3-5-haiku-20241022", "auto"),
    // Opus
    ("claude-opus-4-5", "claude-opus-4.5"),
    ("claude-opus-4-5-20251101", "claude-opus-4.5"),
    ("claude-opus-4-1", "claude-opus-4.5"),
    ("claude-opus-4-1-20250805", "claude-opus-4.5"),
    ("claude-opus-4-0", "claude-opus-4.5"),
    ("claude-opus-4-20250514", "claude-opus-4.5"),
];

pub fn upstream_model_id(client_model: &str) -> Option<&'static str> {
    MODEL_MAP
        .iter()
        .find(|(name, _)| *name == client_model)
        .map(|(_, id)| *id)
}

pub fn client_model_ids() -> impl Iterator<Item = &'static str> {
    MODEL_MAP.iter().map(|(name, _)| *name)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelObject {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub model_type: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelObject>,
}

pub fn models_response() -> ModelsResponse {
    ModelsResponse {
        object: "list".to_string(),
        data: client_model_ids()
            .map(|id| ModelObject {
                id: id.to_string(),
                object: "model".to_string(),
                created: 1234567890,
                owned_by: "anthropic".to_string(),
                display_name: id.to_string(),
                model_type: "text".to_string(),
                max_tokens: 200_000,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_models_resolve() {
        assert_eq!(
            upstream_model_id("claude-sonnet-4-5"),
            Some("CLAUDE_SONNET_4_5_20250929_V1_0")
        );
        assert_eq!(upstream_model_id("claude-opus-4-1"), Some("claude-opus-4.5"));
        assert_eq!(upstream_model_id("gpt-4o"), None);
    }

    #[test]
    fn models_listing_covers_every_map_entry() {
        let listing = models_response();
        assert_eq!(listing.data.len(), MODEL_MAP.len());
        assert!(listing.data.iter().all(|m| m.max_tokens == 200_000));
    }
}
