/// Tools the upstream rejects; they are dropped silently from requests and
/// from historical tool_use blocks.
const UNSUPPORTED_TOOLS: &[&str] = &[
    // web search
    "web_search",
    "websearch",
    // computer use
    "computer",
    "computer_20241022",
    "computer_20250124",
    "bash_20241022",
    "bash_20250124",
    "text_editor_20241022",
    "text_editor_20250124",
    "textEditor_20250429",
    "str_replace_editor",
    // code execution
    "code_execution",
    "code_execution_20250825",
];

pub fn is_unsupported_tool(name: &str) -> bool {
    UNSUPPORTED_TOOLS.contains(&name)
}

/// Cap a tool description at `max_len` characters (not bytes), preserving
/// UTF-8 boundaries.
pub fn truncate_description(description: &str, max_len: usize) -> String {
    if description.chars().count() <= max_len {
        return description.to_string();
    }
    description.chars().take(max_len).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocklist_membership() {
        assert!(is_unsupported_tool("web_search"));
        assert!(is_unsupported_tool("computer_20250124"));
        assert!(!is_unsupported_tool("get_weather"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_description("short", 100), "short");
        assert_eq!(truncate_description("abcdef", 3), "abc");
        assert_eq!(truncate_description("héllo", 2), "hé");
    }
}
