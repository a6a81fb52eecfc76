use serde::{Deserialize, Serialize};

/// Anthropic-shaped error body: `{"error": {"type", "message", "code"}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ApiError,
}

impl ErrorResponse {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: ApiError {
                error_type: error_type.into(),
                message: message.into(),
                code: Some(code.into()),
            },
        }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self::new(
            error_type_from_status(status),
            message,
            error_code_from_status(status),
        )
    }
}

pub fn error_code_from_status(status: u16) -> &'static str {
    match status {
        400 => "bad_request",
        401 => "unauthorized",
        403 => "forbidden",
        404 => "not_found",
        408 => "timeout",
        429 => "rate_limited",
        503 => "overloaded",
        _ => "internal_error",
    }
}

pub fn error_type_from_status(status: u16) -> &'static str {
    match status {
        400 => "invalid_request_error",
        401 | 403 => "authentication_error",
        404 => "not_found_error",
        408 => "timeout_error",
        429 => "rate_limit_error",
        503 => "overloaded_error",
        _ => "api_error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_shape() {
        let body = ErrorResponse::from_status(429, "slow down");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"]["type"], "rate_limit_error");
        assert_eq!(json["error"]["code"], "rate_limited");
        assert_eq!(json["error"]["message"], "slow down");
    }
}
