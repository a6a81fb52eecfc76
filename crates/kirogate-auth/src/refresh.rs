use time::OffsetDateTime;
use wreq::Client;

use kirogate_protocol::codewhisperer::{
    IdcRefreshRequest, RefreshResponse, SocialRefreshRequest, UsageLimits,
};

use crate::constants::{IDC_REFRESH_URL, SOCIAL_REFRESH_URL, USAGE_LIMITS_URL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    Social,
    Idc,
}

impl AuthKind {
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("idc") {
            AuthKind::Idc
        } else {
            AuthKind::Social
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthKind::Social => "Social",
            AuthKind::Idc => "IdC",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("refresh transport error: {0}")]
    Transport(String),
    #[error("refresh failed: status {status}, body: {body}")]
    Status { status: u16, body: String },
    #[error("refresh response decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("IdC credentials require client_id and client_secret")]
    MissingIdcSecrets,
}

#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub expires_at: OffsetDateTime,
}

/// HTTP client for the two upstream auth endpoints and the usage endpoint.
#[derive(Clone)]
pub struct RefreshClient {
    http: Client,
}

impl Default for RefreshClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshClient {
    pub fn new() -> Self {
        Self {
            http: Client::builder()
                .connect_timeout(std::time::Duration::from_secs(10))
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    pub async fn refresh_social(&self, refresh_token: &str) -> Result<RefreshedToken, RefreshError> {
        let body = SocialRefreshRequest {
            refresh_token: refresh_token.to_string(),
        };
        let resp = self
            .http
            .post(SOCIAL_REFRESH_URL)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;
        Self::decode_refresh(resp).await
    }

    pub async fn refresh_idc(
        &self,
        refresh_token: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<RefreshedToken, RefreshError> {
        if client_id.is_empty() || client_secret.is_empty() {
            return Err(RefreshError::MissingIdcSecrets);
        }
        let body = IdcRefreshRequest {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            grant_type: "refresh_token".to_string(),
            refresh_token: refresh_token.to_string(),
        };
        // Header preset mimicking the SSO OIDC SDK this endpoint expects.
        let resp = self
            .http
            .post(IDC_REFRESH_URL)
            .header("Content-Type", "application/json")
            .header("Host", "oidc.us-east-1.amazonaws.com")
            .header("Connection", "keep-alive")
            .header(
                "x-amz-user-agent",
                "aws-sdk-js/3.738.0 ua/2.1 os/other lang/js md/browser#unknown_unknown api/sso-oidc#3.738.0 m/E KiroIDE",
            )
            .header("Accept", "*/*")
            .header("Accept-Language", "*")
            .header("sec-fetch-mode", "cors")
            .header("User-Agent", "node")
            .header("Accept-Encoding", "br, gzip, deflate")
            .json(&body)
            .send()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;
        Self::decode_refresh(resp).await
    }

    /// Fetch the quota snapshot for a freshly-refreshed access token.
    pub async fn usage_limits(&self, access_token: &str) -> Result<UsageLimits, RefreshError> {
        let resp = self
            .http
            .post(USAGE_LIMITS_URL)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {access_token}"))
            .json(&serde_json::json!({ "origin": "AI_EDITOR" }))
            .send()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;
        if status != 200 {
            return Err(RefreshError::Status { status, body });
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn decode_refresh(resp: wreq::Response) -> Result<RefreshedToken, RefreshError> {
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;
        if status != 200 {
            return Err(RefreshError::Status { status, body });
        }
        let decoded: RefreshResponse = serde_json::from_str(&body)?;
        Ok(RefreshedToken {
            access_token: decoded.access_token,
            expires_at: OffsetDateTime::now_utc() + time::Duration::seconds(decoded.expires_in),
        })
    }
}
