use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;

use kirogate_auth::{kiro_amz_user_agent, kiro_user_agent, FingerprintManager, COMPLETION_URL};
use kirogate_common::Settings;
use kirogate_pool::PoolError;
use kirogate_protocol::anthropic::MessagesRequest;
use kirogate_translate::{build_codewhisperer_request, BuildError, BuildOptions};

use crate::lifecycle::RequestLifecycle;
use crate::limiter::{PerTokenLimiters, SemaphoreGuard, SemaphoreRegistry};

/// Upstream statuses that trigger credential failover.
const RETRYABLE_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    NoToken(#[from] PoolError),
    #[error("upstream rejected the access token")]
    UpstreamForbidden { body: String },
    #[error("upstream error: status {status}")]
    UpstreamError { status: u16, body: String },
    #[error("upstream aborted: content length exceeded")]
    LengthExceeded,
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("all retries exhausted: {message}")]
    Exhausted {
        last_status: Option<u16>,
        message: String,
    },
}

/// A successful upstream exchange. The semaphore guards ride along so the
/// concurrency slots stay held until the response body is fully consumed
/// (or dropped on cancellation).
pub struct UpstreamResponse {
    pub response: wreq::Response,
    pub attempts_used: u32,
    _guards: Vec<SemaphoreGuard>,
}

/// Sends translated requests upstream with credential failover. The
/// translator runs inside the retry loop on purpose: the user-agent
/// fingerprint is derived from the active credential, so a token switch
/// requires a rebuilt request.
pub struct UpstreamExecutor {
    http: wreq::Client,
    fingerprints: Arc<FingerprintManager>,
    settings: Arc<ArcSwap<Settings>>,
    token_limiters: PerTokenLimiters,
    token_semaphores: SemaphoreRegistry,
    group_semaphores: SemaphoreRegistry,
}

impl UpstreamExecutor {
    pub fn new(settings: Arc<ArcSwap<Settings>>, fingerprints: Arc<FingerprintManager>) -> Self {
        Self {
            http: wreq::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .read_timeout(Duration::from_secs(300))
                .build()
                .unwrap_or_default(),
            fingerprints,
            settings,
            token_limiters: PerTokenLimiters::new(),
            token_semaphores: SemaphoreRegistry::new(),
            group_semaphores: SemaphoreRegistry::new(),
        }
    }

    pub async fn execute(
        &self,
        request: &MessagesRequest,
        build_opts: &BuildOptions,
        lifecycle: &mut RequestLifecycle,
        is_stream: bool,
    ) -> Result<UpstreamResponse, ExecuteError> {
        let max_retries = self.settings.load().max_retries;
        let mut last_status: Option<u16> = None;
        let mut last_message = String::from("upstream unavailable");

        for attempt in 0..=max_retries {
            if attempt > 0 {
                tracing::info!(attempt, max_retries, "retrying upstream request");
            }
            let Some(token) = lifecycle.token().cloned() else {
                return Err(ExecuteError::Exhausted {
                    last_status,
                    message: "no credential attached to lifecycle".to_string(),
                });
            };

            // Rebuilt every attempt: headers carry a token-derived
            // fingerprint.
            let cw_request = build_codewhisperer_request(request, build_opts)?;
            let body = serde_json::to_vec(&cw_request)
                .map_err(|err| ExecuteError::Transport(err.to_string()))?;

            let settings = self.settings.load();
            let group_guard = self
                .group_semaphores
                .acquire(lifecycle.group(), settings.group_max_concurrent)
                .await;
            let token_guard = self
                .token_semaphores
                .acquire(&token.refresh_token, settings.token_max_concurrent)
                .await;
            self.token_limiters
                .acquire(
                    &token.refresh_token,
                    settings.token_rate_limit_qps,
                    settings.token_rate_limit_burst,
                )
                .await;

            let send = self.send_once(&token.access_token, &token.refresh_token, body, is_stream);
            let outcome = tokio::time::timeout(
                Duration::from_secs(settings.request_timeout_sec.max(1)),
                send,
            )
            .await;

            let response = match outcome {
                Err(_) => {
                    drop(token_guard);
                    drop(group_guard);
                    last_message = "upstream request timed out".to_string();
                    match lifecycle.switch_token().await {
                        Ok(_) => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(Err(err)) => {
                    drop(token_guard);
                    drop(group_guard);
                    last_message = err.to_string();
                    tracing::warn!(error = %last_message, "upstream send failed, switching credential");
                    match lifecycle.switch_token().await {
                        Ok(_) => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(Ok(response)) => response,
            };

            let status = response.status().as_u16();
            if status == 200 {
                return Ok(UpstreamResponse {
                    response,
                    attempts_used: attempt + 1,
                    _guards: vec![token_guard, group_guard],
                });
            }

            if is_retryable_status(status) {
                drop(response);
                drop(token_guard);
                drop(group_guard);
                last_status = Some(status);
                last_message = format!("retryable status {status}");
                tracing::warn!(status, attempt, "retryable upstream status, switching credential");
                match lifecycle.switch_token().await {
                    Ok(_) => continue,
                    Err(err) => return Err(err.into()),
                }
            }

            // Terminal upstream error: release slots, read the body for the
            // error envelope.
            let body_text = response.text().await.unwrap_or_default();
            drop(token_guard);
            drop(group_guard);

            if status == 403 {
                return Err(ExecuteError::UpstreamForbidden { body: body_text });
            }
            if body_text.contains("CONTENT_LENGTH_EXCEEDS")
                || body_text.contains("ContentLengthExceededException")
            {
                return Err(ExecuteError::LengthExceeded);
            }
            return Err(ExecuteError::UpstreamError {
                status,
                body: body_text,
            });
        }

        Err(ExecuteError::Exhausted {
            last_status,
            message: last_message,
        })
    }

    async fn send_once(
        &self,
        access_token: &str,
        refresh_token: &str,
        body: Vec<u8>,
        is_stream: bool,
    ) -> Result<wreq::Response, wreq::Error> {
        let fingerprint = self.fingerprints.fingerprint_for(refresh_token);
        let mut builder = self
            .http
            .post(COMPLETION_URL)
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Content-Type", "application/json")
            .header("User-Agent", kiro_user_agent(&fingerprint))
            .header("x-amz-user-agent", kiro_amz_user_agent(&fingerprint))
            .header("x-amzn-kiro-agent-mode", "vibe")
            .header("x-amzn-codewhisperer-optout", "true")
            .header("amz-sdk-invocation-id", uuid::Uuid::new_v4().to_string())
            .header("amz-sdk-request", "attempt=1; max=3");
        if is_stream {
            builder = builder.header("Accept", "text/event-stream");
        }
        builder.body(Bytes::from(body)).send().await
    }
}
