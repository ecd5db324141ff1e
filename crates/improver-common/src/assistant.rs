/// HTTP client for the OpenAI Assistants (v2) thread/run protocol.
///
/// Only the pieces the content workflow needs are modelled: thread and run ids, run status
/// with the provider's error detail, and the text parts of thread messages. Everything else
/// in the provider's payloads is ignored on deserialization.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
pub use reqwest::StatusCode;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

const ASSISTANTS_BETA: &str = "assistants=v2";

#[derive(Clone, Debug)]
pub struct AssistantClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub assistant_id: Option<String>,
    pub request_timeout: Duration,
    pub max_error_body_bytes: usize,
}

impl AssistantClientConfig {
    pub fn from_env() -> Self {
        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let assistant_id = std::env::var("OPENAI_ASSISTANT_ID")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let request_timeout = std::env::var("OPENAI_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(30));

        let max_error_body_bytes = std::env::var("OPENAI_MAX_ERROR_BODY_BYTES")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(8 * 1024);

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            assistant_id,
            request_timeout,
            max_error_body_bytes,
        }
    }

    /// Names of required settings that are missing, empty when the client can run.
    pub fn missing_settings(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.api_key.is_none() {
            missing.push("OPENAI_API_KEY");
        }
        if self.assistant_id.is_none() {
            missing.push("OPENAI_ASSISTANT_ID");
        }
        missing
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AssistantClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid response JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("upstream returned error: status={status} message={message}")]
    Upstream { status: StatusCode, message: String },

    #[error("upstream returned non-JSON error: status={status} body={body}")]
    UpstreamBody { status: StatusCode, body: String },

    #[error("assistant client is not configured: missing {0}")]
    NotConfigured(&'static str),
}

impl AssistantClientError {
    /// Whether repeating the same request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            Self::Upstream { status, .. } | Self::UpstreamBody { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            Self::InvalidJson(_) | Self::NotConfigured(_) => false,
        }
    }
}

/// The five calls of the Assistants protocol the workflow drives.
///
/// `AssistantClient` is the HTTP implementation; tests provide scripted ones.
pub trait AssistantTransport: Send + Sync {
    fn create_thread(&self) -> BoxFuture<'_, Result<Thread, AssistantClientError>>;

    fn create_message<'a>(
        &'a self,
        thread_id: &'a str,
        content: &'a str,
    ) -> BoxFuture<'a, Result<ThreadMessage, AssistantClientError>>;

    fn create_run<'a>(&'a self, thread_id: &'a str)
        -> BoxFuture<'a, Result<Run, AssistantClientError>>;

    fn retrieve_run<'a>(
        &'a self,
        thread_id: &'a str,
        run_id: &'a str,
    ) -> BoxFuture<'a, Result<Run, AssistantClientError>>;

    /// Messages of a thread, newest first.
    fn list_messages<'a>(
        &'a self,
        thread_id: &'a str,
    ) -> BoxFuture<'a, Result<MessageList, AssistantClientError>>;
}

#[derive(Clone)]
pub struct AssistantClient {
    config: AssistantClientConfig,
    http: reqwest::Client,
}

impl AssistantClient {
    pub fn new(config: AssistantClientConfig) -> Result<Self, AssistantClientError> {
        let http = reqwest::Client::builder()
            .user_agent("content-improver")
            .build()?;
        Ok(Self { config, http })
    }

    fn authorized(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, AssistantClientError> {
        let key = self
            .config
            .api_key
            .as_deref()
            .ok_or(AssistantClientError::NotConfigured("OPENAI_API_KEY"))?;
        Ok(builder
            .bearer_auth(key)
            .header("OpenAI-Beta", ASSISTANTS_BETA)
            .timeout(self.config.request_timeout))
    }

    async fn parse_json_response<T: for<'de> Deserialize<'de>>(
        resp: reqwest::Response,
        max_error_body_bytes: usize,
    ) -> Result<T, AssistantClientError> {
        if resp.status().is_success() {
            let bytes = resp.bytes().await?;
            return Ok(serde_json::from_slice::<T>(&bytes)?);
        }
        Err(Self::to_upstream_error(resp, max_error_body_bytes).await)
    }

    async fn to_upstream_error(
        resp: reqwest::Response,
        max_error_body_bytes: usize,
    ) -> AssistantClientError {
        let status = resp.status();
        let body = read_limited_text(resp, max_error_body_bytes).await;
        if let Ok(parsed) = serde_json::from_str::<ErrorEnvelope>(&body) {
            let message = parsed
                .error
                .message
                .unwrap_or_else(|| "unknown upstream error".to_string());
            return AssistantClientError::Upstream { status, message };
        }
        AssistantClientError::UpstreamBody { status, body }
    }
}

impl AssistantTransport for AssistantClient {
    fn create_thread(&self) -> BoxFuture<'_, Result<Thread, AssistantClientError>> {
        Box::pin(async move {
            let url = format!("{}/threads", self.config.base_url);
            let resp = self
                .authorized(self.http.post(&url))?
                .json(&serde_json::json!({}))
                .send()
                .await?;
            Self::parse_json_response(resp, self.config.max_error_body_bytes).await
        })
    }

    fn create_message<'a>(
        &'a self,
        thread_id: &'a str,
        content: &'a str,
    ) -> BoxFuture<'a, Result<ThreadMessage, AssistantClientError>> {
        Box::pin(async move {
            let url = format!("{}/threads/{thread_id}/messages", self.config.base_url);
            let body = CreateMessageRequest {
                role: "user",
                content,
            };
            let resp = self
                .authorized(self.http.post(&url))?
                .json(&body)
                .send()
                .await?;
            Self::parse_json_response(resp, self.config.max_error_body_bytes).await
        })
    }

    fn create_run<'a>(
        &'a self,
        thread_id: &'a str,
    ) -> BoxFuture<'a, Result<Run, AssistantClientError>> {
        Box::pin(async move {
            let assistant_id = self
                .config
                .assistant_id
                .as_deref()
                .ok_or(AssistantClientError::NotConfigured("OPENAI_ASSISTANT_ID"))?;
            let url = format!("{}/threads/{thread_id}/runs", self.config.base_url);
            let resp = self
                .authorized(self.http.post(&url))?
                .json(&CreateRunRequest { assistant_id })
                .send()
                .await?;
            Self::parse_json_response(resp, self.config.max_error_body_bytes).await
        })
    }

    fn retrieve_run<'a>(
        &'a self,
        thread_id: &'a str,
        run_id: &'a str,
    ) -> BoxFuture<'a, Result<Run, AssistantClientError>> {
        Box::pin(async move {
            let url = format!("{}/threads/{thread_id}/runs/{run_id}", self.config.base_url);
            let resp = self.authorized(self.http.get(&url))?.send().await?;
            Self::parse_json_response(resp, self.config.max_error_body_bytes).await
        })
    }

    fn list_messages<'a>(
        &'a self,
        thread_id: &'a str,
    ) -> BoxFuture<'a, Result<MessageList, AssistantClientError>> {
        Box::pin(async move {
            let url = format!("{}/threads/{thread_id}/messages", self.config.base_url);
            let resp = self
                .authorized(self.http.get(&url))?
                .query(&[("order", "desc"), ("limit", "20")])
                .send()
                .await?;
            Self::parse_json_response(resp, self.config.max_error_body_bytes).await
        })
    }
}

/// Capped exponential backoff with up to 25% jitter.
pub fn backoff_delay(initial: Duration, max: Duration, exponent: u32) -> Duration {
    let mult = 1u128.checked_shl(exponent).unwrap_or(u128::MAX);
    let base_ms = initial.as_millis().saturating_mul(mult);
    let capped_ms = std::cmp::min(base_ms, max.as_millis()) as u64;
    let jitter_cap = std::cmp::max(1, capped_ms / 4);
    let jitter_ms = pseudo_jitter_ms(jitter_cap);
    Duration::from_millis(capped_ms.saturating_add(jitter_ms))
}

fn pseudo_jitter_ms(max_inclusive: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    let nanos = now.subsec_nanos() as u64;
    nanos % (max_inclusive + 1)
}

async fn read_limited_text(resp: reqwest::Response, max_bytes: usize) -> String {
    match resp.bytes().await {
        Ok(mut b) => {
            if b.len() > max_bytes {
                b.truncate(max_bytes);
            }
            String::from_utf8_lossy(&b).to_string()
        }
        Err(e) => {
            warn!(error = %e, "failed to read upstream error body");
            "<failed to read error body>".to_string()
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateMessageRequest<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateRunRequest<'a> {
    assistant_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorObject,
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thread {
    pub id: String,
}

/// Run lifecycle as reported by the provider.
///
/// Values the provider adds later deserialize as `Other` and are polled like `InProgress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Completed,
    Failed,
    Expired,
    Cancelled,
    Incomplete,
    #[serde(other)]
    Other,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Expired | Self::Cancelled | Self::Incomplete
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub last_error: Option<RunLastError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunLastError {
    pub code: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageList {
    pub data: Vec<ThreadMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadMessage {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub content: Vec<MessageContent>,
}

impl ThreadMessage {
    /// Concatenated text parts; non-text parts (images, files) are skipped.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                MessageContent::Text { text } => Some(text.value.as_str()),
                MessageContent::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: TextContent },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextContent {
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_accepts_unknown_values() {
        let run: Run =
            serde_json::from_str(r#"{"id":"run_1","status":"something_new"}"#).unwrap();
        assert_eq!(run.status, RunStatus::Other);
        assert!(!run.status.is_terminal());

        let run: Run = serde_json::from_value(serde_json::json!({
            "id": "run_1",
            "status": "failed",
            "last_error": {"code": "rate_limit_exceeded", "message": "quota"}
        }))
        .unwrap();
        assert!(run.status.is_terminal());
        assert_eq!(run.last_error.unwrap().message.as_deref(), Some("quota"));
    }

    #[test]
    fn message_text_skips_non_text_parts() {
        let msg: ThreadMessage = serde_json::from_str(
            r#"{"id":"msg_1","role":"assistant","content":[
                {"type":"image_file","image_file":{"file_id":"f"}},
                {"type":"text","text":{"value":"{\"a\":1}","annotations":[]}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(msg.text(), r#"{"a":1}"#);
    }

    #[test]
    fn upstream_retry_classification() {
        let throttled = AssistantClientError::Upstream {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "slow down".into(),
        };
        let bad_request = AssistantClientError::UpstreamBody {
            status: StatusCode::BAD_REQUEST,
            body: "nope".into(),
        };
        assert!(throttled.is_retryable());
        assert!(!bad_request.is_retryable());
        assert!(!AssistantClientError::NotConfigured("OPENAI_API_KEY").is_retryable());
    }

    #[test]
    fn backoff_is_capped() {
        let d = backoff_delay(Duration::from_millis(100), Duration::from_millis(1_000), 10);
        assert!(d >= Duration::from_millis(1_000));
        assert!(d <= Duration::from_millis(1_250));
    }
}
