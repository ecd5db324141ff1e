use std::path::{Path, PathBuf};
use std::time::Duration;

use improver_common::assistant::AssistantClientConfig;

/// Application configuration loaded explicitly from environment variables.
///
/// Loading never fails: missing required values are reported by
/// [`Config::missing_settings`] and surface as `NotAvailable` when a workflow operation runs,
/// so the server can start and report "not installed".
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the site's JSON content files.
    pub content_root: Option<PathBuf>,
    /// Explicit list of tracked content files, relative to `content_root`. `None` tracks every
    /// `*.json` file under the root.
    pub content_files: Option<Vec<String>>,
    /// Directory for improvement batches, backups, workflow state and manual-review replies.
    pub data_dir: PathBuf,
    /// Key of the persisted workflow state record.
    pub workflow_id: String,
    /// Redis connection URL. `None` keeps workflow state on disk only.
    pub redis_url: Option<String>,
    /// Address for the streamable HTTP transport. `None` serves on stdio.
    pub http_bind: Option<String>,
    pub assistant: AssistantClientConfig,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub submit_retries: u32,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
}

impl Config {
    /// Required (checked when a workflow operation runs):
    /// - `CONTENT_ROOT`: directory of JSON content files
    /// - `OPENAI_API_KEY`, `OPENAI_ASSISTANT_ID`
    ///
    /// Optional:
    /// - `CONTENT_FILES`: comma-separated tracked files relative to `CONTENT_ROOT`
    /// - `IMPROVER_DATA_DIR` (default `.content-improver`)
    /// - `WORKFLOW_ID` (default `default`)
    /// - `REDIS_URL`, `HTTP_BIND`
    /// - `ASSISTANT_POLL_INTERVAL_MS` (2000), `ASSISTANT_MAX_POLL_ATTEMPTS` (30)
    /// - `ASSISTANT_SUBMIT_RETRIES` (2), `ASSISTANT_RETRY_INITIAL_MS` (500),
    ///   `ASSISTANT_RETRY_MAX_MS` (5000)
    pub fn from_env() -> Self {
        let content_root = non_empty_var("CONTENT_ROOT").map(PathBuf::from);

        let content_files = non_empty_var("CONTENT_FILES").map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        });

        let data_dir = non_empty_var("IMPROVER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".content-improver"));

        let workflow_id = non_empty_var("WORKFLOW_ID").unwrap_or_else(|| "default".to_string());

        let poll_interval = parsed_var::<u64>("ASSISTANT_POLL_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_millis(2_000));

        let max_poll_attempts = parsed_var::<u32>("ASSISTANT_MAX_POLL_ATTEMPTS")
            .filter(|&n| n > 0)
            .unwrap_or(30);

        let submit_retries = parsed_var::<u32>("ASSISTANT_SUBMIT_RETRIES").unwrap_or(2);

        let retry_initial_backoff = parsed_var::<u64>("ASSISTANT_RETRY_INITIAL_MS")
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_millis(500));

        let retry_max_backoff = parsed_var::<u64>("ASSISTANT_RETRY_MAX_MS")
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_millis(5_000));

        Self {
            content_root,
            content_files,
            data_dir,
            workflow_id,
            redis_url: non_empty_var("REDIS_URL"),
            http_bind: non_empty_var("HTTP_BIND"),
            assistant: AssistantClientConfig::from_env(),
            poll_interval,
            max_poll_attempts,
            submit_retries,
            retry_initial_backoff,
            retry_max_backoff,
        }
    }

    /// A configuration for a content root and data dir with every other value defaulted.
    pub fn for_paths(content_root: impl AsRef<Path>, data_dir: impl AsRef<Path>) -> Self {
        Self {
            content_root: Some(content_root.as_ref().to_path_buf()),
            content_files: None,
            data_dir: data_dir.as_ref().to_path_buf(),
            workflow_id: "default".to_string(),
            redis_url: None,
            http_bind: None,
            assistant: AssistantClientConfig {
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: None,
                assistant_id: None,
                request_timeout: Duration::from_secs(30),
                max_error_body_bytes: 8 * 1024,
            },
            poll_interval: Duration::from_millis(2_000),
            max_poll_attempts: 30,
            submit_retries: 2,
            retry_initial_backoff: Duration::from_millis(500),
            retry_max_backoff: Duration::from_millis(5_000),
        }
    }

    /// Names of required settings that are missing.
    pub fn missing_settings(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.content_root.is_none() {
            missing.push("CONTENT_ROOT");
        }
        missing.extend(self.assistant.missing_settings());
        missing
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn for_paths_reports_missing_assistant_settings() {
        let config = Config::for_paths("/srv/content", "/srv/data");
        assert_eq!(
            config.missing_settings(),
            vec!["OPENAI_API_KEY", "OPENAI_ASSISTANT_ID"]
        );
        assert_eq!(config.max_poll_attempts, 30);
    }
}
