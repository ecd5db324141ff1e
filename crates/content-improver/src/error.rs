use std::path::PathBuf;

use improver_common::assistant::AssistantClientError;
use improver_common::run::RunError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The content system or its configuration is missing ("not installed").
    #[error("content system not available: {0}")]
    NotAvailable(String),

    #[error("assistant transport error: {0}")]
    Transport(AssistantClientError),

    #[error("assistant run failed: {0}")]
    Assistant(String),

    #[error("assistant run timed out: {0}")]
    Timeout(String),

    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid content path: {0}")]
    InvalidPath(String),

    #[error("invalid field path: {0}")]
    InvalidFieldPath(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("batch {0} is closed and cannot change")]
    BatchClosed(String),

    #[error("backup {id} failed its checksum")]
    BackupCorrupt { id: String },
}

impl AppError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }

    /// Stable short name of the error class, used as the prefix of tool errors so callers can
    /// tell "not installed" apart from "call failed".
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotAvailable(_) => "not_available",
            Self::Transport(_) => "transport",
            Self::Assistant(_) => "assistant",
            Self::Timeout(_) => "timeout",
            Self::InvalidPath(_) | Self::InvalidFieldPath(_) | Self::NotFound(_) => {
                "invalid_request"
            }
            Self::BatchClosed(_) => "conflict",
            Self::Io { .. } | Self::Json { .. } | Self::BackupCorrupt { .. } => "storage",
        }
    }
}

impl From<RunError> for AppError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Transport(AssistantClientError::NotConfigured(setting)) => {
                Self::NotAvailable(format!("{setting} is not set"))
            }
            RunError::Transport(e) => Self::Transport(e),
            e @ RunError::Assistant { .. } => Self::Assistant(e.to_string()),
            e @ RunError::Timeout { .. } => Self::Timeout(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use improver_common::assistant::RunStatus;

    #[test]
    fn run_errors_map_to_distinct_kinds() {
        let timeout: AppError = RunError::Timeout {
            run_id: "run_1".into(),
            attempts: 3,
        }
        .into();
        assert_eq!(timeout.kind(), "timeout");

        let failed: AppError = RunError::Assistant {
            run_id: "run_1".into(),
            status: RunStatus::Failed,
            detail: "boom".into(),
        }
        .into();
        assert_eq!(failed.kind(), "assistant");

        let unconfigured: AppError =
            RunError::Transport(AssistantClientError::NotConfigured("OPENAI_API_KEY")).into();
        assert_eq!(unconfigured.kind(), "not_available");
    }
}
