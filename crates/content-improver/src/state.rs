/// Persisted workflow state, keyed by workflow id.
///
/// The on-disk record under `state/{workflow_id}.json` is authoritative. When Redis is
/// configured the record is mirrored to `content_improver:v1:workflow:{id}` and read from
/// there first, so status queries from separate requests or processes agree.
use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use improver_common::ids::now_millis;
use improver_common::redis::RedisCache;

use crate::error::AppError;

const KEY_PREFIX: &str = "content_improver:v1:workflow:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Analyzing,
    ImprovementsPending,
    Applying,
    ApplyPartiallyFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AnalysisSnapshot {
    pub at_ms: u64,
    pub analyzed: usize,
    pub failed: usize,
    pub average_score: Option<f64>,
    pub total_issues: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ImproveSnapshot {
    pub at_ms: u64,
    pub batches_created: usize,
    pub improvements_staged: usize,
    pub text_only: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ApplySnapshot {
    pub at_ms: u64,
    pub applied: usize,
    pub failed: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub stage: Stage,
    pub updated_at_ms: u64,
    pub last_analysis: Option<AnalysisSnapshot>,
    pub last_improve: Option<ImproveSnapshot>,
    pub last_apply: Option<ApplySnapshot>,
    pub last_error: Option<String>,
}

impl WorkflowState {
    pub fn new(workflow_id: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            stage: Stage::Idle,
            updated_at_ms: 0,
            last_analysis: None,
            last_improve: None,
            last_apply: None,
            last_error: None,
        }
    }
}

pub struct WorkflowStateStore {
    dir: PathBuf,
    redis: RedisCache,
}

impl WorkflowStateStore {
    pub fn new(data_dir: &Path, redis: RedisCache) -> Self {
        Self {
            dir: data_dir.join("state"),
            redis,
        }
    }

    fn path(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_safe(workflow_id)))
    }

    /// The stored state, or a fresh idle state when none exists.
    pub async fn load(&self, workflow_id: &str) -> Result<WorkflowState, AppError> {
        if let Some(raw) = self.redis.get(&redis_key(workflow_id)).await {
            match serde_json::from_str::<WorkflowState>(&raw) {
                Ok(state) => return Ok(state),
                Err(e) => {
                    warn!(error = %e, workflow_id, "ignoring unreadable workflow state in redis")
                }
            }
        }

        let path = self.path(workflow_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| AppError::json(path, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(WorkflowState::new(workflow_id))
            }
            Err(e) => Err(AppError::io(path, e)),
        }
    }

    /// Stamp and persist `state`.
    pub async fn save(&self, state: &mut WorkflowState) -> Result<(), AppError> {
        state.updated_at_ms = now_millis();
        let path = self.path(&state.workflow_id);
        let json = serde_json::to_vec_pretty(state).map_err(|e| AppError::json(&path, e))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AppError::io(&self.dir, e))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| AppError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| AppError::io(&path, e))?;

        if self.redis.is_configured() {
            let raw = String::from_utf8_lossy(&json);
            self.redis
                .set_with_ttl(&redis_key(&state.workflow_id), &raw, 0)
                .await;
        }
        Ok(())
    }
}

fn redis_key(workflow_id: &str) -> String {
    format!("{KEY_PREFIX}{workflow_id}")
}

fn file_safe(workflow_id: &str) -> String {
    workflow_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_state_loads_as_idle() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkflowStateStore::new(dir.path(), RedisCache::disabled());
        let state = store.load("site").await.unwrap();
        assert_eq!(state.stage, Stage::Idle);
        assert_eq!(state.workflow_id, "site");
    }

    #[tokio::test]
    async fn state_is_shared_between_store_instances() {
        let dir = tempfile::tempdir().unwrap();
        let writer = WorkflowStateStore::new(dir.path(), RedisCache::disabled());
        let mut state = WorkflowState::new("site");
        state.stage = Stage::ImprovementsPending;
        state.last_apply = Some(ApplySnapshot {
            at_ms: 1,
            applied: 2,
            failed: 1,
            remaining: 0,
        });
        writer.save(&mut state).await.unwrap();
        assert!(state.updated_at_ms > 0);

        let reader = WorkflowStateStore::new(dir.path(), RedisCache::disabled());
        assert_eq!(reader.load("site").await.unwrap(), state);
        assert_eq!(reader.load("other").await.unwrap().stage, Stage::Idle);
    }

    #[test]
    fn workflow_ids_are_file_safe() {
        assert_eq!(file_safe("../evil id"), "___evil_id");
    }
}
