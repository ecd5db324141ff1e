use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::WorkflowState;

/// Lifecycle of a staged batch. Moves forward only: `pending` to `applied` or `rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Applied,
    Rejected,
}

/// Lifecycle of a single improvement inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    Applied,
    /// The live value no longer matched `original` at apply time.
    Stale,
    Rejected,
}

/// A single proposed field-level change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Improvement {
    /// `{batch_id}-{index}`
    pub id: String,
    pub batch_id: String,
    /// Content file path relative to the content root.
    pub file: String,
    /// Field path inside the content document, e.g. `hero.title` or `features[1].body`.
    pub field: String,
    pub original: Value,
    pub improved: Value,
    pub reasoning: Option<String>,
    /// Assistant-reported confidence in `[0, 1]`.
    pub confidence: Option<f64>,
    pub state: ItemState,
    pub resolved_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BatchSummary {
    pub count: usize,
    /// Overall quality score in `[0, 100]` when the assistant reported one.
    pub quality_score: Option<u8>,
    /// Qualitative brand-alignment label when the assistant reported one.
    pub brand_alignment: Option<String>,
    /// Proposed changes dropped during validation.
    pub dropped: usize,
}

/// One assistant interaction's output, staged for review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ImprovementBatch {
    pub id: String,
    pub sources: Vec<String>,
    pub created_at_ms: u64,
    pub status: BatchStatus,
    pub raw_response: String,
    pub improvements: Vec<Improvement>,
    pub summary: BatchSummary,
    pub closed_at_ms: Option<u64>,
}

impl ImprovementBatch {
    pub fn pending_items(&self) -> impl Iterator<Item = &Improvement> {
        self.improvements
            .iter()
            .filter(|i| i.state == ItemState::Pending)
    }

    /// Close the batch once nothing is pending: `rejected` if every item was rejected,
    /// otherwise `applied`. Returns whether the status changed.
    pub fn settle(&mut self, now_ms: u64) -> bool {
        if self.status != BatchStatus::Pending || self.pending_items().next().is_some() {
            return false;
        }
        let all_rejected = self
            .improvements
            .iter()
            .all(|i| i.state == ItemState::Rejected);
        self.status = if all_rejected && !self.improvements.is_empty() {
            BatchStatus::Rejected
        } else {
            BatchStatus::Applied
        };
        self.closed_at_ms = Some(now_ms);
        true
    }
}

// --- Analysis ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AnalysisIssue {
    pub field: Option<String>,
    pub issue: String,
    pub suggestion: Option<String>,
    pub severity: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FileAnalysis {
    pub file: String,
    pub score: Option<u8>,
    pub brand_alignment: Option<String>,
    pub issues: Vec<AnalysisIssue>,
    /// Raw reply kept when it was not valid JSON.
    pub raw_text: Option<String>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AnalysisReport {
    pub files: Vec<FileAnalysis>,
    pub analyzed: usize,
    pub failed: usize,
    pub average_score: Option<f64>,
    pub total_issues: usize,
}

// --- Improve ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImproveOutcome {
    Staged {
        batch_id: String,
        count: usize,
        dropped: usize,
    },
    NoChanges {
        dropped: usize,
    },
    /// The reply was not valid JSON; kept verbatim for manual handling.
    TextOnly {
        manual_id: String,
        raw_text: String,
    },
    Failed {
        error_kind: String,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FileImproveResult {
    pub file: String,
    pub outcome: ImproveOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ImproveReport {
    pub success: bool,
    pub batches_created: usize,
    pub improvements_staged: usize,
    pub files: Vec<FileImproveResult>,
}

// --- Review / apply ---

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PendingImprovements {
    pub count: usize,
    pub improvements: Vec<Improvement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ItemFailure {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ApplyReport {
    /// True when every targeted improvement was applied.
    pub success: bool,
    pub applied: usize,
    /// Stale, unknown and errored items.
    pub failed: usize,
    /// Pending improvements left after this call.
    pub remaining: usize,
    pub applied_ids: Vec<String>,
    pub stale: Vec<String>,
    pub errors: Vec<ItemFailure>,
    pub backups: Vec<BackupRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RejectReport {
    pub rejected: usize,
    pub failed: Vec<ItemFailure>,
    pub remaining: usize,
}

// --- Read accessors ---

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowStatus {
    pub available: bool,
    pub missing: Vec<String>,
    pub state: WorkflowState,
    pub pending_improvements: usize,
    pub pending_batches: usize,
    pub tracked_files: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ContentFileInfo {
    pub path: String,
    pub exists: bool,
    pub bytes: Option<u64>,
    pub modified_unix_secs: Option<u64>,
    pub sha256: Option<String>,
    pub top_level_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ContentFiles {
    pub root: String,
    pub files: Vec<ContentFileInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ImprovementHistory {
    pub batches: Vec<ImprovementBatch>,
}

// --- Backups ---

/// Sidecar metadata of a backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BackupRecord {
    /// `{slug}/{timestamp_ms}-{n}`
    pub id: String,
    /// Content file path relative to the content root.
    pub path: String,
    pub created_at_ms: u64,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BackupList {
    pub backups: Vec<BackupRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RestoreReport {
    pub restored: bool,
    pub backup: BackupRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, state: ItemState) -> Improvement {
        Improvement {
            id: id.to_string(),
            batch_id: "b".into(),
            file: "home.json".into(),
            field: "headline".into(),
            original: Value::from("Old"),
            improved: Value::from("New"),
            reasoning: None,
            confidence: None,
            state,
            resolved_at_ms: None,
        }
    }

    fn batch(items: Vec<Improvement>) -> ImprovementBatch {
        ImprovementBatch {
            id: "b".into(),
            sources: vec!["home.json".into()],
            created_at_ms: 1,
            status: BatchStatus::Pending,
            raw_response: String::new(),
            summary: BatchSummary {
                count: items.len(),
                ..BatchSummary::default()
            },
            improvements: items,
            closed_at_ms: None,
        }
    }

    #[test]
    fn settle_waits_for_pending_items() {
        let mut b = batch(vec![item("b-0", ItemState::Applied), item("b-1", ItemState::Pending)]);
        assert!(!b.settle(5));
        assert_eq!(b.status, BatchStatus::Pending);
    }

    #[test]
    fn settle_marks_applied_when_any_item_was_processed() {
        let mut b = batch(vec![item("b-0", ItemState::Stale), item("b-1", ItemState::Rejected)]);
        assert!(b.settle(5));
        assert_eq!(b.status, BatchStatus::Applied);
        assert_eq!(b.closed_at_ms, Some(5));
    }

    #[test]
    fn settle_marks_rejected_when_everything_was_rejected() {
        let mut b = batch(vec![item("b-0", ItemState::Rejected)]);
        assert!(b.settle(5));
        assert_eq!(b.status, BatchStatus::Rejected);

        // closed batches never reopen or change again
        b.improvements[0].state = ItemState::Pending;
        assert!(!b.settle(9));
        assert_eq!(b.status, BatchStatus::Rejected);
    }
}
