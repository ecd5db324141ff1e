/// Improvement store: one JSON file per staged batch, plus raw replies kept for manual review.
///
/// Layout under the data dir:
/// - `improvements/{batch_id}.json`: serialized `ImprovementBatch`
/// - `manual/{id}.txt`: assistant replies that were not valid JSON
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use improver_common::ids::{new_short_id, now_millis};

use crate::error::AppError;
use crate::model::{BatchStatus, BatchSummary, Improvement, ImprovementBatch, ItemState};
use crate::parser::Interpretation;

pub struct ImprovementStore {
    batches_dir: PathBuf,
    manual_dir: PathBuf,
}

impl ImprovementStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            batches_dir: data_dir.join("improvements"),
            manual_dir: data_dir.join("manual"),
        }
    }

    fn batch_path(&self, id: &str) -> PathBuf {
        self.batches_dir.join(format!("{id}.json"))
    }

    /// Build and persist a pending batch from an interpreted reply for `file`.
    pub async fn stage(
        &self,
        file: &str,
        raw_response: &str,
        interpretation: Interpretation,
    ) -> Result<ImprovementBatch, AppError> {
        let created_at_ms = now_millis();
        let id = format!("{created_at_ms}-{}", new_short_id());
        let improvements: Vec<Improvement> = interpretation
            .changes
            .into_iter()
            .enumerate()
            .map(|(i, change)| Improvement {
                id: format!("{id}-{i}"),
                batch_id: id.clone(),
                file: file.to_string(),
                field: change.field.to_string(),
                original: change.original,
                improved: change.improved,
                reasoning: change.reasoning,
                confidence: change.confidence,
                state: ItemState::Pending,
                resolved_at_ms: None,
            })
            .collect();

        let batch = ImprovementBatch {
            summary: BatchSummary {
                count: improvements.len(),
                quality_score: interpretation.quality_score,
                brand_alignment: interpretation.brand_alignment,
                dropped: interpretation.dropped,
            },
            id,
            sources: vec![file.to_string()],
            created_at_ms,
            status: BatchStatus::Pending,
            raw_response: raw_response.to_string(),
            improvements,
            closed_at_ms: None,
        };
        self.save_new(&batch).await?;
        info!(batch_id = %batch.id, file, count = batch.summary.count, "improvement batch staged");
        Ok(batch)
    }

    async fn save_new(&self, batch: &ImprovementBatch) -> Result<(), AppError> {
        tokio::fs::create_dir_all(&self.batches_dir)
            .await
            .map_err(|e| AppError::io(&self.batches_dir, e))?;
        self.write(batch).await
    }

    async fn write(&self, batch: &ImprovementBatch) -> Result<(), AppError> {
        let path = self.batch_path(&batch.id);
        let json = serde_json::to_vec_pretty(batch).map_err(|e| AppError::json(&path, e))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| AppError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| AppError::io(&path, e))
    }

    /// Persist changes to a batch that was pending when it was loaded. Closed batches on disk
    /// are never rewritten.
    pub async fn update(&self, batch: &ImprovementBatch) -> Result<(), AppError> {
        let on_disk = self.get(&batch.id).await?;
        if on_disk.status != BatchStatus::Pending {
            return Err(AppError::BatchClosed(batch.id.clone()));
        }
        self.write(batch).await
    }

    pub async fn get(&self, id: &str) -> Result<ImprovementBatch, AppError> {
        let path = self.batch_path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::NotFound(format!("batch {id}")));
            }
            Err(e) => return Err(AppError::io(path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| AppError::json(path, e))
    }

    /// All batches, oldest first. Unreadable batch files are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<ImprovementBatch>, AppError> {
        let mut entries = match tokio::fs::read_dir(&self.batches_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::io(&self.batches_dir, e)),
        };

        let mut batches = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::io(&self.batches_dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read(&path)
                .await
                .map_err(|e| AppError::io(&path, e))
                .and_then(|bytes| {
                    serde_json::from_slice::<ImprovementBatch>(&bytes)
                        .map_err(|e| AppError::json(&path, e))
                });
            match parsed {
                Ok(batch) => batches.push(batch),
                Err(e) => warn!(error = %e, "skipping unreadable improvement batch"),
            }
        }
        batches.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(batches)
    }

    pub async fn pending(&self) -> Result<Vec<ImprovementBatch>, AppError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|b| b.status == BatchStatus::Pending)
            .collect())
    }

    /// Keep a reply that failed to parse, for manual handling. Returns its id.
    pub async fn save_manual(&self, file: &str, raw: &str) -> Result<String, AppError> {
        tokio::fs::create_dir_all(&self.manual_dir)
            .await
            .map_err(|e| AppError::io(&self.manual_dir, e))?;
        let id = format!("{}-{}", now_millis(), new_short_id());
        let path = self.manual_dir.join(format!("{id}.txt"));
        let body = format!("# source: {file}\n{raw}");
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| AppError::io(&path, e))?;
        warn!(manual_id = %id, file, "assistant reply kept for manual review");
        Ok(id)
    }
}
