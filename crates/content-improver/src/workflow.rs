/// Workflow orchestrator: analyze, improve, review, apply.
///
/// Bulk operations never abort on a single file or item. Per-file assistant failures and
/// per-item stale or I/O failures are collected into the returned report, and partial progress
/// is persisted. Only "content system not available" is raised before any work starts.
///
/// Concurrent applies against the same content file are not serialized; the per-field stale
/// check is the only guard and the last write wins.
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use improver_common::assistant::{backoff_delay, AssistantTransport};
use improver_common::ids::now_millis;
use improver_common::redis::RedisCache;
use improver_common::run::{AssistantRunner, RunError, RunHandle, Sleeper};

use crate::backup::BackupManager;
use crate::config::Config;
use crate::content::ContentStore;
use crate::error::AppError;
use crate::field_path::FieldPath;
use crate::improvements::ImprovementStore;
use crate::model::{
    AnalysisReport, ApplyReport, BackupList, ContentFiles, FileAnalysis, FileImproveResult,
    ImproveOutcome, ImproveReport, ImprovementBatch, ImprovementHistory, ItemFailure, ItemState,
    PendingImprovements, RejectReport, RestoreReport, WorkflowStatus,
};
use crate::parser::{self, ParsedReply};
use crate::prompts;
use crate::state::{
    AnalysisSnapshot, ApplySnapshot, ImproveSnapshot, Stage, WorkflowState, WorkflowStateStore,
};

pub struct Workflow {
    config: Config,
    content: ContentStore,
    improvements: ImprovementStore,
    backups: BackupManager,
    state: WorkflowStateStore,
    runner: AssistantRunner<dyn AssistantTransport>,
}

impl Workflow {
    pub fn new(
        config: Config,
        transport: Arc<dyn AssistantTransport>,
        sleeper: Arc<dyn Sleeper>,
        redis: RedisCache,
    ) -> Self {
        let content = ContentStore::new(
            config.content_root.clone().unwrap_or_default(),
            config.content_files.clone(),
            Some(config.data_dir.clone()),
        );
        Self {
            improvements: ImprovementStore::new(&config.data_dir),
            backups: BackupManager::new(&config.data_dir, content.clone()),
            state: WorkflowStateStore::new(&config.data_dir, redis),
            runner: AssistantRunner::new(transport, sleeper),
            content,
            config,
        }
    }

    // --- availability ---

    fn require_content_root(&self) -> Result<(), AppError> {
        if self.config.content_root.is_none() {
            return Err(AppError::NotAvailable("CONTENT_ROOT is not set".to_string()));
        }
        if !self.content.root().is_dir() {
            return Err(AppError::NotAvailable(format!(
                "content root {} does not exist",
                self.content.root().display()
            )));
        }
        Ok(())
    }

    /// Check configuration and content before talking to the assistant. Returns the tracked
    /// files.
    fn require_pipeline(&self) -> Result<Vec<String>, AppError> {
        let missing = self.config.missing_settings();
        if !missing.is_empty() {
            return Err(AppError::NotAvailable(format!(
                "missing settings: {}",
                missing.join(", ")
            )));
        }
        self.require_content_root()?;
        self.content.ensure_available()
    }

    // --- assistant calls ---

    async fn ask(&self, payload: &Value, instructions: &str) -> Result<String, AppError> {
        let handle = self.submit_with_retry(payload, instructions).await?;
        let reply = self
            .runner
            .await_completion(&handle, self.config.poll_interval, self.config.max_poll_attempts)
            .await?;
        Ok(reply)
    }

    async fn submit_with_retry(
        &self,
        payload: &Value,
        instructions: &str,
    ) -> Result<RunHandle, RunError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.runner.submit(payload, instructions).await {
                Ok(handle) => return Ok(handle),
                Err(RunError::Transport(e))
                    if attempt <= self.config.submit_retries && e.is_retryable() =>
                {
                    let delay = backoff_delay(
                        self.config.retry_initial_backoff,
                        self.config.retry_max_backoff,
                        attempt - 1,
                    );
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "assistant submit failed, retrying"
                    );
                    self.runner.sleeper().sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // --- state ---

    async fn update_state(&self, f: impl FnOnce(&mut WorkflowState) + Send) {
        let workflow_id = &self.config.workflow_id;
        let result = async {
            let mut state = self.state.load(workflow_id).await?;
            f(&mut state);
            self.state.save(&mut state).await
        }
        .await;
        if let Err(e) = result {
            warn!(error = %e, workflow_id, "failed to persist workflow state");
        }
    }

    async fn pending_count(&self) -> usize {
        match self.improvements.pending().await {
            Ok(batches) => batches.iter().map(|b| b.pending_items().count()).sum(),
            Err(e) => {
                warn!(error = %e, "failed to count pending improvements");
                0
            }
        }
    }

    fn resting_stage(pending: usize) -> Stage {
        if pending > 0 {
            Stage::ImprovementsPending
        } else {
            Stage::Idle
        }
    }

    // --- analyze ---

    /// Ask the assistant to assess every tracked file. Never writes content.
    pub async fn analyze_content(&self) -> Result<AnalysisReport, AppError> {
        let files = self.require_pipeline()?;
        self.update_state(|s| s.stage = Stage::Analyzing).await;
        info!(files = files.len(), "analyzing content");

        let mut analyses = Vec::with_capacity(files.len());
        for file in &files {
            analyses.push(self.analyze_file(file).await);
        }

        let failed = analyses.iter().filter(|a| a.error.is_some()).count();
        let scores: Vec<f64> = analyses.iter().filter_map(|a| a.score).map(f64::from).collect();
        let average_score =
            (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64);
        let report = AnalysisReport {
            analyzed: analyses.len() - failed,
            failed,
            average_score,
            total_issues: analyses.iter().map(|a| a.issues.len()).sum(),
            files: analyses,
        };

        let pending = self.pending_count().await;
        let snapshot = AnalysisSnapshot {
            at_ms: now_millis(),
            analyzed: report.analyzed,
            failed: report.failed,
            average_score: report.average_score,
            total_issues: report.total_issues,
        };
        let last_error = first_error(report.files.iter().filter_map(|a| a.error.as_deref()));
        self.update_state(move |s| {
            s.stage = Self::resting_stage(pending);
            s.last_analysis = Some(snapshot);
            s.last_error = last_error;
        })
        .await;

        info!(
            analyzed = report.analyzed,
            failed = report.failed,
            issues = report.total_issues,
            "analysis complete"
        );
        Ok(report)
    }

    async fn analyze_file(&self, file: &str) -> FileAnalysis {
        let reply = async {
            let doc = self.content.read(file).await?;
            let instructions = prompts::for_file(prompts::ANALYZE_INSTRUCTIONS, file);
            self.ask(&doc.document, &instructions).await
        }
        .await;

        match reply {
            Ok(raw) => match parser::parse(&raw) {
                ParsedReply::Json(value) => parser::interpret_analysis(file, &value),
                ParsedReply::Text(text) => FileAnalysis {
                    file: file.to_string(),
                    raw_text: Some(text),
                    ..FileAnalysis::default()
                },
            },
            Err(e) => {
                warn!(error = %e, file, "analysis failed for file");
                FileAnalysis {
                    file: file.to_string(),
                    error_kind: Some(e.kind().to_string()),
                    error: Some(e.to_string()),
                    ..FileAnalysis::default()
                }
            }
        }
    }

    // --- improve ---

    /// Ask the assistant to improve every tracked file and stage what comes back.
    pub async fn improve_content(&self) -> Result<ImproveReport, AppError> {
        let files = self.require_pipeline()?;
        self.update_state(|s| s.stage = Stage::Analyzing).await;
        info!(files = files.len(), "requesting content improvements");

        let mut results = Vec::with_capacity(files.len());
        for file in &files {
            let outcome = match self.improve_file(file).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, file, "improvement failed for file");
                    ImproveOutcome::Failed {
                        error_kind: e.kind().to_string(),
                        error: e.to_string(),
                    }
                }
            };
            results.push(FileImproveResult {
                file: file.clone(),
                outcome,
            });
        }

        let mut report = ImproveReport {
            success: false,
            batches_created: 0,
            improvements_staged: 0,
            files: results,
        };
        let mut text_only = 0;
        let mut failed = 0;
        for result in &report.files {
            match &result.outcome {
                ImproveOutcome::Staged { count, .. } => {
                    report.batches_created += 1;
                    report.improvements_staged += count;
                }
                ImproveOutcome::NoChanges { .. } => {}
                ImproveOutcome::TextOnly { .. } => text_only += 1,
                ImproveOutcome::Failed { .. } => failed += 1,
            }
        }
        report.success = failed < report.files.len();

        let pending = self.pending_count().await;
        let snapshot = ImproveSnapshot {
            at_ms: now_millis(),
            batches_created: report.batches_created,
            improvements_staged: report.improvements_staged,
            text_only,
            failed,
        };
        let last_error = first_error(report.files.iter().filter_map(|r| match &r.outcome {
            ImproveOutcome::Failed { error, .. } => Some(error.as_str()),
            _ => None,
        }));
        self.update_state(move |s| {
            s.stage = Self::resting_stage(pending);
            s.last_improve = Some(snapshot);
            s.last_error = last_error;
        })
        .await;

        info!(
            batches = report.batches_created,
            staged = report.improvements_staged,
            text_only,
            failed,
            "improvement run complete"
        );
        Ok(report)
    }

    async fn improve_file(&self, file: &str) -> Result<ImproveOutcome, AppError> {
        let doc = self.content.read(file).await?;
        let instructions = prompts::for_file(prompts::IMPROVE_INSTRUCTIONS, file);
        let raw = self.ask(&doc.document, &instructions).await?;

        match parser::parse(&raw) {
            ParsedReply::Text(text) => {
                let manual_id = self.improvements.save_manual(file, &text).await?;
                Ok(ImproveOutcome::TextOnly {
                    manual_id,
                    raw_text: text,
                })
            }
            ParsedReply::Json(value) => {
                let interpretation = parser::interpret_improvements(&doc.document, &value);
                let dropped = interpretation.dropped;
                if interpretation.changes.is_empty() {
                    return Ok(ImproveOutcome::NoChanges { dropped });
                }
                let batch = self.improvements.stage(file, &raw, interpretation).await?;
                Ok(ImproveOutcome::Staged {
                    batch_id: batch.id,
                    count: batch.summary.count,
                    dropped,
                })
            }
        }
    }

    // --- review ---

    pub async fn get_pending_improvements(&self) -> Result<PendingImprovements, AppError> {
        let improvements: Vec<_> = self
            .improvements
            .pending()
            .await?
            .into_iter()
            .flat_map(|b| b.improvements.into_iter())
            .filter(|i| i.state == ItemState::Pending)
            .collect();
        Ok(PendingImprovements {
            count: improvements.len(),
            improvements,
        })
    }

    /// Apply pending improvements: all of them for `None`, the listed ones for `Some`.
    ///
    /// Per file: one read, one backup, one write. An item whose live value no longer equals its
    /// recorded original is marked stale and left untouched; backup or write failures leave
    /// the file's items pending for a later attempt.
    pub async fn apply_improvements(
        &self,
        ids: Option<&[String]>,
    ) -> Result<ApplyReport, AppError> {
        if ids.is_some_and(|ids| ids.is_empty()) {
            return Ok(ApplyReport {
                success: true,
                remaining: self.pending_count().await,
                ..ApplyReport::default()
            });
        }
        self.require_content_root()?;

        let mut batches = self.improvements.pending().await?;
        let mut report = ApplyReport::default();

        if let Some(ids) = ids {
            let known: HashSet<&str> = batches
                .iter()
                .flat_map(|b| b.pending_items())
                .map(|i| i.id.as_str())
                .collect();
            let mut seen = HashSet::new();
            for id in ids {
                if seen.insert(id.as_str()) && !known.contains(id.as_str()) {
                    report.errors.push(ItemFailure {
                        id: id.clone(),
                        reason: "unknown or not pending".to_string(),
                    });
                }
            }
        }
        let wanted: Option<HashSet<&str>> = ids.map(|ids| ids.iter().map(String::as_str).collect());

        let mut by_file: BTreeMap<String, Vec<(usize, usize)>> = BTreeMap::new();
        for (bi, batch) in batches.iter().enumerate() {
            for (ii, item) in batch.improvements.iter().enumerate() {
                let selected = wanted.as_ref().map_or(true, |w| w.contains(item.id.as_str()));
                if item.state == ItemState::Pending && selected {
                    by_file.entry(item.file.clone()).or_default().push((bi, ii));
                }
            }
        }

        self.update_state(|s| s.stage = Stage::Applying).await;
        let mut touched: HashSet<usize> = HashSet::new();

        for (file, targets) in by_file {
            self.apply_file(&file, &targets, &mut batches, &mut report).await;
            touched.extend(targets.iter().map(|(bi, _)| *bi));
        }

        let now = now_millis();
        for bi in touched {
            let batch = &mut batches[bi];
            batch.settle(now);
            if let Err(e) = self.improvements.update(batch).await {
                warn!(error = %e, batch_id = %batch.id, "failed to persist improvement batch");
                report.errors.push(ItemFailure {
                    id: batch.id.clone(),
                    reason: format!("batch not saved: {e}"),
                });
            }
        }

        report.applied = report.applied_ids.len();
        report.failed = report.stale.len() + report.errors.len();
        report.remaining = self.pending_count().await;
        report.success = report.failed == 0;

        let snapshot = ApplySnapshot {
            at_ms: now,
            applied: report.applied,
            failed: report.failed,
            remaining: report.remaining,
        };
        let stage = if report.failed > 0 {
            Stage::ApplyPartiallyFailed
        } else {
            Self::resting_stage(report.remaining)
        };
        let last_error = first_error(report.errors.iter().map(|f| f.reason.as_str()));
        self.update_state(move |s| {
            s.stage = stage;
            s.last_apply = Some(snapshot);
            s.last_error = last_error;
        })
        .await;

        info!(
            applied = report.applied,
            stale = report.stale.len(),
            errors = report.errors.len(),
            remaining = report.remaining,
            "apply complete"
        );
        Ok(report)
    }

    async fn apply_file(
        &self,
        file: &str,
        targets: &[(usize, usize)],
        batches: &mut [ImprovementBatch],
        report: &mut ApplyReport,
    ) {
        let mut doc = match self.content.read(file).await {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, file, "cannot read content file for apply");
                fail_items(report, targets, batches, &e.to_string());
                return;
            }
        };

        let now = now_millis();
        let mut staged = Vec::new();
        for &(bi, ii) in targets {
            let item = &batches[bi].improvements[ii];
            let path = FieldPath::parse(&item.field).ok();
            let fresh = path
                .as_ref()
                .and_then(|p| p.get(&doc.document))
                .is_some_and(|live| *live == item.original);
            match path {
                Some(path) if fresh => {
                    if let Err(e) = doc.replace(&path, item.improved.clone()) {
                        report.errors.push(ItemFailure {
                            id: item.id.clone(),
                            reason: e.to_string(),
                        });
                        continue;
                    }
                    staged.push((bi, ii));
                }
                _ => {
                    warn!(
                        improvement_id = %item.id,
                        file,
                        field = %item.field,
                        "stale improvement skipped"
                    );
                    report.stale.push(item.id.clone());
                    let item = &mut batches[bi].improvements[ii];
                    item.state = ItemState::Stale;
                    item.resolved_at_ms = Some(now);
                }
            }
        }

        if staged.is_empty() {
            return;
        }

        match self.backups.snapshot(file).await {
            Ok(record) => report.backups.push(record),
            Err(e) => {
                warn!(error = %e, file, "backup failed, leaving improvements pending");
                fail_items(report, &staged, batches, &format!("backup failed: {e}"));
                return;
            }
        }
        if let Err(e) = self.content.write(&doc).await {
            warn!(error = %e, file, "write failed, leaving improvements pending");
            fail_items(report, &staged, batches, &format!("write failed: {e}"));
            return;
        }

        for (bi, ii) in staged {
            let item = &mut batches[bi].improvements[ii];
            item.state = ItemState::Applied;
            item.resolved_at_ms = Some(now);
            report.applied_ids.push(item.id.clone());
        }
        info!(file, "improvements written");
    }

    /// Mark pending improvements as rejected.
    pub async fn reject_improvements(&self, ids: &[String]) -> Result<RejectReport, AppError> {
        let mut batches = self.improvements.pending().await?;
        let mut report = RejectReport::default();
        let mut touched = HashSet::new();
        let now = now_millis();

        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            let found = batches.iter_mut().enumerate().find_map(|(bi, b)| {
                b.improvements
                    .iter_mut()
                    .find(|i| &i.id == id && i.state == ItemState::Pending)
                    .map(|i| (bi, i))
            });
            match found {
                Some((bi, item)) => {
                    item.state = ItemState::Rejected;
                    item.resolved_at_ms = Some(now);
                    touched.insert(bi);
                    report.rejected += 1;
                }
                None => report.failed.push(ItemFailure {
                    id: id.clone(),
                    reason: "unknown or not pending".to_string(),
                }),
            }
        }

        for bi in touched {
            let batch = &mut batches[bi];
            batch.settle(now);
            self.improvements.update(batch).await?;
        }

        report.remaining = self.pending_count().await;
        let remaining = report.remaining;
        self.update_state(move |s| {
            if matches!(s.stage, Stage::Idle | Stage::ImprovementsPending) {
                s.stage = Self::resting_stage(remaining);
            }
        })
        .await;
        info!(rejected = report.rejected, remaining = report.remaining, "improvements rejected");
        Ok(report)
    }

    // --- read accessors ---

    pub async fn get_workflow_status(&self) -> Result<WorkflowStatus, AppError> {
        let state = self.state.load(&self.config.workflow_id).await?;
        let pending = self.improvements.pending().await?;

        let mut missing: Vec<String> = self
            .config
            .missing_settings()
            .into_iter()
            .map(str::to_string)
            .collect();
        let tracked_files = match self.content.ensure_available() {
            Ok(files) => files.len(),
            Err(e) => {
                if self.config.content_root.is_some() {
                    missing.push(e.to_string());
                }
                0
            }
        };

        Ok(WorkflowStatus {
            available: missing.is_empty(),
            missing,
            state,
            pending_improvements: pending.iter().map(|b| b.pending_items().count()).sum(),
            pending_batches: pending.len(),
            tracked_files,
        })
    }

    pub async fn get_content_files(&self) -> Result<ContentFiles, AppError> {
        self.require_content_root()?;
        let tracked = self.content.tracked()?;
        let mut files = Vec::with_capacity(tracked.len());
        for rel in &tracked {
            files.push(self.content.describe(rel).await);
        }
        Ok(ContentFiles {
            root: self.content.root().display().to_string(),
            files,
        })
    }

    /// Every batch, newest first.
    pub async fn get_improvement_history(
        &self,
        limit: Option<usize>,
    ) -> Result<ImprovementHistory, AppError> {
        let mut batches = self.improvements.list().await?;
        batches.reverse();
        if let Some(limit) = limit {
            batches.truncate(limit);
        }
        Ok(ImprovementHistory { batches })
    }

    pub async fn list_backups(&self, path: Option<&str>) -> Result<BackupList, AppError> {
        Ok(BackupList {
            backups: self.backups.list(path).await?,
        })
    }

    /// Restore a content file from a backup. Never done automatically.
    pub async fn restore_backup(&self, backup_id: &str) -> Result<RestoreReport, AppError> {
        self.require_content_root()?;
        let backup = self.backups.restore(backup_id).await?;
        Ok(RestoreReport {
            restored: true,
            backup,
        })
    }
}

fn fail_items(
    report: &mut ApplyReport,
    items: &[(usize, usize)],
    batches: &[ImprovementBatch],
    reason: &str,
) {
    for &(bi, ii) in items {
        report.errors.push(ItemFailure {
            id: batches[bi].improvements[ii].id.clone(),
            reason: reason.to_string(),
        });
    }
}

fn first_error<'a>(mut errors: impl Iterator<Item = &'a str>) -> Option<String> {
    errors.next().map(str::to_string)
}
