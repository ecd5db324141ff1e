use std::sync::Arc;

use rmcp::{
    Json, ServerHandler,
    handler::server::router::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::*,
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::Deserialize;

use crate::error::AppError;
use crate::model::{
    AnalysisReport, ApplyReport, BackupList, ContentFiles, ImproveReport, ImprovementHistory,
    PendingImprovements, RejectReport, RestoreReport, WorkflowStatus,
};
use crate::workflow::Workflow;

#[derive(Clone)]
pub struct ContentImproverServer {
    workflow: Arc<Workflow>,
    tool_router: ToolRouter<ContentImproverServer>,
}

impl ContentImproverServer {
    pub fn new(workflow: Arc<Workflow>) -> Self {
        Self {
            workflow,
            tool_router: Self::tool_router(),
        }
    }
}

/// Tool errors carry their kind as a prefix so callers can branch on it.
fn tool_error(e: AppError) -> String {
    format!("{}: {e}", e.kind())
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ApplyImprovementsParams {
    /// Improvement ids to apply. Omit to apply every pending improvement; an empty list applies
    /// nothing.
    #[serde(default)]
    ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RejectImprovementsParams {
    ids: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct HistoryParams {
    /// Newest batches to return. Omit for all.
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ListBackupsParams {
    /// Content file path relative to the content root. Omit to list every backup.
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RestoreBackupParams {
    backup_id: String,
}

#[tool_router]
impl ContentImproverServer {
    #[tool(description = "Ask the assistant to assess every tracked content file. Read-only: returns per-file scores and issues and never changes content.")]
    async fn analyze_content(&self) -> Result<Json<AnalysisReport>, String> {
        let report = self.workflow.analyze_content().await.map_err(tool_error)?;
        Ok(Json(report))
    }

    #[tool(description = "Ask the assistant to improve every tracked content file. Proposed changes are staged as pending improvements for review; content is not modified.")]
    async fn improve_content(&self) -> Result<Json<ImproveReport>, String> {
        let report = self.workflow.improve_content().await.map_err(tool_error)?;
        Ok(Json(report))
    }

    #[tool(description = "List staged improvements that are still pending review.")]
    async fn get_pending_improvements(&self) -> Result<Json<PendingImprovements>, String> {
        let pending = self
            .workflow
            .get_pending_improvements()
            .await
            .map_err(tool_error)?;
        Ok(Json(pending))
    }

    #[tool(description = "Apply pending improvements to the content files. Each touched file is backed up first. Improvements whose original text changed since staging are skipped as stale.")]
    async fn apply_improvements(
        &self,
        Parameters(params): Parameters<ApplyImprovementsParams>,
    ) -> Result<Json<ApplyReport>, String> {
        let report = self
            .workflow
            .apply_improvements(params.ids.as_deref())
            .await
            .map_err(tool_error)?;
        Ok(Json(report))
    }

    #[tool(description = "Reject pending improvements by id so they are never applied.")]
    async fn reject_improvements(
        &self,
        Parameters(params): Parameters<RejectImprovementsParams>,
    ) -> Result<Json<RejectReport>, String> {
        if params.ids.is_empty() {
            return Err("invalid_request: ids must not be empty".to_string());
        }
        let report = self
            .workflow
            .reject_improvements(&params.ids)
            .await
            .map_err(tool_error)?;
        Ok(Json(report))
    }

    #[tool(description = "Report workflow stage, last run summaries, pending counts and any missing configuration.")]
    async fn get_workflow_status(&self) -> Result<Json<WorkflowStatus>, String> {
        let status = self.workflow.get_workflow_status().await.map_err(tool_error)?;
        Ok(Json(status))
    }

    #[tool(description = "List tracked content files with size, modification time, sha256 and top-level keys.")]
    async fn get_content_files(&self) -> Result<Json<ContentFiles>, String> {
        let files = self.workflow.get_content_files().await.map_err(tool_error)?;
        Ok(Json(files))
    }

    #[tool(description = "List improvement batches, newest first, including applied and rejected ones.")]
    async fn get_improvement_history(
        &self,
        Parameters(params): Parameters<HistoryParams>,
    ) -> Result<Json<ImprovementHistory>, String> {
        let history = self
            .workflow
            .get_improvement_history(params.limit)
            .await
            .map_err(tool_error)?;
        Ok(Json(history))
    }

    #[tool(description = "List content backups, newest first, optionally for a single content file.")]
    async fn list_backups(
        &self,
        Parameters(params): Parameters<ListBackupsParams>,
    ) -> Result<Json<BackupList>, String> {
        let backups = self
            .workflow
            .list_backups(params.path.as_deref())
            .await
            .map_err(tool_error)?;
        Ok(Json(backups))
    }

    #[tool(description = "Restore a content file from a backup id returned by apply_improvements or list_backups. The backup is verified against its recorded sha256 first.")]
    async fn restore_backup(
        &self,
        Parameters(params): Parameters<RestoreBackupParams>,
    ) -> Result<Json<RestoreReport>, String> {
        let backup_id = params.backup_id.trim();
        if backup_id.is_empty() {
            return Err("invalid_request: backup_id must not be empty".to_string());
        }
        let report = self
            .workflow
            .restore_backup(backup_id)
            .await
            .map_err(tool_error)?;
        Ok(Json(report))
    }
}

#[tool_handler]
impl ServerHandler for ContentImproverServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "content-improver".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Content improvement MCP server. Use analyze_content for a read-only assessment, \
improve_content to stage proposed copy changes, get_pending_improvements to review them, then \
apply_improvements or reject_improvements. Applied files are backed up; use list_backups and \
restore_backup to roll back. get_workflow_status reports the current stage and missing \
configuration."
                    .to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{tool_error, ContentImproverServer};
    use crate::error::AppError;

    #[test]
    fn tools_publish_output_schemas() {
        let tools = ContentImproverServer::tool_router().list_all();
        for name in [
            "analyze_content",
            "improve_content",
            "get_pending_improvements",
            "apply_improvements",
            "reject_improvements",
            "get_workflow_status",
            "get_content_files",
            "get_improvement_history",
            "list_backups",
            "restore_backup",
        ] {
            let tool = tools
                .iter()
                .find(|t| t.name == name)
                .unwrap_or_else(|| panic!("missing tool: {name}"));
            assert!(
                tool.output_schema.is_some(),
                "tool {name} should publish output_schema"
            );
        }
    }

    #[test]
    fn tool_errors_are_prefixed_with_their_kind() {
        let message = tool_error(AppError::NotAvailable("CONTENT_ROOT is not set".into()));
        assert!(message.starts_with("not_available: "));
        assert!(message.contains("CONTENT_ROOT"));
    }
}
