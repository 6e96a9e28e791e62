//! Stage records, outputs and per-stage metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// Inline stage output bound; larger content moves to the blob store.
pub const MAX_INLINE_CONTENT_BYTES: usize = 400 * 1024;

/// Execution status of one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StageStatus::Pending),
            "running" => Some(StageStatus::Running),
            "completed" => Some(StageStatus::Completed),
            "failed" => Some(StageStatus::Failed),
            "skipped" => Some(StageStatus::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource consumption of a single stage execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub execution_time_seconds: f64,
    pub tool_calls_count: u64,
    pub model_id: Option<String>,
}

impl StageMetrics {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Metadata for a file generated during a stage execution.
///
/// Paths are relative to the project directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: String,
    pub size: u64,
    /// MD5 hex digest.
    pub checksum: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Format of a stage's design document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    #[default]
    Markdown,
    Json,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Markdown => "markdown",
            DocumentFormat::Json => "json",
        }
    }
}

/// The canonical design document a stage produced, if any.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DesignDocument {
    pub content: String,
    pub format: DocumentFormat,
}

/// Everything a stage execution produced.
///
/// Exactly one of `content` and `blob_content_ref` carries the agent
/// output once the stage is completed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageOutput {
    pub stage_name: String,
    pub content: String,
    pub blob_content_ref: Option<String>,
    pub metrics: StageMetrics,
    pub generated_files: Vec<FileMetadata>,
    pub document: Option<DesignDocument>,
    /// Project-relative path of the on-disk design document, when one
    /// was written.
    pub doc_path: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: StageStatus,
    pub error_message: Option<String>,
}

impl StageOutput {
    pub fn is_completed(&self) -> bool {
        self.status == StageStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == StageStatus::Failed
    }

    /// Whether the inline content exceeds the 400 KiB record bound.
    pub fn content_exceeds_limit(&self) -> bool {
        self.content.len() > MAX_INLINE_CONTENT_BYTES
    }
}

/// Durable record of one pipeline stage, keyed by
/// `(project_id, stage_name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub project_id: ResourceId,
    pub stage_name: String,
    /// 1-indexed position in the configured order.
    pub stage_number: i32,
    pub display_name: String,
    pub agent_name: Option<String>,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub metrics: Option<StageMetrics>,
    pub agent_output_content: Option<String>,
    pub agent_output_blob_ref: Option<String>,
    pub design_document: Option<DesignDocument>,
    pub generated_files: Vec<FileMetadata>,
    pub error_message: Option<String>,
    /// Pointer to the canonical on-disk design document.
    pub doc_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_limit() {
        let mut output = StageOutput {
            stage_name: "requirements_analysis".into(),
            content: "x".repeat(MAX_INLINE_CONTENT_BYTES),
            ..Default::default()
        };
        assert!(!output.content_exceeds_limit());
        output.content.push('x');
        assert!(output.content_exceeds_limit());
    }

    #[test]
    fn total_tokens() {
        let metrics = StageMetrics {
            input_tokens: 7,
            output_tokens: 11,
            ..Default::default()
        };
        assert_eq!(metrics.total_tokens(), 18);
    }
}
