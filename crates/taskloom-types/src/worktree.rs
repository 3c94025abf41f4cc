use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeInfo {
    pub pool_index: usize,
    pub path: PathBuf,
    pub branch_name: String,
    pub in_use: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub changes_count: usize,
    pub last_used: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub success: bool,
    pub has_conflicts: bool,
    #[serde(default)]
    pub conflicted_files: Vec<String>,
    pub message: String,
}

impl MergeResult {
    pub fn merged(message: impl Into<String>) -> Self {
        Self {
            success: true,
            has_conflicts: false,
            conflicted_files: Vec::new(),
            message: message.into(),
        }
    }

    pub fn conflicted(conflicted_files: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            has_conflicts: true,
            conflicted_files,
            message: message.into(),
        }
    }
}
