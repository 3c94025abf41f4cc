use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EditOperation {
    Write,
    Edit,
}

/// A file mutation proposed by a tool call, waiting for a human decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingEdit {
    pub id: String,
    pub file_path: String,
    pub original_content: String,
    pub new_content: String,
    pub operation: EditOperation,
    pub timestamp: DateTime<Utc>,
}

impl PendingEdit {
    pub fn new(
        file_path: impl Into<String>,
        original_content: impl Into<String>,
        new_content: impl Into<String>,
        operation: EditOperation,
    ) -> Self {
        Self {
            id: format!("edit_{}", uuid::Uuid::new_v4().simple()),
            file_path: file_path.into(),
            original_content: original_content.into(),
            new_content: new_content.into(),
            operation,
            timestamp: Utc::now(),
        }
    }
}

/// Result reported by an approve/reject callback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EditApplyResult {
    pub success: bool,
    pub message: String,
}

impl EditApplyResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Final decision delivered to the task waiting on a pending edit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EditOutcome {
    pub approved: bool,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl EditOutcome {
    pub fn approved(result: EditApplyResult) -> Self {
        Self {
            approved: true,
            success: result.success,
            message: Some(result.message),
            feedback: None,
        }
    }

    pub fn rejected(result: EditApplyResult, feedback: Option<String>) -> Self {
        Self {
            approved: false,
            success: result.success,
            message: Some(result.message),
            feedback,
        }
    }

    pub fn failed(message: impl Into<String>, feedback: Option<String>) -> Self {
        Self {
            approved: false,
            success: false,
            message: Some(message.into()),
            feedback,
        }
    }
}
