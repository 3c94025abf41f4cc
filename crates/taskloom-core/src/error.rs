use thiserror::Error;

#[derive(Error, Debug)]
pub enum EditReviewError {
    #[error("No pending edit for task {0}")]
    NoPendingEdit(String),

    #[error("Edit callback failed: {0}")]
    Callback(#[source] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Task {0} has no assigned worktree")]
    NotAssigned(String),

    #[error("No merge in progress")]
    NoMergeInProgress,

    #[error("A merge for pool slot {0} is already in progress")]
    MergeInProgress(usize),

    #[error("Git error: {0}")]
    Git(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum ToolPathError {
    #[error("Path escapes the workspace root: {0}")]
    OutsideRoot(String),

    #[error("Path is empty")]
    Empty,
}
