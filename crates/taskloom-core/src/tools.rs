use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use taskloom_types::ToolCallRecord;

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub output: Value,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(output: impl Into<Value>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: Value::String(message.into()),
            is_error: true,
        }
    }
}

/// Runs every tool other than the built-in file edit tools.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        call: &ToolCallRecord,
        workspace_root: &Path,
        cancel: CancellationToken,
    ) -> anyhow::Result<ToolOutput>;
}

/// Executor for runtimes that only expose the file edit tools.
pub struct NoExternalTools;

#[async_trait]
impl ToolExecutor for NoExternalTools {
    async fn execute(
        &self,
        call: &ToolCallRecord,
        _workspace_root: &Path,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ToolOutput> {
        Ok(ToolOutput::error(format!("Unknown tool: {}", call.tool_name)))
    }
}
