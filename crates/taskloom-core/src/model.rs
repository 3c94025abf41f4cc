use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use taskloom_types::{Message, ToolCallRecord};

#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCall(ToolCallRecord),
    /// Result of a tool the provider executed itself.
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        output: Value,
    },
    Status(String),
    Done {
        finish_reason: String,
    },
    Error(String),
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub task_id: String,
    pub messages: Vec<Message>,
    pub workspace_root: PathBuf,
}

pub type ModelStream = Pin<Box<dyn Stream<Item = anyhow::Result<ModelEvent>> + Send>>;

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream(
        &self,
        request: ModelRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<ModelStream>;
}
