use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use taskloom_observability::{emit_event, redact_text, ObservabilityEvent};
use taskloom_types::{
    EditOutcome, Message, MessagePart, MessageRole, MergeResult, ToolCallRecord,
};

use crate::cancellation::CancellationRegistry;
use crate::config::RuntimeConfig;
use crate::edit_review::EditReviewQueue;
use crate::error::{EditReviewError, PoolError};
use crate::event_bus::EventBus;
use crate::file_edits::{is_file_edit_tool, propose_edit};
use crate::git::GitBackend;
use crate::model::{ModelClient, ModelEvent, ModelRequest};
use crate::persistence::MessageStore;
use crate::sanitizer::sanitize_and_validate;
use crate::stream_state::{StreamSink, StreamState, TaskPhase};
use crate::tools::{ToolExecutor, ToolOutput};
use crate::worktree_pool::WorktreePool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The model answered without requesting further tools. The worktree (if any)
    /// stays assigned until it is merged or released.
    Completed {
        full_text: String,
        worktree: Option<usize>,
    },
    Aborted,
    CircuitBroken {
        errors: u32,
    },
    IterationLimit,
}

enum StepEnd {
    Continue,
    Finished,
    Cancelled,
}

/// Drives model/tool round-trips for many independent tasks.
#[derive(Clone)]
pub struct TaskRuntime {
    config: Arc<RuntimeConfig>,
    pool: WorktreePool,
    edits: EditReviewQueue,
    event_bus: EventBus,
    cancellations: CancellationRegistry,
    model: Arc<dyn ModelClient>,
    store: Arc<dyn MessageStore>,
    tools: Arc<dyn ToolExecutor>,
}

impl TaskRuntime {
    pub fn new(
        config: RuntimeConfig,
        git: Arc<dyn GitBackend>,
        model: Arc<dyn ModelClient>,
        store: Arc<dyn MessageStore>,
        tools: Arc<dyn ToolExecutor>,
    ) -> Self {
        let event_bus = EventBus::new();
        let pool = WorktreePool::new(config.pool_settings(), git, event_bus.clone());
        Self {
            config: Arc::new(config),
            pool,
            edits: EditReviewQueue::new(event_bus.clone()),
            event_bus,
            cancellations: CancellationRegistry::new(),
            model,
            store,
            tools,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn pool(&self) -> &WorktreePool {
        &self.pool
    }

    pub fn edits(&self) -> &EditReviewQueue {
        &self.edits
    }

    pub async fn approve_edit(&self, task_id: &str) -> Result<EditOutcome, EditReviewError> {
        self.edits.approve_edit(task_id).await
    }

    pub async fn reject_edit(
        &self,
        task_id: &str,
        feedback: Option<String>,
    ) -> Result<EditOutcome, EditReviewError> {
        self.edits.reject_edit(task_id, feedback).await
    }

    pub async fn get_effective_root(&self, task_id: &str) -> PathBuf {
        self.pool.get_effective_root(task_id).await
    }

    pub async fn cancel_task(&self, task_id: &str) -> bool {
        self.cancellations.cancel(task_id).await
    }

    /// Ids of tasks currently inside [`Self::run_task`], sorted.
    pub async fn running_tasks(&self) -> Vec<String> {
        self.cancellations.active_task_ids().await
    }

    /// Merges a completed task's worktree and frees the slot once the merge is clean.
    pub async fn merge_task(&self, task_id: &str) -> Result<MergeResult, PoolError> {
        let result = self.pool.merge(task_id).await?;
        if result.success {
            self.pool.release(task_id).await;
        }
        Ok(result)
    }

    /// Concludes a conflicted merge once the conflicts are resolved on disk. The
    /// merging task's slot is freed when the merge completes.
    pub async fn continue_merge(&self) -> Result<MergeResult, PoolError> {
        let task_id = self.pool.merging_task().await;
        let result = self.pool.continue_merge().await?;
        if result.success && !result.has_conflicts {
            if let Some(task_id) = task_id {
                self.pool.release(&task_id).await;
            }
        }
        Ok(result)
    }

    /// Abandons an open merge. The task keeps its worktree so it can be retried.
    pub async fn abort_merge(&self) -> Result<MergeResult, PoolError> {
        self.pool.abort_merge().await
    }

    pub async fn run_task(
        &self,
        task_id: &str,
        prompt: &str,
        sink: &dyn StreamSink,
    ) -> anyhow::Result<TaskOutcome> {
        let cancel = self.cancellations.create(task_id).await;
        let mut state = StreamState::new();
        state.full_reset();

        emit_event(
            Level::INFO,
            ObservabilityEvent {
                event: "task.start",
                component: "task.loop",
                task_id: Some(task_id),
                status: Some("start"),
                ..Default::default()
            },
        );

        let result = match self.pool.assign(task_id).await {
            Ok(worktree) => {
                self.drive(task_id, prompt, worktree, &mut state, sink, &cancel)
                    .await
            }
            Err(err) => Err(err.into()),
        };
        self.cancellations.remove(task_id).await;

        match &result {
            Ok(TaskOutcome::Completed { .. }) => self.set_phase(task_id, TaskPhase::Done, sink),
            Ok(TaskOutcome::Aborted) => {
                self.abort_cleanup(task_id, &mut state).await;
                self.set_phase(task_id, TaskPhase::Aborted, sink);
            }
            Ok(TaskOutcome::CircuitBroken { .. } | TaskOutcome::IterationLimit) => {
                self.edits.clear_pending_edit(task_id).await;
                self.set_phase(task_id, TaskPhase::Failed, sink);
            }
            Err(err) => {
                let detail = err.to_string();
                emit_event(
                    Level::ERROR,
                    ObservabilityEvent {
                        event: "task.error",
                        component: "task.loop",
                        task_id: Some(task_id),
                        status: Some("failed"),
                        detail: Some(&detail),
                        ..Default::default()
                    },
                );
                self.abort_cleanup(task_id, &mut state).await;
                self.set_phase(task_id, TaskPhase::Failed, sink);
            }
        }
        result
    }

    async fn drive(
        &self,
        task_id: &str,
        prompt: &str,
        worktree: Option<usize>,
        state: &mut StreamState,
        sink: &dyn StreamSink,
        cancel: &CancellationToken,
    ) -> anyhow::Result<TaskOutcome> {
        self.store
            .save_message(task_id, MessageRole::User, vec![MessagePart::text(prompt)])
            .await?;
        let root = self.pool.get_effective_root(task_id).await;

        for iteration in 0..self.config.max_iterations {
            if cancel.is_cancelled() {
                return Ok(TaskOutcome::Aborted);
            }
            tracing::debug!(task_id, iteration, "task loop iteration");

            match self.run_step(task_id, &root, state, sink, cancel).await? {
                StepEnd::Finished => {
                    return Ok(TaskOutcome::Completed {
                        full_text: state.full_text().to_string(),
                        worktree,
                    })
                }
                StepEnd::Cancelled => return Ok(TaskOutcome::Aborted),
                StepEnd::Continue => {}
            }

            let errors = state.consecutive_tool_errors();
            if errors >= self.config.max_consecutive_tool_errors {
                let detail = format!("{errors} tool errors");
                emit_event(
                    Level::WARN,
                    ObservabilityEvent {
                        event: "task.circuit_broken",
                        component: "task.loop",
                        task_id: Some(task_id),
                        status: Some("failed"),
                        error_code: Some("TOOL_ERROR_LIMIT"),
                        detail: Some(&detail),
                        ..Default::default()
                    },
                );
                return Ok(TaskOutcome::CircuitBroken { errors });
            }

            state.reset_state();
        }
        Ok(TaskOutcome::IterationLimit)
    }

    /// One model round-trip plus the tool calls it requested.
    async fn run_step(
        &self,
        task_id: &str,
        root: &Path,
        state: &mut StreamState,
        sink: &dyn StreamSink,
        cancel: &CancellationToken,
    ) -> anyhow::Result<StepEnd> {
        let history = self.store.load_history(task_id).await?;
        let report = sanitize_and_validate(history, self.config.sanitize_options());
        if !report.issues_before.is_empty() {
            self.event_bus.emit(
                "history.sanitized",
                json!({
                    "taskID": task_id,
                    "fixed": report.fixed_count(),
                    "remaining": report.issues_after.len(),
                }),
            );
        }

        let message_id = self
            .store
            .save_message(task_id, MessageRole::Assistant, Vec::new())
            .await?;
        sink.on_assistant_message_start(&message_id);
        self.set_phase(task_id, TaskPhase::Thinking, sink);

        let request = ModelRequest {
            task_id: task_id.to_string(),
            messages: report.messages,
            workspace_root: root.to_path_buf(),
        };
        let mut stream = self.model.stream(request, cancel.clone()).await?;
        let mut provider_results = Vec::new();
        let mut streaming = false;
        let mut cancelled = false;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    None
                }
                next = stream.next() => next,
            };
            let Some(event) = next else { break };
            match event? {
                ModelEvent::TextDelta(delta) => {
                    if !streaming {
                        streaming = true;
                        self.set_phase(task_id, TaskPhase::Streaming, sink);
                    }
                    state.process_text_delta(&delta, sink);
                }
                ModelEvent::ReasoningDelta(delta) => {
                    state.process_reasoning_delta(&delta, self.config.suppress_reasoning, sink);
                }
                ModelEvent::ToolCall(record) => state.process_tool_call(record),
                ModelEvent::ToolResult {
                    tool_call_id,
                    tool_name,
                    output,
                } => provider_results.push(Message::tool_result(tool_call_id, tool_name, output)),
                ModelEvent::Status(status) => {
                    tracing::debug!(task_id, status = %status, "model status");
                }
                ModelEvent::Done { finish_reason } => {
                    tracing::debug!(task_id, finish_reason = %finish_reason, "model stream done");
                    break;
                }
                ModelEvent::Error(message) => return Err(anyhow!("model error: {message}")),
            }
        }

        let mut parts = Vec::new();
        if !state.current_step_text().is_empty() {
            parts.push(MessagePart::text(state.current_step_text()));
        }
        parts.extend(state.tool_calls().iter().map(ToolCallRecord::to_part));
        self.store.update_message(task_id, &message_id, parts).await?;
        if cancelled {
            return Ok(StepEnd::Cancelled);
        }

        let mut answered = HashSet::new();
        for result in provider_results {
            if let Some(id) = result.content.first().and_then(MessagePart::tool_call_id) {
                answered.insert(id.to_string());
            }
            self.store
                .save_message(task_id, MessageRole::Tool, result.content)
                .await?;
        }

        if state.tool_calls().is_empty() {
            return Ok(StepEnd::Finished);
        }

        self.set_phase(task_id, TaskPhase::ToolRunning, sink);
        let calls = state
            .tool_calls()
            .iter()
            .filter(|call| !answered.contains(&call.tool_call_id))
            .cloned()
            .collect::<Vec<_>>();
        for call in calls {
            let output = self.run_tool(task_id, &call, root, sink, cancel).await;
            if cancel.is_cancelled() {
                return Ok(StepEnd::Cancelled);
            }
            if output.is_error {
                state.mark_error();
                let detail = output.output.to_string();
                emit_event(
                    Level::WARN,
                    ObservabilityEvent {
                        event: "tool.error",
                        component: "task.loop",
                        task_id: Some(task_id),
                        tool_call_id: Some(&call.tool_call_id),
                        status: Some("failed"),
                        detail: Some(&detail),
                        ..Default::default()
                    },
                );
            }
            let result = Message::tool_result(
                call.tool_call_id.clone(),
                call.tool_name.clone(),
                output.output,
            );
            self.store
                .save_message(task_id, MessageRole::Tool, result.content)
                .await?;
        }
        Ok(StepEnd::Continue)
    }

    async fn run_tool(
        &self,
        task_id: &str,
        call: &ToolCallRecord,
        root: &Path,
        sink: &dyn StreamSink,
        cancel: &CancellationToken,
    ) -> ToolOutput {
        if is_file_edit_tool(&call.tool_name) {
            return self.run_file_edit(task_id, call, root, sink, cancel).await;
        }
        match self.tools.execute(call, root, cancel.clone()).await {
            Ok(output) => output,
            Err(err) => ToolOutput::error(err.to_string()),
        }
    }

    async fn run_file_edit(
        &self,
        task_id: &str,
        call: &ToolCallRecord,
        root: &Path,
        sink: &dyn StreamSink,
        cancel: &CancellationToken,
    ) -> ToolOutput {
        let proposal = match propose_edit(root, call).await {
            Ok(proposal) => proposal,
            Err(err) => return ToolOutput::error(format!("{err:#}")),
        };

        if !self.config.require_edit_approval {
            return match proposal.applier().apply().await {
                Ok(result) => {
                    ToolOutput::success(json!({"applied": true, "message": result.message}))
                }
                Err(err) => ToolOutput::error(format!("{err:#}")),
            };
        }

        let redacted = redact_text(&proposal.pending.new_content);
        emit_event(
            Level::INFO,
            ObservabilityEvent {
                event: "edit.pending",
                component: "task.loop",
                task_id: Some(task_id),
                tool_call_id: Some(&call.tool_call_id),
                status: Some("awaiting_approval"),
                detail: Some(&redacted),
                ..Default::default()
            },
        );
        self.set_phase(task_id, TaskPhase::AwaitingApproval, sink);
        let review = self
            .edits
            .set_pending_edit(
                task_id,
                &proposal.pending.id,
                proposal.pending.clone(),
                Arc::new(proposal.applier()),
            )
            .await;
        let outcome = review.wait(cancel.clone()).await;
        if !cancel.is_cancelled() {
            self.set_phase(task_id, TaskPhase::ToolRunning, sink);
        }

        let file_path = proposal.pending.file_path;
        match (outcome.approved, outcome.success) {
            (true, true) => ToolOutput::success(json!({
                "approved": true,
                "path": file_path,
                "message": outcome.message,
            })),
            (false, true) => ToolOutput::success(json!({
                "approved": false,
                "path": file_path,
                "feedback": outcome.feedback,
                "message": "The user rejected this edit.",
            })),
            _ => ToolOutput::error(
                outcome
                    .message
                    .unwrap_or_else(|| format!("Edit to {file_path} was not applied")),
            ),
        }
    }

    async fn abort_cleanup(&self, task_id: &str, state: &mut StreamState) {
        state.full_reset();
        self.edits.clear_pending_edit(task_id).await;
        self.pool.release(task_id).await;
    }

    fn set_phase(&self, task_id: &str, phase: TaskPhase, sink: &dyn StreamSink) {
        sink.on_status(phase);
        self.event_bus
            .emit("task.status", json!({"taskID": task_id, "status": phase}));
    }
}
