use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;

use taskloom_types::{EditApplyResult, EditOutcome, PendingEdit};

use crate::error::EditReviewError;
use crate::event_bus::EventBus;

/// Applies or discards a pending edit once a decision has been made.
#[async_trait]
pub trait EditCallbacks: Send + Sync {
    async fn on_approve(&self) -> anyhow::Result<EditApplyResult>;
    async fn on_reject(&self, feedback: Option<String>) -> anyhow::Result<EditApplyResult>;
}

struct PendingEntry {
    edit_id: String,
    edit: PendingEdit,
    callbacks: Arc<dyn EditCallbacks>,
    responder: oneshot::Sender<EditOutcome>,
}

/// Handle held by the task that proposed an edit.
pub struct EditReview {
    task_id: String,
    edit_id: String,
    rx: oneshot::Receiver<EditOutcome>,
}

impl EditReview {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn edit_id(&self) -> &str {
        &self.edit_id
    }

    /// Waits for approve/reject. Cancellation and a cleared entry both resolve
    /// as not approved.
    pub async fn wait(self, cancel: CancellationToken) -> EditOutcome {
        tokio::select! {
            _ = cancel.cancelled() => EditOutcome::failed("Edit review cancelled", None),
            outcome = self.rx => outcome
                .unwrap_or_else(|_| EditOutcome::failed("Edit review cancelled", None)),
        }
    }
}

/// At most one outstanding edit per task. Entries for different tasks never
/// interact.
#[derive(Clone)]
pub struct EditReviewQueue {
    entries: Arc<RwLock<HashMap<String, PendingEntry>>>,
    event_bus: EventBus,
}

impl EditReviewQueue {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            event_bus,
        }
    }

    pub async fn set_pending_edit(
        &self,
        task_id: &str,
        edit_id: &str,
        pending_edit: PendingEdit,
        callbacks: Arc<dyn EditCallbacks>,
    ) -> EditReview {
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            edit_id: edit_id.to_string(),
            edit: pending_edit.clone(),
            callbacks,
            responder: tx,
        };
        let previous = self
            .entries
            .write()
            .await
            .insert(task_id.to_string(), entry);
        if let Some(previous) = previous {
            tracing::debug!(task_id, superseded = %previous.edit_id, "pending edit superseded");
            let _ = previous
                .responder
                .send(EditOutcome::failed("Superseded by a newer edit", None));
        }
        self.event_bus.emit(
            "edit.pending",
            json!({
                "taskID": task_id,
                "editID": edit_id,
                "filePath": pending_edit.file_path,
                "operation": pending_edit.operation,
            }),
        );
        EditReview {
            task_id: task_id.to_string(),
            edit_id: edit_id.to_string(),
            rx,
        }
    }

    pub async fn get_pending_edit(&self, task_id: &str) -> Option<PendingEdit> {
        self.entries
            .read()
            .await
            .get(task_id)
            .map(|entry| entry.edit.clone())
    }

    pub async fn pending_task_ids(&self) -> Vec<String> {
        let mut ids = self.entries.read().await.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub async fn approve_edit(&self, task_id: &str) -> Result<EditOutcome, EditReviewError> {
        let entry = self.take(task_id).await?;
        let applied = entry.callbacks.on_approve().await;
        match applied {
            Ok(result) => Ok(self.resolve(task_id, entry, EditOutcome::approved(result))),
            Err(err) => {
                self.resolve(
                    task_id,
                    entry,
                    EditOutcome::failed(format!("Failed to apply edit: {err}"), None),
                );
                Err(EditReviewError::Callback(err))
            }
        }
    }

    pub async fn reject_edit(
        &self,
        task_id: &str,
        feedback: Option<String>,
    ) -> Result<EditOutcome, EditReviewError> {
        let entry = self.take(task_id).await?;
        let discarded = entry.callbacks.on_reject(feedback.clone()).await;
        match discarded {
            Ok(result) => Ok(self.resolve(
                task_id,
                entry,
                EditOutcome::rejected(result, feedback),
            )),
            Err(err) => {
                self.resolve(
                    task_id,
                    entry,
                    EditOutcome::failed(format!("Failed to reject edit: {err}"), feedback),
                );
                Err(EditReviewError::Callback(err))
            }
        }
    }

    /// Drops the task's entry without running callbacks. The waiter sees a
    /// cancelled outcome.
    pub async fn clear_pending_edit(&self, task_id: &str) -> bool {
        let removed = self.entries.write().await.remove(task_id);
        let Some(entry) = removed else {
            return false;
        };
        self.event_bus.emit(
            "edit.cleared",
            json!({"taskID": task_id, "editID": entry.edit_id}),
        );
        true
    }

    async fn take(&self, task_id: &str) -> Result<PendingEntry, EditReviewError> {
        self.entries
            .write()
            .await
            .remove(task_id)
            .ok_or_else(|| EditReviewError::NoPendingEdit(task_id.to_string()))
    }

    fn resolve(&self, task_id: &str, entry: PendingEntry, outcome: EditOutcome) -> EditOutcome {
        self.event_bus.emit(
            "edit.resolved",
            json!({
                "taskID": task_id,
                "editID": entry.edit_id,
                "approved": outcome.approved,
                "success": outcome.success,
            }),
        );
        let _ = entry.responder.send(outcome.clone());
        outcome
    }
}
