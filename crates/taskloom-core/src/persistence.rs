use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use taskloom_types::{Message, MessagePart, MessageRole};

/// Conversation storage used by the task loop.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Appends a message and returns its id.
    async fn save_message(
        &self,
        task_id: &str,
        role: MessageRole,
        content: Vec<MessagePart>,
    ) -> anyhow::Result<String>;

    /// Replaces the content of an existing message.
    async fn update_message(
        &self,
        task_id: &str,
        message_id: &str,
        content: Vec<MessagePart>,
    ) -> anyhow::Result<()>;

    async fn load_history(&self, task_id: &str) -> anyhow::Result<Vec<Message>>;
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    message: Message,
}

#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    tasks: Arc<RwLock<HashMap<String, Vec<StoredMessage>>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn save_message(
        &self,
        task_id: &str,
        role: MessageRole,
        content: Vec<MessagePart>,
    ) -> anyhow::Result<String> {
        let id = format!("msg_{}", Uuid::new_v4().simple());
        self.tasks
            .write()
            .await
            .entry(task_id.to_string())
            .or_default()
            .push(StoredMessage {
                id: id.clone(),
                message: Message::new(role, content),
            });
        Ok(id)
    }

    async fn update_message(
        &self,
        task_id: &str,
        message_id: &str,
        content: Vec<MessagePart>,
    ) -> anyhow::Result<()> {
        let mut tasks = self.tasks.write().await;
        let stored = tasks
            .get_mut(task_id)
            .and_then(|messages| messages.iter_mut().find(|m| m.id == message_id))
            .ok_or_else(|| anyhow!("message {message_id} not found for task {task_id}"))?;
        stored.message.content = content;
        Ok(())
    }

    async fn load_history(&self, task_id: &str) -> anyhow::Result<Vec<Message>> {
        Ok(self
            .tasks
            .read()
            .await
            .get(task_id)
            .map(|messages| messages.iter().map(|m| m.message.clone()).collect())
            .unwrap_or_default())
    }
}
