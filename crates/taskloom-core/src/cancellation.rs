use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Cancellation tokens for in-flight tasks, keyed by task id.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh token, cancelling any token left over from a previous run.
    pub async fn create(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .tokens
            .write()
            .await
            .insert(task_id.to_string(), token.clone())
        {
            previous.cancel();
        }
        token
    }

    pub async fn cancel(&self, task_id: &str) -> bool {
        match self.tokens.read().await.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, task_id: &str) {
        self.tokens.write().await.remove(task_id);
    }

    pub async fn active_task_ids(&self) -> Vec<String> {
        let mut ids = self.tokens.read().await.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }
}
