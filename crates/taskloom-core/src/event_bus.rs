use serde_json::Value;
use tokio::sync::broadcast;

use taskloom_types::EngineEvent;

const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out of runtime events to UI subscribers. Publishing never blocks; slow
/// subscribers observe `RecvError::Lagged`.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn emit(&self, event_type: &str, properties: Value) {
        self.publish(EngineEvent::new(event_type, properties));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
