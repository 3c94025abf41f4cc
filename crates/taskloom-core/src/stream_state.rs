use serde::{Deserialize, Serialize};
use taskloom_types::ToolCallRecord;

pub const REASONING_HEADER: &str = "Reasoning:";
const QUOTE_PREFIX: &str = "> ";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Thinking,
    Streaming,
    ToolRunning,
    AwaitingApproval,
    Done,
    Aborted,
    Failed,
}

/// UI-facing callbacks. Invoked synchronously from delta processing, in stream order.
pub trait StreamSink: Send + Sync {
    fn on_chunk(&self, _text: &str) {}
    fn on_status(&self, _phase: TaskPhase) {}
    fn on_assistant_message_start(&self, _message_id: &str) {}
}

pub struct NoopSink;

impl StreamSink for NoopSink {}

/// Output accumulated for one task across model round-trips.
///
/// Two reset tiers:
/// - [`StreamState::reset_state`] runs at every loop iteration boundary and only drops
///   what belongs to the finished step.
/// - [`StreamState::full_reset`] runs when a task (or conversation) starts over and
///   drops everything, including the transcript and the error counter.
#[derive(Debug, Clone)]
pub struct StreamState {
    full_text: String,
    current_step_text: String,
    tool_calls: Vec<ToolCallRecord>,
    is_first_reasoning: bool,
    consecutive_tool_errors: u32,
    has_error: bool,
    reasoning_open: bool,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            full_text: String::new(),
            current_step_text: String::new(),
            tool_calls: Vec::new(),
            is_first_reasoning: true,
            consecutive_tool_errors: 0,
            has_error: false,
            reasoning_open: false,
        }
    }
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_text_delta(&mut self, delta: &str, sink: &dyn StreamSink) {
        if delta.is_empty() {
            return;
        }
        let chunk = if self.reasoning_open {
            self.reasoning_open = false;
            format!("\n\n{delta}")
        } else {
            delta.to_string()
        };
        self.append(&chunk);
        sink.on_chunk(&chunk);
    }

    pub fn process_reasoning_delta(
        &mut self,
        delta: &str,
        suppress_reasoning: bool,
        sink: &dyn StreamSink,
    ) {
        if suppress_reasoning || delta.is_empty() {
            return;
        }
        let mut chunk = String::new();
        if !self.reasoning_open {
            chunk.push_str(block_separator(&self.full_text));
            if self.is_first_reasoning {
                chunk.push_str(QUOTE_PREFIX);
                chunk.push_str(REASONING_HEADER);
                chunk.push('\n');
                self.is_first_reasoning = false;
            }
            chunk.push_str(QUOTE_PREFIX);
            self.reasoning_open = true;
        }
        chunk.push_str(&quote_continuation(delta));
        self.append(&chunk);
        sink.on_chunk(&chunk);
    }

    pub fn process_tool_call(&mut self, record: ToolCallRecord) {
        self.tool_calls.push(record);
    }

    pub fn mark_error(&mut self) {
        self.has_error = true;
        self.consecutive_tool_errors = self.consecutive_tool_errors.saturating_add(1);
    }

    /// Soft reset between loop iterations of the same task.
    pub fn reset_state(&mut self) {
        self.current_step_text.clear();
        self.tool_calls.clear();
        self.has_error = false;
    }

    /// Hard reset when a task or conversation is (re)started.
    pub fn full_reset(&mut self) {
        *self = Self::default();
    }

    pub fn full_text(&self) -> &str {
        &self.full_text
    }

    pub fn current_step_text(&self) -> &str {
        &self.current_step_text
    }

    pub fn tool_calls(&self) -> &[ToolCallRecord] {
        &self.tool_calls
    }

    pub fn has_error(&self) -> bool {
        self.has_error
    }

    pub fn consecutive_tool_errors(&self) -> u32 {
        self.consecutive_tool_errors
    }

    pub fn is_first_reasoning(&self) -> bool {
        self.is_first_reasoning
    }

    fn append(&mut self, chunk: &str) {
        self.current_step_text.push_str(chunk);
        self.full_text.push_str(chunk);
    }
}

fn block_separator(existing: &str) -> &'static str {
    if existing.is_empty() || existing.ends_with("\n\n") {
        ""
    } else if existing.ends_with('\n') {
        "\n"
    } else {
        "\n\n"
    }
}

fn quote_continuation(delta: &str) -> String {
    delta.replace('\n', &format!("\n{QUOTE_PREFIX}"))
}
