//! Repairs a message history into the shape the upstream model API accepts.
//!
//! The pipeline stages are pure functions applied in a fixed order. Validation is a
//! separate read-only pass so callers can compare a history before and after repair.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use taskloom_types::{Message, MessagePart, MessageRole};

pub const CONTINUE_PLACEHOLDER: &str = "Continue.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SanitizeOptions {
    #[serde(default = "default_auto_fix")]
    pub auto_fix: bool,
}

fn default_auto_fix() -> bool {
    true
}

impl Default for SanitizeOptions {
    fn default() -> Self {
        Self {
            auto_fix: default_auto_fix(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    ScatteredSystem,
    ConsecutiveAssistant,
    OrphanedToolCall,
    OrphanedToolResult,
    EmptyAssistant,
    AssistantTrailingWhitespace,
}

impl IssueCode {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueCode::ScatteredSystem => "SCATTERED_SYSTEM",
            IssueCode::ConsecutiveAssistant => "CONSECUTIVE_ASSISTANT",
            IssueCode::OrphanedToolCall => "ORPHANED_TOOL_CALL",
            IssueCode::OrphanedToolResult => "ORPHANED_TOOL_RESULT",
            IssueCode::EmptyAssistant => "EMPTY_ASSISTANT",
            IssueCode::AssistantTrailingWhitespace => "ASSISTANT_TRAILING_WHITESPACE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub human_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ValidationIssue {
    fn at(code: IssueCode, index: usize, human_message: String) -> Self {
        Self {
            code,
            human_message,
            message_index: Some(index),
            tool_call_id: None,
        }
    }

    fn for_tool_call(
        code: IssueCode,
        index: usize,
        tool_call_id: &str,
        human_message: String,
    ) -> Self {
        Self {
            code,
            human_message,
            message_index: Some(index),
            tool_call_id: Some(tool_call_id.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
}

#[derive(Debug, Clone)]
pub struct SanitizeReport {
    pub messages: Vec<Message>,
    pub issues_before: Vec<ValidationIssue>,
    pub issues_after: Vec<ValidationIssue>,
}

impl SanitizeReport {
    pub fn fixed_count(&self) -> usize {
        self.issues_before
            .len()
            .saturating_sub(self.issues_after.len())
    }
}

pub fn sanitize_messages(messages: Vec<Message>, options: SanitizeOptions) -> Vec<Message> {
    let messages = if options.auto_fix {
        let messages = remove_orphaned_tool_messages(messages);
        let messages = remove_empty_assistant_messages(messages);
        let messages = merge_consecutive_assistant_messages(messages);
        ensure_user_first(messages)
    } else {
        messages
    };
    trim_assistant_trailing_whitespace(messages)
}

/// Sanitizes, re-validates and logs what the repair changed.
pub fn sanitize_and_validate(messages: Vec<Message>, options: SanitizeOptions) -> SanitizeReport {
    let issues_before = validate_messages(&messages).issues;
    let original_len = messages.len();
    let sanitized = sanitize_messages(messages, options);
    let issues_after = validate_messages(&sanitized).issues;

    if !issues_before.is_empty() && issues_after.len() < issues_before.len() {
        tracing::info!(
            fixed = issues_before.len() - issues_after.len(),
            before = issues_before.len(),
            messages_before = original_len,
            messages_after = sanitized.len(),
            codes = %issue_codes(&issues_before),
            "sanitizer repaired message history"
        );
    }
    if !issues_after.is_empty() {
        tracing::warn!(
            remaining = issues_after.len(),
            codes = %issue_codes(&issues_after),
            auto_fix = options.auto_fix,
            "message history still has validation issues"
        );
    }

    SanitizeReport {
        messages: sanitized,
        issues_before,
        issues_after,
    }
}

fn issue_codes(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|issue| issue.code.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

fn tool_call_ids(messages: &[Message]) -> HashSet<String> {
    messages
        .iter()
        .filter(|m| m.role == MessageRole::Assistant)
        .flat_map(|m| m.content.iter())
        .filter_map(|part| match part {
            MessagePart::ToolCall { tool_call_id, .. } => Some(tool_call_id.clone()),
            _ => None,
        })
        .collect()
}

fn tool_result_ids(messages: &[Message]) -> HashSet<String> {
    messages
        .iter()
        .filter(|m| m.role == MessageRole::Tool)
        .flat_map(|m| m.content.iter())
        .filter_map(|part| match part {
            MessagePart::ToolResult { tool_call_id, .. } => Some(tool_call_id.clone()),
            _ => None,
        })
        .collect()
}

pub fn remove_orphaned_tool_messages(messages: Vec<Message>) -> Vec<Message> {
    let calls = tool_call_ids(&messages);
    let results = tool_result_ids(&messages);
    let paired = |id: &str| calls.contains(id) && results.contains(id);

    messages
        .into_iter()
        .filter_map(|mut message| {
            let before = message.content.len();
            message.content.retain(|part| match part {
                MessagePart::ToolCall { tool_call_id, .. }
                | MessagePart::ToolResult { tool_call_id, .. } => paired(tool_call_id.as_str()),
                MessagePart::Text { .. } => true,
            });
            if message.content.is_empty() && before > 0 {
                None
            } else {
                Some(message)
            }
        })
        .collect()
}

fn has_substance(message: &Message) -> bool {
    message.content.iter().any(|part| match part {
        MessagePart::Text { text } => !text.trim().is_empty(),
        MessagePart::ToolCall { .. } => true,
        MessagePart::ToolResult { .. } => false,
    })
}

pub fn remove_empty_assistant_messages(messages: Vec<Message>) -> Vec<Message> {
    messages
        .into_iter()
        .filter(|m| m.role != MessageRole::Assistant || has_substance(m))
        .collect()
}

pub fn merge_consecutive_assistant_messages(messages: Vec<Message>) -> Vec<Message> {
    let mut merged: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        match merged.last_mut() {
            Some(previous)
                if previous.role == MessageRole::Assistant
                    && message.role == MessageRole::Assistant =>
            {
                previous.content.retain(|part| !part.is_empty_text());
                previous.content.extend(
                    message
                        .content
                        .into_iter()
                        .filter(|part| !part.is_empty_text()),
                );
            }
            _ => merged.push(message),
        }
    }
    merged
}

pub fn ensure_user_first(mut messages: Vec<Message>) -> Vec<Message> {
    let Some(first_index) = messages
        .iter()
        .position(|m| m.role != MessageRole::System)
    else {
        return messages;
    };
    if !matches!(
        messages[first_index].role,
        MessageRole::User | MessageRole::Tool
    ) {
        messages.insert(first_index, Message::user(CONTINUE_PLACEHOLDER));
    }
    messages
}

pub fn trim_assistant_trailing_whitespace(mut messages: Vec<Message>) -> Vec<Message> {
    let Some(last_assistant) = messages
        .iter_mut()
        .rev()
        .find(|m| m.role == MessageRole::Assistant)
    else {
        return messages;
    };
    if let Some(MessagePart::Text { text }) = last_assistant
        .content
        .iter_mut()
        .rev()
        .find(|part| matches!(part, MessagePart::Text { .. }))
    {
        let trimmed_len = text.trim_end().len();
        text.truncate(trimmed_len);
    }
    messages
}

pub fn validate_messages(messages: &[Message]) -> ValidationResult {
    let mut issues = Vec::new();
    issues.extend(check_system_placement(messages));
    issues.extend(check_role_alternation(messages));
    issues.extend(check_tool_pairing(messages));
    issues.extend(check_empty_assistant(messages));
    issues.extend(check_trailing_whitespace(messages));
    ValidationResult {
        valid: issues.is_empty(),
        issues,
    }
}

pub fn check_system_placement(messages: &[Message]) -> Vec<ValidationIssue> {
    let block_end = messages
        .iter()
        .position(|m| m.role != MessageRole::System)
        .unwrap_or(messages.len());
    messages
        .iter()
        .enumerate()
        .skip(block_end)
        .filter(|(_, m)| m.role == MessageRole::System)
        .map(|(index, _)| {
            ValidationIssue::at(
                IssueCode::ScatteredSystem,
                index,
                format!("System message at index {index} appears after the conversation started"),
            )
        })
        .collect()
}

/// Tool messages belong to the user side; only assistant/assistant adjacency is invalid.
pub fn check_role_alternation(messages: &[Message]) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let mut previous: Option<MessageRole> = None;
    for (index, message) in messages.iter().enumerate() {
        if message.role == MessageRole::System {
            continue;
        }
        if message.role == MessageRole::Assistant && previous == Some(MessageRole::Assistant) {
            issues.push(ValidationIssue::at(
                IssueCode::ConsecutiveAssistant,
                index,
                format!("Assistant message at index {index} follows another assistant message"),
            ));
        }
        previous = Some(match message.role {
            MessageRole::Tool => MessageRole::User,
            role => role,
        });
    }
    issues
}

pub fn check_tool_pairing(messages: &[Message]) -> Vec<ValidationIssue> {
    let calls = tool_call_ids(messages);
    let results = tool_result_ids(messages);
    let mut issues = Vec::new();
    for (index, message) in messages.iter().enumerate() {
        for part in &message.content {
            match part {
                MessagePart::ToolCall { tool_call_id, tool_name, .. }
                    if message.role == MessageRole::Assistant
                        && !results.contains(tool_call_id) =>
                {
                    issues.push(ValidationIssue::for_tool_call(
                        IssueCode::OrphanedToolCall,
                        index,
                        tool_call_id,
                        format!("Tool call `{tool_name}` ({tool_call_id}) has no matching result"),
                    ));
                }
                MessagePart::ToolResult { tool_call_id, tool_name, .. }
                    if message.role == MessageRole::Tool && !calls.contains(tool_call_id) =>
                {
                    issues.push(ValidationIssue::for_tool_call(
                        IssueCode::OrphanedToolResult,
                        index,
                        tool_call_id,
                        format!("Tool result `{tool_name}` ({tool_call_id}) has no matching call"),
                    ));
                }
                _ => {}
            }
        }
    }
    issues
}

pub fn check_empty_assistant(messages: &[Message]) -> Vec<ValidationIssue> {
    messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == MessageRole::Assistant && !has_substance(m))
        .map(|(index, _)| {
            ValidationIssue::at(
                IssueCode::EmptyAssistant,
                index,
                format!("Assistant message at index {index} has no content"),
            )
        })
        .collect()
}

pub fn check_trailing_whitespace(messages: &[Message]) -> Vec<ValidationIssue> {
    let Some((index, message)) = messages
        .iter()
        .enumerate()
        .rev()
        .find(|(_, m)| m.role == MessageRole::Assistant)
    else {
        return Vec::new();
    };
    let last_text = message.content.iter().rev().find_map(|part| match part {
        MessagePart::Text { text } => Some(text),
        _ => None,
    });
    match last_text {
        Some(text) if text.trim_end().len() != text.len() => vec![ValidationIssue::at(
            IssueCode::AssistantTrailingWhitespace,
            index,
            format!("Final assistant message at index {index} ends with whitespace"),
        )],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: &str) -> MessagePart {
        MessagePart::ToolCall {
            tool_call_id: id.to_string(),
            tool_name: "read_file".to_string(),
            input: json!({"path": "src/lib.rs"}),
        }
    }

    fn assistant_with(parts: Vec<MessagePart>) -> Message {
        Message::new(MessageRole::Assistant, parts)
    }

    fn codes(messages: &[Message]) -> Vec<IssueCode> {
        validate_messages(messages)
            .issues
            .into_iter()
            .map(|issue| issue.code)
            .collect()
    }

    #[test]
    fn orphaned_call_is_removed_with_its_message_when_it_was_the_only_content() {
        let messages = vec![
            Message::user("read it"),
            assistant_with(vec![call("c1")]),
            Message::tool_result("c1", "read_file", json!("ok")),
            assistant_with(vec![call("c2")]),
        ];
        let cleaned = remove_orphaned_tool_messages(messages.clone());
        assert_eq!(cleaned.len(), messages.len() - 1);
        assert_eq!(cleaned[1], messages[1]);
    }

    #[test]
    fn orphaned_call_next_to_text_keeps_the_message() {
        let messages = vec![
            Message::user("go"),
            assistant_with(vec![MessagePart::text("Looking"), call("lost")]),
        ];
        let cleaned = remove_orphaned_tool_messages(messages);
        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned[1].content, vec![MessagePart::text("Looking")]);
    }

    #[test]
    fn orphaned_result_is_removed() {
        let messages = vec![
            Message::user("go"),
            Message::tool_result("ghost", "read_file", json!("stale")),
            Message::assistant("done"),
        ];
        let cleaned = remove_orphaned_tool_messages(messages);
        assert_eq!(cleaned.len(), 2);
        assert!(cleaned.iter().all(|m| m.role != MessageRole::Tool));
    }

    #[test]
    fn system_then_two_assistants_becomes_placeholder_and_merged() {
        let messages = vec![
            Message::system("You are helpful."),
            Message::assistant("first"),
            Message::assistant("second"),
        ];
        let sanitized = sanitize_messages(messages, SanitizeOptions::default());
        assert_eq!(
            sanitized,
            vec![
                Message::system("You are helpful."),
                Message::user(CONTINUE_PLACEHOLDER),
                assistant_with(vec![MessagePart::text("first"), MessagePart::text("second")]),
            ]
        );
    }

    #[test]
    fn empty_assistant_messages_are_dropped_and_neighbours_merged() {
        let messages = vec![
            Message::user("hi"),
            assistant_with(vec![MessagePart::text("a")]),
            assistant_with(vec![MessagePart::text("   ")]),
            assistant_with(vec![MessagePart::text(""), MessagePart::text("b")]),
        ];
        let sanitized = sanitize_messages(messages, SanitizeOptions::default());
        assert_eq!(sanitized.len(), 2);
        assert_eq!(
            sanitized[1].content,
            vec![MessagePart::text("a"), MessagePart::text("b")]
        );
    }

    #[test]
    fn tool_message_first_does_not_need_placeholder() {
        let messages = vec![
            Message::system("sys"),
            Message::tool_result("c1", "glob", json!([])),
        ];
        let sanitized = ensure_user_first(messages.clone());
        assert_eq!(sanitized, messages);
    }

    #[test]
    fn trailing_whitespace_trim_runs_without_auto_fix() {
        let messages = vec![
            Message::assistant("orphan first"),
            Message::user("next"),
            assistant_with(vec![MessagePart::text("answer \n\t"), call("c9")]),
        ];
        let sanitized = sanitize_messages(messages, SanitizeOptions { auto_fix: false });
        assert_eq!(sanitized.len(), 3);
        assert_eq!(sanitized[0].role, MessageRole::Assistant);
        assert_eq!(sanitized[2].content[0], MessagePart::text("answer"));
        assert!(sanitized[2].has_tool_call());
    }

    #[test]
    fn only_last_assistant_message_is_trimmed() {
        let messages = vec![
            Message::user("q"),
            Message::assistant("keep  "),
            Message::user("q2"),
            Message::assistant("trim  "),
        ];
        let sanitized = trim_assistant_trailing_whitespace(messages);
        assert_eq!(sanitized[1].text(), "keep  ");
        assert_eq!(sanitized[3].text(), "trim");
    }

    #[test]
    fn validation_reports_each_problem() {
        let messages = vec![
            Message::user("q"),
            Message::system("late system"),
            assistant_with(vec![call("c1")]),
            Message::assistant("text "),
            Message::tool_result("c2", "read_file", json!("x")),
            assistant_with(vec![]),
        ];
        let found = codes(&messages);
        assert!(found.contains(&IssueCode::ScatteredSystem));
        assert!(found.contains(&IssueCode::ConsecutiveAssistant));
        assert!(found.contains(&IssueCode::OrphanedToolCall));
        assert!(found.contains(&IssueCode::OrphanedToolResult));
        assert!(found.contains(&IssueCode::EmptyAssistant));
        assert!(!found.contains(&IssueCode::AssistantTrailingWhitespace));
    }

    #[test]
    fn tool_messages_count_as_user_side_for_alternation() {
        let messages = vec![
            Message::user("q"),
            assistant_with(vec![call("c1")]),
            Message::tool_result("c1", "read_file", json!("x")),
            Message::assistant("done"),
        ];
        assert!(validate_messages(&messages).valid);
    }

    #[test]
    fn sanitize_and_validate_reports_fixed_issues() {
        let messages = vec![
            Message::system("sys"),
            Message::assistant("one "),
            assistant_with(vec![call("dangling")]),
        ];
        let report = sanitize_and_validate(messages, SanitizeOptions::default());
        assert!(!report.issues_before.is_empty());
        assert!(report.issues_after.is_empty());
        assert_eq!(report.fixed_count(), report.issues_before.len());
        assert_eq!(report.messages.len(), 3);
        assert_eq!(report.messages[2].text(), "one");
    }

    #[test]
    fn issue_codes_serialize_in_wire_form() {
        let value = serde_json::to_value(IssueCode::AssistantTrailingWhitespace).expect("serialize");
        assert_eq!(value, json!("ASSISTANT_TRAILING_WHITESPACE"));
    }
}
