use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use taskloom_observability::{init_process_logging, LoggingInitInfo, ProcessKind, WorkerGuard};
use tokio::fs;

use crate::sanitizer::SanitizeOptions;
use crate::worktree_pool::PoolSettings;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SanitizerConfig {
    pub auto_fix: bool,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self { auto_fix: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub project_root: PathBuf,
    /// Parent directory of the pooled worktrees. Defaults to `<project_root>/.taskloom/worktrees`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_dir: Option<PathBuf>,
    pub pool_capacity: usize,
    pub main_branch: String,
    pub branch_prefix: String,
    pub max_iterations: usize,
    pub max_consecutive_tool_errors: u32,
    pub require_edit_approval: bool,
    pub suppress_reasoning: bool,
    pub sanitizer: SanitizerConfig,
    /// JSONL log directory. Defaults to [`default_logs_dir`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs_dir: Option<PathBuf>,
    pub log_retention_days: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            worktree_dir: None,
            pool_capacity: 3,
            main_branch: "main".to_string(),
            branch_prefix: "taskloom".to_string(),
            max_iterations: 25,
            max_consecutive_tool_errors: 3,
            require_edit_approval: true,
            suppress_reasoning: false,
            sanitizer: SanitizerConfig::default(),
            logs_dir: None,
            log_retention_days: 7,
        }
    }
}

impl RuntimeConfig {
    /// Layers defaults, the JSON file at `path` (if any), `TASKLOOM_*` environment
    /// variables and `overrides`, in that order.
    pub async fn load(path: Option<&Path>, overrides: Value) -> anyhow::Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;
        if let Some(path) = path {
            deep_merge(&mut merged, &read_json_file(path).await?);
        }
        deep_merge(&mut merged, &env_layer());
        deep_merge(&mut merged, &overrides);
        let config: Self = serde_json::from_value(merged)?;
        tracing::debug!(
            project_root = %config.project_root.display(),
            pool_capacity = config.pool_capacity,
            "runtime config loaded"
        );
        Ok(config)
    }

    pub fn resolved_worktree_dir(&self) -> PathBuf {
        self.worktree_dir
            .clone()
            .unwrap_or_else(|| self.project_root.join(".taskloom").join("worktrees"))
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            project_root: self.project_root.clone(),
            worktree_dir: self.resolved_worktree_dir(),
            capacity: self.pool_capacity,
            main_branch: self.main_branch.clone(),
            branch_prefix: self.branch_prefix.clone(),
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.logs_dir.clone().unwrap_or_else(default_logs_dir)
    }

    /// Installs console and daily JSONL logging. Keep the guard alive for the
    /// life of the process or buffered log lines are lost.
    pub fn init_logging(
        &self,
        process: ProcessKind,
    ) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
        init_process_logging(process, &self.logs_dir(), self.log_retention_days)
    }

    pub fn sanitize_options(&self) -> SanitizeOptions {
        SanitizeOptions {
            auto_fix: self.sanitizer.auto_fix,
        }
    }
}

/// Per-user data directory (`<data_local_dir>/taskloom`), used for logs.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("taskloom"))
        .unwrap_or_else(|| PathBuf::from(".taskloom"))
}

pub fn default_logs_dir() -> PathBuf {
    taskloom_observability::canonical_logs_dir_from_root(&default_data_dir())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => Ok(value),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable config file");
            Ok(empty_object())
        }
    }
}

fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();

    if let Some(capacity) =
        lookup("TASKLOOM_POOL_CAPACITY").and_then(|v| v.trim().parse::<usize>().ok())
    {
        deep_merge(&mut root, &json!({ "pool_capacity": capacity }));
    }
    if let Some(limit) =
        lookup("TASKLOOM_MAX_TOOL_ERRORS").and_then(|v| v.trim().parse::<u32>().ok())
    {
        deep_merge(&mut root, &json!({ "max_consecutive_tool_errors": limit }));
    }
    if let Some(v) = lookup("TASKLOOM_REQUIRE_EDIT_APPROVAL").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({ "require_edit_approval": v }));
    }
    if let Some(v) = lookup("TASKLOOM_SUPPRESS_REASONING").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({ "suppress_reasoning": v }));
    }
    if let Some(dir) = lookup("TASKLOOM_LOGS_DIR") {
        if !dir.trim().is_empty() {
            deep_merge(&mut root, &json!({ "logs_dir": dir.trim() }));
        }
    }
    if let Some(branch) = lookup("TASKLOOM_MAIN_BRANCH") {
        if !branch.trim().is_empty() {
            deep_merge(&mut root, &json!({ "main_branch": branch.trim() }));
        }
    }

    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
