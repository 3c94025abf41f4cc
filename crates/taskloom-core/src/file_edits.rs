//! `write_file` / `edit_file` tool calls turned into reviewable [`PendingEdit`]s.

use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs;

use taskloom_types::{EditApplyResult, EditOperation, PendingEdit, ToolCallRecord};

use crate::edit_review::EditCallbacks;
use crate::error::ToolPathError;

pub const WRITE_FILE_TOOL: &str = "write_file";
pub const EDIT_FILE_TOOL: &str = "edit_file";

pub fn is_file_edit_tool(name: &str) -> bool {
    matches!(name, WRITE_FILE_TOOL | EDIT_FILE_TOOL)
}

#[derive(Debug, Deserialize)]
struct WriteFileArgs {
    path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct EditFileArgs {
    path: String,
    old_string: String,
    new_string: String,
    #[serde(default)]
    replace_all: bool,
}

/// A pending edit plus the absolute file it targets.
#[derive(Debug, Clone)]
pub struct ProposedEdit {
    pub pending: PendingEdit,
    pub target: PathBuf,
}

impl ProposedEdit {
    pub fn applier(&self) -> FileEditApplier {
        FileEditApplier {
            target: self.target.clone(),
            expected_original: self.pending.original_content.clone(),
            new_content: self.pending.new_content.clone(),
        }
    }
}

/// Computes the edit a file tool call would make without touching the disk.
pub async fn propose_edit(root: &Path, call: &ToolCallRecord) -> anyhow::Result<ProposedEdit> {
    match call.tool_name.as_str() {
        WRITE_FILE_TOOL => {
            let args: WriteFileArgs = serde_json::from_value(call.input.clone())
                .context("invalid write_file arguments")?;
            let target = resolve_in_root(root, &args.path)?;
            let original = read_if_exists(&target).await?;
            Ok(ProposedEdit {
                pending: PendingEdit::new(
                    args.path,
                    original,
                    args.content,
                    EditOperation::Write,
                ),
                target,
            })
        }
        EDIT_FILE_TOOL => {
            let args: EditFileArgs = serde_json::from_value(call.input.clone())
                .context("invalid edit_file arguments")?;
            let target = resolve_in_root(root, &args.path)?;
            let content = fs::read_to_string(&target)
                .await
                .with_context(|| format!("failed to read '{}'", args.path))?;
            let new_content = replace_text(&content, &args)?;
            Ok(ProposedEdit {
                pending: PendingEdit::new(args.path, content, new_content, EditOperation::Edit),
                target,
            })
        }
        other => Err(anyhow!("{other} is not a file edit tool")),
    }
}

fn replace_text(content: &str, args: &EditFileArgs) -> anyhow::Result<String> {
    if args.old_string.is_empty() {
        bail!("old_string must not be empty");
    }
    let count = content.matches(&args.old_string).count();
    if count == 0 {
        bail!("String '{}' not found in '{}'", args.old_string, args.path);
    }
    if args.replace_all {
        return Ok(content.replace(&args.old_string, &args.new_string));
    }
    if count > 1 {
        bail!(
            "String '{}' appears {count} times in '{}'. Use replace_all: true to replace all occurrences",
            args.old_string,
            args.path
        );
    }
    Ok(content.replacen(&args.old_string, &args.new_string, 1))
}

/// Resolves `raw` against `root`, rejecting anything that lands outside it.
/// Resolution is lexical so files that do not exist yet can be targeted.
pub fn resolve_in_root(root: &Path, raw: &str) -> Result<PathBuf, ToolPathError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ToolPathError::Empty);
    }
    let candidate = Path::new(trimmed);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    let resolved = normalize(&joined);
    if !resolved.starts_with(normalize(root)) {
        return Err(ToolPathError::OutsideRoot(raw.to_string()));
    }
    Ok(resolved)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

async fn read_if_exists(path: &Path) -> anyhow::Result<String> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Writes an approved edit to disk. Refuses if the file changed after the edit
/// was proposed.
pub struct FileEditApplier {
    target: PathBuf,
    expected_original: String,
    new_content: String,
}

impl FileEditApplier {
    pub async fn apply(&self) -> anyhow::Result<EditApplyResult> {
        let current = read_if_exists(&self.target).await?;
        if current != self.expected_original {
            bail!(
                "{} changed since the edit was proposed",
                self.target.display()
            );
        }
        if let Some(parent) = self.target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.target, &self.new_content)
            .await
            .with_context(|| format!("failed to write {}", self.target.display()))?;
        Ok(EditApplyResult::ok(format!(
            "Wrote {} bytes to {}",
            self.new_content.len(),
            self.target.display()
        )))
    }
}

#[async_trait]
impl EditCallbacks for FileEditApplier {
    async fn on_approve(&self) -> anyhow::Result<EditApplyResult> {
        self.apply().await
    }

    async fn on_reject(&self, _feedback: Option<String>) -> anyhow::Result<EditApplyResult> {
        Ok(EditApplyResult::ok(format!(
            "Discarded edit to {}",
            self.target.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn call(name: &str, input: serde_json::Value) -> ToolCallRecord {
        ToolCallRecord::new("call-1", name, input)
    }

    #[test]
    fn paths_outside_root_are_rejected() {
        let root = Path::new("/work/pool-0");
        assert_eq!(
            resolve_in_root(root, "src/../lib.rs").expect("inside"),
            PathBuf::from("/work/pool-0/lib.rs")
        );
        assert!(matches!(
            resolve_in_root(root, "../pool-1/secret.rs"),
            Err(ToolPathError::OutsideRoot(_))
        ));
        assert!(matches!(
            resolve_in_root(root, "/etc/passwd"),
            Err(ToolPathError::OutsideRoot(_))
        ));
        assert!(matches!(resolve_in_root(root, "  "), Err(ToolPathError::Empty)));
    }

    #[tokio::test]
    async fn write_file_proposal_leaves_disk_untouched_until_applied() {
        let temp = TempDir::new().expect("tempdir");
        let proposal = propose_edit(
            temp.path(),
            &call(WRITE_FILE_TOOL, json!({"path": "src/new.rs", "content": "fn main() {}\n"})),
        )
        .await
        .expect("propose");

        assert_eq!(proposal.pending.operation, EditOperation::Write);
        assert_eq!(proposal.pending.original_content, "");
        assert!(!proposal.target.exists());

        let result = proposal.applier().on_approve().await.expect("apply");
        assert!(result.success);
        assert_eq!(
            std::fs::read_to_string(temp.path().join("src/new.rs")).expect("read"),
            "fn main() {}\n"
        );
    }

    #[tokio::test]
    async fn edit_file_requires_unique_match_unless_replace_all() {
        let temp = TempDir::new().expect("tempdir");
        std::fs::write(temp.path().join("a.txt"), "x = 1\nx = 1\n").expect("write");

        let ambiguous = propose_edit(
            temp.path(),
            &call(
                EDIT_FILE_TOOL,
                json!({"path": "a.txt", "old_string": "x = 1", "new_string": "x = 2"}),
            ),
        )
        .await;
        assert!(ambiguous.is_err());

        let all = propose_edit(
            temp.path(),
            &call(
                EDIT_FILE_TOOL,
                json!({"path": "a.txt", "old_string": "x = 1", "new_string": "x = 2", "replace_all": true}),
            ),
        )
        .await
        .expect("propose");
        assert_eq!(all.pending.new_content, "x = 2\nx = 2\n");
        assert_eq!(all.pending.original_content, "x = 1\nx = 1\n");
    }

    #[tokio::test]
    async fn stale_edit_is_refused_and_rejection_keeps_file() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("b.txt");
        std::fs::write(&path, "before").expect("write");
        let proposal = propose_edit(
            temp.path(),
            &call(
                EDIT_FILE_TOOL,
                json!({"path": "b.txt", "old_string": "before", "new_string": "after"}),
            ),
        )
        .await
        .expect("propose");

        let applier = proposal.applier();
        assert!(applier.on_reject(None).await.expect("reject").success);
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "before");

        std::fs::write(&path, "someone else").expect("write");
        assert!(applier.on_approve().await.is_err());
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "someone else");
    }
}
