//! Git operations needed by the worktree pool.
//!
//! Everything goes through [`GitBackend`] so the pool can be driven by a fake in
//! tests. [`GitCli`] shells out to the `git` binary.

use std::path::Path;
use std::process::Output;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use taskloom_types::MergeResult;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

impl StatusEntry {
    pub fn is_conflicted(&self) -> bool {
        matches!(
            self.code.as_str(),
            "DD" | "AU" | "UD" | "UA" | "DU" | "AA" | "UU"
        )
    }
}

#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Creates (or reuses) a linked worktree at `path` checked out on `branch`,
    /// branching from `base` when the branch does not exist yet.
    async fn create_worktree(
        &self,
        repo_root: &Path,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<()>;

    /// Discards every change in the worktree and points `branch` back at `base`.
    async fn reset_worktree(&self, path: &Path, branch: &str, base: &str) -> Result<()>;

    /// Stages and commits everything. Returns false when there was nothing to commit.
    async fn commit_all(&self, workdir: &Path, message: &str) -> Result<bool>;

    /// Merges `source` into `target` inside `repo_root`. Conflicts are reported in
    /// the result, not as an error.
    async fn merge_branch(&self, repo_root: &Path, target: &str, source: &str)
        -> Result<MergeResult>;

    async fn abort_merge(&self, repo_root: &Path) -> Result<()>;

    async fn continue_merge(&self, repo_root: &Path) -> Result<MergeResult>;

    async fn list_conflicts(&self, repo_root: &Path) -> Result<Vec<String>>;

    async fn changed_files(&self, workdir: &Path) -> Result<Vec<StatusEntry>>;
}

#[derive(Debug, Clone, Default)]
pub struct GitCli {
    identity: Option<(String, String)>,
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit identity passed with `-c user.name/user.email` on every invocation.
    pub fn with_identity(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.identity = Some((name.into(), email.into()));
        self
    }

    async fn current_branch(&self, workdir: &Path) -> Result<String> {
        let out = self
            .run_capture(workdir, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        Ok(out.trim().to_string())
    }

    async fn branch_exists(&self, workdir: &Path, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{branch}");
        let output = self
            .run(workdir, &["show-ref", "--verify", "--quiet", &reference])
            .await?;
        Ok(output.status.success())
    }

    async fn has_staged_changes(&self, workdir: &Path) -> Result<bool> {
        let out = self
            .run_capture(workdir, &["diff", "--cached", "--name-only"])
            .await?;
        Ok(!out.trim().is_empty())
    }

    async fn run_capture(&self, workdir: &Path, args: &[&str]) -> Result<String> {
        let output = self.run_checked(workdir, args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn run_checked(&self, workdir: &Path, args: &[&str]) -> Result<Output> {
        let output = self.run(workdir, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    async fn run(&self, workdir: &Path, args: &[&str]) -> Result<Output> {
        let mut command = Command::new("git");
        if let Some((name, email)) = &self.identity {
            command
                .arg("-c")
                .arg(format!("user.name={name}"))
                .arg("-c")
                .arg(format!("user.email={email}"));
        }
        command
            .args(args)
            .current_dir(workdir)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

#[async_trait]
impl GitBackend for GitCli {
    async fn create_worktree(
        &self,
        repo_root: &Path,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<()> {
        if path.join(".git").exists() {
            debug!(path = %path.display(), "reusing existing worktree");
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let path_arg = path_arg(path);
        if self.branch_exists(repo_root, branch).await? {
            self.run_checked(repo_root, &["worktree", "add", &path_arg, branch])
                .await?;
        } else {
            self.run_checked(
                repo_root,
                &["worktree", "add", "-b", branch, &path_arg, base],
            )
            .await?;
        }
        debug!(path = %path.display(), branch, "worktree created");
        Ok(())
    }

    async fn reset_worktree(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        self.run_checked(path, &["reset", "--hard"]).await?;
        self.run_checked(path, &["clean", "-fdx"]).await?;
        self.run_checked(path, &["checkout", "-B", branch, base]).await?;
        debug!(path = %path.display(), branch, base, "worktree reset");
        Ok(())
    }

    async fn commit_all(&self, workdir: &Path, message: &str) -> Result<bool> {
        self.run_checked(workdir, &["add", "-A"]).await?;
        if !self.has_staged_changes(workdir).await? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        self.run_checked(workdir, &["commit", "-m", message]).await?;
        Ok(true)
    }

    async fn merge_branch(
        &self,
        repo_root: &Path,
        target: &str,
        source: &str,
    ) -> Result<MergeResult> {
        if self.current_branch(repo_root).await? != target {
            self.run_checked(repo_root, &["checkout", target]).await?;
        }
        let output = self
            .run(repo_root, &["merge", "--no-ff", "--no-edit", source])
            .await?;
        if output.status.success() {
            return Ok(MergeResult::merged(format!("Merged {source} into {target}")));
        }
        let conflicts = self.list_conflicts(repo_root).await?;
        if conflicts.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git merge {source} failed: {}", stderr.trim()));
        }
        warn!(source, target, conflicts = conflicts.len(), "merge stopped on conflicts");
        Ok(MergeResult::conflicted(
            conflicts,
            format!("Merging {source} into {target} produced conflicts"),
        ))
    }

    async fn abort_merge(&self, repo_root: &Path) -> Result<()> {
        self.run_checked(repo_root, &["merge", "--abort"]).await?;
        Ok(())
    }

    async fn continue_merge(&self, repo_root: &Path) -> Result<MergeResult> {
        let conflicts = self.list_conflicts(repo_root).await?;
        if !conflicts.is_empty() {
            return Ok(MergeResult::conflicted(
                conflicts,
                "Conflicts remain; resolve them before continuing",
            ));
        }
        self.run_checked(repo_root, &["add", "-A"]).await?;
        self.run_checked(repo_root, &["commit", "--no-edit"]).await?;
        Ok(MergeResult::merged("Merge completed"))
    }

    async fn list_conflicts(&self, repo_root: &Path) -> Result<Vec<String>> {
        let out = self
            .run_capture(repo_root, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    async fn changed_files(&self, workdir: &Path) -> Result<Vec<StatusEntry>> {
        let out = self
            .run_capture(workdir, &["status", "--porcelain=v1", "-uall"])
            .await?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_status_line)
            .collect()
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

pub fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 || !line.is_char_boundary(2) || !line.is_char_boundary(3) {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, renamed)) = path.split_once("->") {
        path = renamed.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
