use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use taskloom_types::{MergeResult, WorktreeInfo};

use crate::error::PoolError;
use crate::event_bus::EventBus;
use crate::git::GitBackend;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub project_root: PathBuf,
    pub worktree_dir: PathBuf,
    pub capacity: usize,
    pub main_branch: String,
    pub branch_prefix: String,
}

#[derive(Default)]
struct PoolState {
    /// `None` until the slot's worktree has been created on disk.
    slots: Vec<Option<WorktreeInfo>>,
    merging: Option<usize>,
}

impl PoolState {
    fn index_of(&self, task_id: &str) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|info| info.in_use && info.task_id.as_deref() == Some(task_id))
        })
    }
}

/// Fixed set of git worktrees handed out to concurrent tasks.
///
/// Every operation takes the one state mutex and keeps it across its git calls,
/// so two tasks can never claim the same slot or interleave a merge. Root
/// lookups read a separate task-to-path map and never wait on git.
#[derive(Clone)]
pub struct WorktreePool {
    state: Arc<Mutex<PoolState>>,
    roots: Arc<RwLock<HashMap<String, PathBuf>>>,
    settings: Arc<PoolSettings>,
    git: Arc<dyn GitBackend>,
    event_bus: EventBus,
}

impl WorktreePool {
    pub fn new(settings: PoolSettings, git: Arc<dyn GitBackend>, event_bus: EventBus) -> Self {
        let state = PoolState {
            slots: vec![None; settings.capacity],
            merging: None,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            roots: Arc::new(RwLock::new(HashMap::new())),
            settings: Arc::new(settings),
            git,
            event_bus,
        }
    }

    pub fn capacity(&self) -> usize {
        self.settings.capacity
    }

    pub fn project_root(&self) -> &PathBuf {
        &self.settings.project_root
    }

    /// Returns the task's slot, claiming the lowest free one if needed.
    /// `Ok(None)` means the pool is full and the task should use the project root.
    pub async fn assign(&self, task_id: &str) -> Result<Option<usize>, PoolError> {
        let mut state = self.state.lock().await;
        if let Some(index) = state.index_of(task_id) {
            return Ok(Some(index));
        }
        let merging = state.merging;
        let Some(index) = state.slots.iter().enumerate().position(|(i, slot)| {
            Some(i) != merging && slot.as_ref().map_or(true, |info| !info.in_use)
        }) else {
            warn!(task_id, capacity = self.settings.capacity, "worktree pool exhausted");
            return Ok(None);
        };

        let now = Utc::now();
        let info = match state.slots[index].clone() {
            Some(existing) => {
                // The previous task may have left commits or stray files behind.
                self.git
                    .reset_worktree(
                        &existing.path,
                        &existing.branch_name,
                        &self.settings.main_branch,
                    )
                    .await?;
                WorktreeInfo {
                    changes_count: 0,
                    ..existing
                }
            }
            None => {
                let path = self.slot_path(index);
                let branch_name = self.slot_branch(index);
                self.git
                    .create_worktree(
                        &self.settings.project_root,
                        &path,
                        &branch_name,
                        &self.settings.main_branch,
                    )
                    .await?;
                WorktreeInfo {
                    pool_index: index,
                    path,
                    branch_name,
                    in_use: false,
                    task_id: None,
                    changes_count: 0,
                    last_used: now,
                    created_at: now,
                }
            }
        };
        let info = WorktreeInfo {
            in_use: true,
            task_id: Some(task_id.to_string()),
            last_used: now,
            ..info
        };
        info!(task_id, pool_index = index, path = %info.path.display(), "worktree assigned");
        self.event_bus.emit(
            "worktree.assigned",
            json!({"taskID": task_id, "poolIndex": index, "path": info.path}),
        );
        self.roots
            .write()
            .await
            .insert(task_id.to_string(), info.path.clone());
        state.slots[index] = Some(info);
        Ok(Some(index))
    }

    /// Frees the task's slot. The worktree stays on disk and is reset when the
    /// next task claims it.
    pub async fn release(&self, task_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(index) = state.index_of(task_id) else {
            return false;
        };
        if let Some(info) = state.slots[index].as_mut() {
            info.in_use = false;
            info.task_id = None;
            info.last_used = Utc::now();
        }
        self.roots.write().await.remove(task_id);
        info!(task_id, pool_index = index, "worktree released");
        self.event_bus.emit(
            "worktree.released",
            json!({"taskID": task_id, "poolIndex": index}),
        );
        true
    }

    pub async fn assigned_index(&self, task_id: &str) -> Option<usize> {
        self.state.lock().await.index_of(task_id)
    }

    pub async fn get_effective_root(&self, task_id: &str) -> PathBuf {
        self.roots
            .read()
            .await
            .get(task_id)
            .cloned()
            .unwrap_or_else(|| self.settings.project_root.clone())
    }

    pub async fn snapshot(&self) -> Vec<WorktreeInfo> {
        self.state
            .lock()
            .await
            .slots
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub async fn refresh_changes(&self, task_id: &str) -> Result<usize, PoolError> {
        let mut state = self.state.lock().await;
        let index = state
            .index_of(task_id)
            .ok_or_else(|| PoolError::NotAssigned(task_id.to_string()))?;
        let Some(info) = state.slots[index].as_mut() else {
            return Err(PoolError::NotAssigned(task_id.to_string()));
        };
        let changed = self.git.changed_files(&info.path).await?;
        info.changes_count = changed.len();
        Ok(info.changes_count)
    }

    /// Commits the task's worktree and merges its branch into the main branch.
    /// Conflicts leave the merge open for [`Self::continue_merge`] or
    /// [`Self::abort_merge`].
    pub async fn merge(&self, task_id: &str) -> Result<MergeResult, PoolError> {
        let mut state = self.state.lock().await;
        if let Some(open) = state.merging {
            return Err(PoolError::MergeInProgress(open));
        }
        let index = state
            .index_of(task_id)
            .ok_or_else(|| PoolError::NotAssigned(task_id.to_string()))?;
        let Some(info) = state.slots[index].clone() else {
            return Err(PoolError::NotAssigned(task_id.to_string()));
        };

        self.git
            .commit_all(&info.path, &format!("taskloom: changes from task {task_id}"))
            .await?;
        let result = self
            .git
            .merge_branch(
                &self.settings.project_root,
                &self.settings.main_branch,
                &info.branch_name,
            )
            .await?;

        if result.has_conflicts {
            state.merging = Some(index);
            warn!(
                task_id,
                pool_index = index,
                conflicts = result.conflicted_files.len(),
                "merge has conflicts"
            );
        } else if let Some(slot) = state.slots[index].as_mut() {
            slot.changes_count = 0;
            info!(task_id, pool_index = index, "worktree merged");
        }
        self.emit_merge(Some(task_id), index, "merge", &result);
        Ok(result)
    }

    pub async fn abort_merge(&self) -> Result<MergeResult, PoolError> {
        let mut state = self.state.lock().await;
        let index = state.merging.ok_or(PoolError::NoMergeInProgress)?;
        self.git.abort_merge(&self.settings.project_root).await?;
        state.merging = None;
        let result = MergeResult {
            success: true,
            message: "Merge aborted".to_string(),
            ..Default::default()
        };
        self.emit_merge(None, index, "abort", &result);
        Ok(result)
    }

    pub async fn continue_merge(&self) -> Result<MergeResult, PoolError> {
        let mut state = self.state.lock().await;
        let index = state.merging.ok_or(PoolError::NoMergeInProgress)?;
        let result = self.git.continue_merge(&self.settings.project_root).await?;
        if !result.has_conflicts {
            state.merging = None;
            if let Some(slot) = state.slots[index].as_mut() {
                slot.changes_count = 0;
            }
        }
        self.emit_merge(None, index, "continue", &result);
        Ok(result)
    }

    pub async fn merge_in_progress(&self) -> Option<usize> {
        self.state.lock().await.merging
    }

    /// Task owning the slot whose merge is still open.
    pub async fn merging_task(&self) -> Option<String> {
        let state = self.state.lock().await;
        let index = state.merging?;
        state.slots[index]
            .as_ref()
            .and_then(|info| info.task_id.clone())
    }

    fn slot_path(&self, index: usize) -> PathBuf {
        self.settings.worktree_dir.join(format!("pool-{index}"))
    }

    fn slot_branch(&self, index: usize) -> String {
        format!("{}/pool-{index}", self.settings.branch_prefix)
    }

    fn emit_merge(&self, task_id: Option<&str>, index: usize, action: &str, result: &MergeResult) {
        self.event_bus.emit(
            "worktree.merge",
            json!({
                "taskID": task_id,
                "poolIndex": index,
                "action": action,
                "result": result,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::StatusEntry;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeGit {
        calls: StdMutex<Vec<String>>,
        conflicts: StdMutex<Vec<String>>,
        merge_entered: Notify,
        merge_gate: Option<Arc<Notify>>,
    }

    impl FakeGit {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls").clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().expect("calls").push(call);
        }
    }

    #[async_trait]
    impl GitBackend for FakeGit {
        async fn create_worktree(
            &self,
            _repo_root: &Path,
            path: &Path,
            branch: &str,
            base: &str,
        ) -> anyhow::Result<()> {
            self.record(format!("create {} {branch} {base}", path.display()));
            Ok(())
        }

        async fn reset_worktree(
            &self,
            path: &Path,
            branch: &str,
            base: &str,
        ) -> anyhow::Result<()> {
            self.record(format!("reset {} {branch} {base}", path.display()));
            Ok(())
        }

        async fn commit_all(&self, workdir: &Path, _message: &str) -> anyhow::Result<bool> {
            self.record(format!("commit {}", workdir.display()));
            Ok(true)
        }

        async fn merge_branch(
            &self,
            _repo_root: &Path,
            target: &str,
            source: &str,
        ) -> anyhow::Result<MergeResult> {
            self.record(format!("merge {source} -> {target}"));
            if let Some(gate) = &self.merge_gate {
                self.merge_entered.notify_one();
                gate.notified().await;
            }
            let conflicts = self.conflicts.lock().expect("conflicts").clone();
            if conflicts.is_empty() {
                Ok(MergeResult::merged("merged"))
            } else {
                Ok(MergeResult::conflicted(conflicts, "conflicts"))
            }
        }

        async fn abort_merge(&self, _repo_root: &Path) -> anyhow::Result<()> {
            self.record("abort".to_string());
            Ok(())
        }

        async fn continue_merge(&self, _repo_root: &Path) -> anyhow::Result<MergeResult> {
            self.record("continue".to_string());
            let conflicts = self.conflicts.lock().expect("conflicts").clone();
            if conflicts.is_empty() {
                Ok(MergeResult::merged("merge completed"))
            } else {
                Ok(MergeResult::conflicted(conflicts, "still conflicted"))
            }
        }

        async fn list_conflicts(&self, _repo_root: &Path) -> anyhow::Result<Vec<String>> {
            Ok(self.conflicts.lock().expect("conflicts").clone())
        }

        async fn changed_files(&self, _workdir: &Path) -> anyhow::Result<Vec<StatusEntry>> {
            Ok(vec![
                StatusEntry {
                    code: " M".to_string(),
                    path: "src/lib.rs".to_string(),
                },
                StatusEntry {
                    code: "??".to_string(),
                    path: "new.rs".to_string(),
                },
            ])
        }
    }

    fn pool(capacity: usize) -> (WorktreePool, Arc<FakeGit>) {
        pool_with(capacity, FakeGit::default())
    }

    fn pool_with(capacity: usize, git: FakeGit) -> (WorktreePool, Arc<FakeGit>) {
        let git = Arc::new(git);
        let settings = PoolSettings {
            project_root: PathBuf::from("/repo"),
            worktree_dir: PathBuf::from("/repo/.taskloom/worktrees"),
            capacity,
            main_branch: "main".to_string(),
            branch_prefix: "taskloom".to_string(),
        };
        (
            WorktreePool::new(settings, git.clone(), EventBus::new()),
            git,
        )
    }

    #[tokio::test]
    async fn tasks_up_to_capacity_get_distinct_roots() {
        let (pool, git) = pool(3);
        let mut roots = HashSet::new();
        for i in 0..3 {
            let task = format!("task-{i}");
            assert_eq!(pool.assign(&task).await.expect("assign"), Some(i));
            roots.insert(pool.get_effective_root(&task).await);
        }
        assert_eq!(roots.len(), 3);
        assert!(!roots.contains(&PathBuf::from("/repo")));

        assert_eq!(pool.assign("task-3").await.expect("assign"), None);
        assert_eq!(pool.get_effective_root("task-3").await, PathBuf::from("/repo"));
        assert_eq!(
            git.calls()[0],
            "create /repo/.taskloom/worktrees/pool-0 taskloom/pool-0 main"
        );
    }

    #[tokio::test]
    async fn assign_is_idempotent_and_release_reuses_the_worktree() {
        let (pool, git) = pool(2);
        assert_eq!(pool.assign("a").await.expect("assign"), Some(0));
        assert_eq!(pool.assign("a").await.expect("assign"), Some(0));
        assert_eq!(pool.assign("b").await.expect("assign"), Some(1));

        assert!(pool.release("a").await);
        assert!(!pool.release("a").await);
        assert_eq!(pool.assign("c").await.expect("assign"), Some(0));

        let creates = git
            .calls()
            .into_iter()
            .filter(|call| call.starts_with("create"))
            .count();
        assert_eq!(creates, 2);
        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot[0].task_id.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn reused_slot_is_reset_before_the_next_task() {
        let (pool, git) = pool(1);
        assert_eq!(pool.assign("a").await.expect("assign"), Some(0));
        assert!(!git.calls().iter().any(|call| call.starts_with("reset")));

        assert!(pool.release("a").await);
        assert_eq!(pool.assign("b").await.expect("assign"), Some(0));
        assert_eq!(
            git.calls().last().map(String::as_str),
            Some("reset /repo/.taskloom/worktrees/pool-0 taskloom/pool-0 main")
        );
        assert_eq!(pool.snapshot().await[0].changes_count, 0);

        // Re-assigning the same task keeps its work.
        pool.assign("b").await.expect("assign");
        let resets = git
            .calls()
            .into_iter()
            .filter(|call| call.starts_with("reset"))
            .count();
        assert_eq!(resets, 1);
    }

    #[tokio::test]
    async fn released_task_falls_back_to_the_project_root() {
        let (pool, _git) = pool(1);
        pool.assign("a").await.expect("assign");
        assert_eq!(
            pool.get_effective_root("a").await,
            PathBuf::from("/repo/.taskloom/worktrees/pool-0")
        );
        pool.release("a").await;
        assert_eq!(pool.get_effective_root("a").await, PathBuf::from("/repo"));
    }

    #[tokio::test]
    async fn root_lookup_does_not_wait_for_a_running_merge() {
        let gate = Arc::new(Notify::new());
        let (pool, git) = pool_with(
            2,
            FakeGit {
                merge_gate: Some(gate.clone()),
                ..FakeGit::default()
            },
        );
        pool.assign("a").await.expect("assign");
        pool.assign("b").await.expect("assign");

        let merging = pool.clone();
        let merge = tokio::spawn(async move { merging.merge("a").await });
        git.merge_entered.notified().await;

        let root = tokio::time::timeout(Duration::from_millis(500), pool.get_effective_root("b"))
            .await
            .expect("root lookup blocked by merge");
        assert_eq!(root, PathBuf::from("/repo/.taskloom/worktrees/pool-1"));

        gate.notify_one();
        assert!(merge.await.expect("join").expect("merge").success);
    }

    #[tokio::test]
    async fn concurrent_assignment_never_shares_a_slot() {
        let (pool, _git) = pool(3);
        let mut handles = Vec::new();
        for i in 0..6 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.assign(&format!("task-{i}")).await.expect("assign")
            }));
        }
        let mut slots = Vec::new();
        for handle in handles {
            if let Some(slot) = handle.await.expect("join") {
                slots.push(slot);
            }
        }
        slots.sort();
        assert_eq!(slots, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn merge_commits_then_merges_into_main() {
        let (pool, git) = pool(2);
        pool.assign("a").await.expect("assign");
        assert_eq!(pool.refresh_changes("a").await.expect("refresh"), 2);

        let result = pool.merge("a").await.expect("merge");
        assert!(result.success);
        assert!(pool.merge_in_progress().await.is_none());
        let calls = git.calls();
        assert_eq!(calls[1], "commit /repo/.taskloom/worktrees/pool-0");
        assert_eq!(calls[2], "merge taskloom/pool-0 -> main");
        assert_eq!(pool.snapshot().await[0].changes_count, 0);
    }

    #[tokio::test]
    async fn conflicted_merge_must_be_continued_or_aborted() {
        let (pool, git) = pool(2);
        pool.assign("a").await.expect("assign");
        pool.assign("b").await.expect("assign");
        *git.conflicts.lock().expect("conflicts") = vec!["src/lib.rs".to_string()];

        let result = pool.merge("a").await.expect("merge");
        assert!(result.has_conflicts);
        assert_eq!(result.conflicted_files, vec!["src/lib.rs".to_string()]);
        assert_eq!(pool.merging_task().await.as_deref(), Some("a"));
        assert!(matches!(
            pool.merge("b").await,
            Err(PoolError::MergeInProgress(0))
        ));

        assert!(pool.continue_merge().await.expect("continue").has_conflicts);
        git.conflicts.lock().expect("conflicts").clear();
        assert!(pool.continue_merge().await.expect("continue").success);
        assert!(pool.merging_task().await.is_none());
        assert!(matches!(
            pool.continue_merge().await,
            Err(PoolError::NoMergeInProgress)
        ));

        *git.conflicts.lock().expect("conflicts") = vec!["README.md".to_string()];
        pool.merge("b").await.expect("merge");
        assert!(pool.abort_merge().await.expect("abort").success);
        assert!(matches!(pool.abort_merge().await, Err(PoolError::NoMergeInProgress)));
    }

    #[tokio::test]
    async fn merging_an_unassigned_task_is_rejected() {
        let (pool, _git) = pool(1);
        assert!(matches!(
            pool.merge("ghost").await,
            Err(PoolError::NotAssigned(id)) if id == "ghost"
        ));
    }
}
