//! Tracker adapter: wraps the external issue-tracker binary.
//!
//! The tracker owns a local database file per repository, so invocations
//! are serialized per repository path; different repositories proceed
//! independently. The adapter performs no retries -- callers decide.

pub mod types;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use types::{Issue, is_valid_issue_id, parse_list, parse_single};

/// Operations the engine needs from the issue tracker.
#[async_trait]
pub trait TrackerAdapter: Send + Sync {
    /// Initialize a tracker database in a repo with a unique prefix, in
    /// stealth mode so the working tree stays clean.
    async fn init(&self, repo: &Path, prefix: &str, ctx: &CancellationToken) -> Result<()>;

    /// Create an epic, returning its issue id.
    async fn create_epic(
        &self,
        repo: &Path,
        title: &str,
        description: &str,
        ctx: &CancellationToken,
    ) -> Result<String>;

    /// Create a task issue under an epic, returning its issue id.
    async fn create_task_issue(
        &self,
        repo: &Path,
        epic_id: &str,
        title: &str,
        description: &str,
        ctx: &CancellationToken,
    ) -> Result<String>;

    /// Record that `child` is blocked by `parent`.
    async fn add_dependency(
        &self,
        repo: &Path,
        child: &str,
        parent: &str,
        ctx: &CancellationToken,
    ) -> Result<()>;

    /// List all issues under an epic, with dependencies.
    async fn list_issues(
        &self,
        repo: &Path,
        epic_id: &str,
        ctx: &CancellationToken,
    ) -> Result<Vec<Issue>>;

    /// Fetch a single issue.
    async fn show_issue(
        &self,
        repo: &Path,
        issue_id: &str,
        ctx: &CancellationToken,
    ) -> Result<Issue>;

    /// Close an issue with a reason.
    async fn close_issue(
        &self,
        repo: &Path,
        issue_id: &str,
        reason: &str,
        ctx: &CancellationToken,
    ) -> Result<()>;

    /// Update an issue's status.
    async fn update_issue_status(
        &self,
        repo: &Path,
        issue_id: &str,
        status: &str,
        ctx: &CancellationToken,
    ) -> Result<()>;

    /// Delete an issue, optionally cascading to children.
    async fn delete_issue(
        &self,
        repo: &Path,
        issue_id: &str,
        cascade: bool,
        ctx: &CancellationToken,
    ) -> Result<()>;

    /// Create a working tree named for the subtask, on the given branch.
    async fn create_worktree(
        &self,
        repo: &Path,
        name: &str,
        branch: &str,
        ctx: &CancellationToken,
    ) -> Result<()>;

    /// Remove a working tree.
    async fn remove_worktree(&self, repo: &Path, name: &str, ctx: &CancellationToken)
    -> Result<()>;

    /// Find the epic tagged with a task's eight-character tag.
    ///
    /// Only closed epics are searched: the planner prompt contractually
    /// closes the epic after filing subtasks.
    async fn find_epic_by_task_id(
        &self,
        repo: &Path,
        tag: &str,
        ctx: &CancellationToken,
    ) -> Result<Option<Issue>>;

    /// Add a free-form comment to an issue.
    async fn add_comment(
        &self,
        repo: &Path,
        issue_id: &str,
        text: &str,
        ctx: &CancellationToken,
    ) -> Result<()>;
}

/// Adapter over the tracker CLI binary.
pub struct TrackerCli {
    binary: String,
    /// One lock per repository path: the tool keeps a local database file.
    repo_locks: std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl TrackerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            repo_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, repo: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.repo_locks.lock().expect("tracker lock map poisoned");
        Arc::clone(locks.entry(repo.to_path_buf()).or_default())
    }

    /// Run one tracker subcommand in a repo, returning trimmed stdout.
    ///
    /// Serialized per repository path. Cancelling the context kills the
    /// child and surfaces an error.
    async fn run(&self, repo: &Path, args: &[&str], ctx: &CancellationToken) -> Result<String> {
        let lock = self.lock_for(repo);
        let _guard = lock.lock().await;

        debug!(repo = %repo.display(), ?args, "invoking tracker");

        let mut child = tokio::process::Command::new(&self.binary)
            .args(args)
            .current_dir(repo)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "failed to invoke tracker binary '{}' -- is it installed?",
                    self.binary
                )
            })?;

        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.context("failed to collect tracker output")?
            }
            () = ctx.cancelled() => {
                bail!("tracker invocation cancelled");
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "tracker {:?} failed with {}: {}",
                args.first().copied().unwrap_or(""),
                output.status,
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Validate an id parsed from `create` output before trusting it.
    fn checked_id(raw: &str) -> Result<String> {
        // The create subcommand prints the new id on its own line; take the
        // last non-empty line in case the tool chatters first.
        let id = raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .next_back()
            .unwrap_or("");
        if !is_valid_issue_id(id) {
            bail!("tracker returned unparseable issue id: {raw:?}");
        }
        Ok(id.to_string())
    }
}

#[async_trait]
impl TrackerAdapter for TrackerCli {
    async fn init(&self, repo: &Path, prefix: &str, ctx: &CancellationToken) -> Result<()> {
        self.run(repo, &["init", "--stealth", "--prefix", prefix], ctx)
            .await?;
        Ok(())
    }

    async fn create_epic(
        &self,
        repo: &Path,
        title: &str,
        description: &str,
        ctx: &CancellationToken,
    ) -> Result<String> {
        let out = self
            .run(
                repo,
                &[
                    "create",
                    "--type",
                    "epic",
                    "--title",
                    title,
                    "--description",
                    description,
                ],
                ctx,
            )
            .await?;
        Self::checked_id(&out)
    }

    async fn create_task_issue(
        &self,
        repo: &Path,
        epic_id: &str,
        title: &str,
        description: &str,
        ctx: &CancellationToken,
    ) -> Result<String> {
        let out = self
            .run(
                repo,
                &[
                    "create",
                    "--type",
                    "task",
                    "--title",
                    title,
                    "--parent",
                    epic_id,
                    "--description",
                    description,
                ],
                ctx,
            )
            .await?;
        Self::checked_id(&out)
    }

    async fn add_dependency(
        &self,
        repo: &Path,
        child: &str,
        parent: &str,
        ctx: &CancellationToken,
    ) -> Result<()> {
        self.run(repo, &["dep", "add", child, parent], ctx).await?;
        Ok(())
    }

    async fn list_issues(
        &self,
        repo: &Path,
        epic_id: &str,
        ctx: &CancellationToken,
    ) -> Result<Vec<Issue>> {
        let out = self
            .run(repo, &["list", "--parent", epic_id, "--json"], ctx)
            .await?;
        parse_list(&out).context("failed to parse tracker issue list")
    }

    async fn show_issue(
        &self,
        repo: &Path,
        issue_id: &str,
        ctx: &CancellationToken,
    ) -> Result<Issue> {
        let out = self.run(repo, &["show", issue_id, "--json"], ctx).await?;
        parse_single(&out).context("failed to parse tracker issue")
    }

    async fn close_issue(
        &self,
        repo: &Path,
        issue_id: &str,
        reason: &str,
        ctx: &CancellationToken,
    ) -> Result<()> {
        self.run(repo, &["close", issue_id, "--reason", reason], ctx)
            .await?;
        Ok(())
    }

    async fn update_issue_status(
        &self,
        repo: &Path,
        issue_id: &str,
        status: &str,
        ctx: &CancellationToken,
    ) -> Result<()> {
        self.run(repo, &["update", issue_id, "--status", status], ctx)
            .await?;
        Ok(())
    }

    async fn delete_issue(
        &self,
        repo: &Path,
        issue_id: &str,
        cascade: bool,
        ctx: &CancellationToken,
    ) -> Result<()> {
        let mut args = vec!["delete", issue_id, "--force"];
        if cascade {
            args.push("--cascade");
        }
        self.run(repo, &args, ctx).await?;
        Ok(())
    }

    async fn create_worktree(
        &self,
        repo: &Path,
        name: &str,
        branch: &str,
        ctx: &CancellationToken,
    ) -> Result<()> {
        self.run(repo, &["worktree", "create", name, "--branch", branch], ctx)
            .await?;
        Ok(())
    }

    async fn remove_worktree(
        &self,
        repo: &Path,
        name: &str,
        ctx: &CancellationToken,
    ) -> Result<()> {
        self.run(repo, &["worktree", "remove", name], ctx).await?;
        Ok(())
    }

    async fn find_epic_by_task_id(
        &self,
        repo: &Path,
        tag: &str,
        ctx: &CancellationToken,
    ) -> Result<Option<Issue>> {
        let out = self
            .run(
                repo,
                &[
                    "list",
                    "--type",
                    "epic",
                    "--status",
                    "closed",
                    "--title",
                    tag,
                    "--limit",
                    "1",
                    "--json",
                ],
                ctx,
            )
            .await?;
        if out.is_empty() || out == "[]" {
            return Ok(None);
        }
        let issues: Vec<Issue> = parse_list(&out).context("failed to parse epic search")?;
        Ok(issues.into_iter().next())
    }

    async fn add_comment(
        &self,
        repo: &Path,
        issue_id: &str,
        text: &str,
        ctx: &CancellationToken,
    ) -> Result<()> {
        self.run(repo, &["comments", "add", issue_id, text], ctx)
            .await?;
        Ok(())
    }
}
