//! Repository manager: one working tree per project slug.
//!
//! The first deployment clones; every later one fetches and hard-resets,
//! so the directory survives deployments and branch switches without a
//! re-clone. The fetch refspec is rewritten on every update so branches
//! created after an initially single-branch (or shallow) clone stay
//! discoverable.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::DeployError;

pub struct RepoManager {
    root: PathBuf,
}

impl RepoManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Working directory for a slug: `<projects_root>/<slug>`.
    pub fn working_dir(&self, slug: &str) -> PathBuf {
        self.root.join(slug)
    }

    /// Materialize `branch` of `repo_url` at the slug's working directory
    /// and return the path. On success the tree matches the remote tip,
    /// the repository is non-shallow, and local edits are gone. Safe to
    /// repeat.
    pub async fn ensure_repo(
        &self,
        repo_url: &str,
        slug: &str,
        branch: &str,
    ) -> Result<PathBuf, DeployError> {
        let dir = self.working_dir(slug);

        if !dir.join(".git").exists() {
            info!(slug, branch, "cloning repository");
            tokio::fs::create_dir_all(&self.root)
                .await
                .map_err(|e| DeployError::CloneFailed(format!("creating projects root: {}", e)))?;
            let dir_str = dir.to_string_lossy();
            run_git(
                &self.root,
                &["clone", "--branch", branch, repo_url, dir_str.as_ref()],
            )
            .await?;
            return Ok(dir);
        }

        debug!(slug, branch, "updating existing clone");

        // Widen the fetch refspec so every remote branch is discoverable
        // even when the original clone was shallow and single-branch.
        run_git(
            &dir,
            &[
                "config",
                "remote.origin.fetch",
                "+refs/heads/*:refs/remotes/origin/*",
            ],
        )
        .await?;

        if dir.join(".git").join("shallow").exists() {
            run_git(&dir, &["fetch", "origin", "--unshallow", "--prune"]).await?;
        } else {
            run_git(&dir, &["fetch", "origin", "--prune"]).await?;
        }

        // Plain checkout works for branches already known locally; fall
        // back to creating a tracking branch from the remote.
        if run_git(&dir, &["checkout", branch]).await.is_err() {
            run_git(
                &dir,
                &["checkout", "-b", branch, &format!("origin/{}", branch)],
            )
            .await?;
        }

        run_git(&dir, &["reset", "--hard", &format!("origin/{}", branch)]).await?;

        Ok(dir)
    }
}

/// Run a git subcommand in `dir`, mapping any failure (spawn or non-zero
/// exit) to `CloneFailed` carrying the trimmed stderr.
async fn run_git(dir: &Path, args: &[&str]) -> Result<(), DeployError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| DeployError::CloneFailed(format!("failed to run git {}: {}", args[0], e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DeployError::CloneFailed(format!(
            "git {} failed: {}",
            args[0],
            stderr.trim()
        )));
    }
    Ok(())
}
