//! Git worktree manager (C4): creates the isolated worktree a run executes
//! in, commits per-node progress onto the run branch, and manages the
//! short-lived branches/worktrees used by parallel fan-out.
//!
//! Destructive or working-tree-touching operations are delegated to the
//! `git` CLI rather than a libgit2 binding, matching the rationale the
//! wider ecosystem uses for this kind of tool: the CLI enforces safety
//! checks around dirty worktrees and sparse checkouts that a library
//! binding would otherwise have to reimplement.

use crate::AttractorError;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Clone, Debug)]
pub struct GitWorktreeManager {
    repo_path: PathBuf,
    run_branch_prefix: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunBranch {
    pub branch_name: String,
    pub base_sha: String,
    pub worktree_path: PathBuf,
}

impl GitWorktreeManager {
    pub fn new(repo_path: impl Into<PathBuf>, run_branch_prefix: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
            run_branch_prefix: run_branch_prefix.into(),
        }
    }

    /// Fatal per §4.4: a dirty repository aborts before any commit.
    pub fn ensure_clean(&self) -> Result<(), AttractorError> {
        let status = self.git(&self.repo_path, ["status", "--porcelain"])?;
        if !status.trim().is_empty() {
            return Err(AttractorError::Runtime(
                "repository is not clean; commit or stash changes before starting a run"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn head_sha(&self, worktree_path: &Path) -> Result<String, AttractorError> {
        self.git(worktree_path, ["rev-parse", "HEAD"])
            .map(|out| out.trim().to_string())
    }

    /// Captures `base_sha`, creates the run branch at that SHA, and checks
    /// out a fresh worktree bound to it.
    pub fn init_run(
        &self,
        run_id: &str,
        worktree_path: &Path,
    ) -> Result<RunBranch, AttractorError> {
        let base_sha = self.head_sha(&self.repo_path)?;
        let branch_name = run_branch_name(&self.run_branch_prefix, run_id);
        self.worktree_add(&self.repo_path, worktree_path, &branch_name, &base_sha)?;
        Ok(RunBranch {
            branch_name,
            base_sha,
            worktree_path: worktree_path.to_path_buf(),
        })
    }

    /// Creates the dedicated branch+worktree for one parallel branch.
    pub fn create_parallel_branch(
        &self,
        run_id: &str,
        fan_node_id: &str,
        child_node_id: &str,
        base_sha: &str,
        worktree_path: &Path,
    ) -> Result<RunBranch, AttractorError> {
        let branch_name =
            parallel_branch_name(&self.run_branch_prefix, run_id, fan_node_id, child_node_id);
        self.worktree_add(&self.repo_path, worktree_path, &branch_name, base_sha)?;
        Ok(RunBranch {
            branch_name,
            base_sha: base_sha.to_string(),
            worktree_path: worktree_path.to_path_buf(),
        })
    }

    fn worktree_add(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        branch_name: &str,
        start_point: &str,
    ) -> Result<(), AttractorError> {
        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                AttractorError::Runtime(format!(
                    "failed to create worktree parent '{}': {}",
                    parent.display(),
                    error
                ))
            })?;
        }
        self.git(
            repo_path,
            [
                "worktree",
                "add",
                "-b",
                branch_name,
                &worktree_path.to_string_lossy(),
                start_point,
            ],
        )?;
        Ok(())
    }

    /// Commits with `attractor(<run_id>): <node_id> (<status>)`, using
    /// `--allow-empty` so a no-op node still advances the checkpointed SHA.
    pub fn commit_node(
        &self,
        worktree_path: &Path,
        run_id: &str,
        node_id: &str,
        status: &str,
    ) -> Result<String, AttractorError> {
        self.git(worktree_path, ["add", "-A"])?;
        let message = format!("attractor({run_id}): {node_id} ({status})");
        self.git(worktree_path, ["commit", "--allow-empty", "-m", &message])?;
        self.head_sha(worktree_path)
    }

    /// `.gitignore`s `checkpoint_exclude_globs` in the worktree before any
    /// commit so build artifacts never enter the run branch.
    pub fn apply_checkpoint_exclude_globs(
        &self,
        worktree_path: &Path,
        globs: &[String],
    ) -> Result<(), AttractorError> {
        if globs.is_empty() {
            return Ok(());
        }
        let gitignore_path = worktree_path.join(".gitignore");
        let mut contents = std::fs::read_to_string(&gitignore_path).unwrap_or_default();
        for glob in globs {
            if !contents.lines().any(|line| line == glob) {
                if !contents.is_empty() && !contents.ends_with('\n') {
                    contents.push('\n');
                }
                contents.push_str(glob);
                contents.push('\n');
            }
        }
        std::fs::write(&gitignore_path, contents).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed writing '{}': {}",
                gitignore_path.display(),
                error
            ))
        })
    }

    /// Fast-forward merges a winning parallel sub-branch onto the main run
    /// worktree. Used only by the `first_success` join policy.
    pub fn fast_forward_merge(
        &self,
        run_worktree_path: &Path,
        winning_branch: &str,
    ) -> Result<String, AttractorError> {
        self.git(run_worktree_path, ["merge", "--ff-only", winning_branch])?;
        self.head_sha(run_worktree_path)
    }

    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<(), AttractorError> {
        let _ = self.git(
            &self.repo_path,
            ["worktree", "remove", "--force", &worktree_path.to_string_lossy()],
        );
        Ok(())
    }

    pub fn delete_branch(&self, branch_name: &str) -> Result<(), AttractorError> {
        let _ = self.git(&self.repo_path, ["branch", "-D", branch_name]);
        Ok(())
    }

    fn git<I, S>(&self, cwd: &Path, args: I) -> Result<String, AttractorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
        let output = Command::new("git")
            .current_dir(cwd)
            .args(&args)
            .output()
            .map_err(|error| {
                AttractorError::Runtime(format!(
                    "failed to spawn 'git {}': {}",
                    args.join(" "),
                    error
                ))
            })?;

        if !output.status.success() {
            return Err(AttractorError::Runtime(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// `<run_branch_prefix>/<run_id>`, slashes normalized.
pub fn run_branch_name(run_branch_prefix: &str, run_id: &str) -> String {
    format!(
        "{}/{}",
        trim_slashes(run_branch_prefix),
        trim_slashes(run_id)
    )
}

/// `<run_branch_prefix>/parallel/<run_id>/<fan_node_id>/<child_node_id>`
/// with each node-id segment sanitized independently.
pub fn parallel_branch_name(
    run_branch_prefix: &str,
    run_id: &str,
    fan_node_id: &str,
    child_node_id: &str,
) -> String {
    format!(
        "{}/parallel/{}/{}/{}",
        trim_slashes(run_branch_prefix),
        trim_slashes(run_id),
        sanitize_branch_segment(fan_node_id),
        sanitize_branch_segment(child_node_id),
    )
}

fn trim_slashes(input: &str) -> &str {
    input.trim_matches('/')
}

/// Lowercased, restricted to `[a-z0-9._-]`; any other run of characters
/// collapses to a single `-`.
pub fn sanitize_branch_segment(input: &str) -> String {
    let lower = input.to_ascii_lowercase();
    let mut out = String::with_capacity(lower.len());
    let mut last_was_dash = false;
    for ch in lower.chars() {
        if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
            out.push(ch);
            last_was_dash = ch == '-';
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_branch_segment_collapses_non_allowed_chars() {
        assert_eq!(sanitize_branch_segment("Par Node"), "par-node");
        assert_eq!(sanitize_branch_segment("child/a"), "child-a");
    }

    #[test]
    fn parallel_branch_name_matches_expected_form() {
        let branch = parallel_branch_name("attractor/run/", "run-123", "Par Node", "child/a");
        assert_eq!(branch, "attractor/run/parallel/run-123/par-node/child-a");
    }

    #[test]
    fn run_branch_name_normalizes_slashes() {
        assert_eq!(run_branch_name("attractor/run/", "run-1"), "attractor/run/run-1");
        assert_eq!(run_branch_name("/attractor/run", "/run-1/"), "attractor/run/run-1");
    }
}
