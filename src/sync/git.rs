//! Narrow git capability consumed by the sync loop.
//!
//! The core never parses repository state beyond porcelain status output; a
//! trait seam keeps the loop testable without a git binary.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{BeadsError, Result};

/// The git operations the sync loop needs.
pub trait GitClient: Send + Sync {
    /// Does the current branch track an upstream?
    fn has_upstream(&self) -> Result<bool>;

    /// Does `git status --porcelain <path>` report changes?
    fn has_changes(&self, path: &Path) -> Result<bool>;

    /// Stage and commit a single path.
    fn commit(&self, path: &Path, message: &str) -> Result<()>;

    /// `git pull --ff-only`.
    fn pull(&self) -> Result<()>;

    /// `git push`.
    fn push(&self) -> Result<()>;
}

/// `GitClient` backed by the system git binary.
#[derive(Debug, Clone)]
pub struct SystemGit {
    workdir: PathBuf,
}

impl SystemGit {
    #[must_use]
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.workdir)
            .args(args)
            .output()?;
        Ok(output)
    }

    fn run_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(BeadsError::Git {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl GitClient for SystemGit {
    fn has_upstream(&self) -> Result<bool> {
        let output = self.run(&["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"])?;
        Ok(output.status.success())
    }

    fn has_changes(&self, path: &Path) -> Result<bool> {
        let path = path.to_string_lossy();
        let stdout = self.run_checked(&["status", "--porcelain", "--", &path])?;
        Ok(!stdout.trim().is_empty())
    }

    fn commit(&self, path: &Path, message: &str) -> Result<()> {
        let path_str = path.to_string_lossy();
        self.run_checked(&["add", "--", &path_str])?;

        let output = self.run(&["commit", "-m", message, "--", &path_str])?;
        if output.status.success() {
            return Ok(());
        }

        // A racing commit (or an untracked-then-clean file) leaves nothing to
        // commit; git reports that on stdout with a non-zero status.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stdout.contains("nothing to commit")
            || stdout.contains("nothing added to commit")
            || stderr.contains("nothing to commit")
        {
            return Ok(());
        }

        Err(BeadsError::Git {
            args: format!("commit -m {message:?}"),
            stderr: stderr.trim().to_string(),
        })
    }

    fn pull(&self) -> Result<()> {
        self.run_checked(&["pull", "--ff-only"])?;
        Ok(())
    }

    fn push(&self) -> Result<()> {
        self.run_checked(&["push"])?;
        Ok(())
    }
}
