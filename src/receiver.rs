//! Post-receive hook harness.
//!
//! The receiver is the library surface used by the host's post-receive
//! executable: it parses the hook wire format from stdin, enforces the
//! ref allow-list, materialises the pushed tree into a scratch directory,
//! and hands both to the host's handler.
//!
//! This module is synchronous on purpose; it runs inside a short-lived
//! hook process spawned by `git receive-pack`, not inside the server.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::hook::{read_hook_input, HookInfo, ZERO_SHA};

/// Host logic invoked with the hook context and the materialised work tree.
pub type HandlerFn = Box<dyn Fn(&HookInfo, &Path) -> Result<()> + Send + Sync>;

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Receiver {
    /// Keep scratch directories around for inspection.
    pub debug: bool,
    /// Restrict pushes to `refs/heads/master` (kept for backward
    /// compatibility; prefer `allowed_refs`).
    pub master_only: bool,
    /// Full refs that may be pushed; empty allows everything.
    pub allowed_refs: Vec<String>,
    /// Parent directory for scratch work trees.
    pub tmp_dir: PathBuf,
    pub handler_func: Option<HandlerFn>,
}

impl Receiver {
    /// Consume one hook input line from `input` and run the full
    /// receive pipeline.
    pub fn handle<R: BufRead>(&self, input: R) -> Result<()> {
        let hook = read_hook_input(input)?;
        self.check_allowed_ref(&hook)?;

        let scratch = ScratchDir::create(&self.tmp_dir, self.debug)?;
        archive_tree(&hook.new_rev, scratch.path())?;

        if let Some(handler) = &self.handler_func {
            return handler(&hook, scratch.path());
        }

        Ok(())
    }

    /// Enforce the ref allow-list.
    pub fn check_allowed_ref(&self, hook: &HookInfo) -> Result<()> {
        let mut allowed = self.allowed_refs.clone();
        if self.master_only {
            allowed.push("refs/heads/master".to_string());
        }

        if allowed.is_empty() {
            return Ok(());
        }

        if !allowed.iter().any(|r| *r == hook.r#ref) {
            bail!(
                "cannot push branch, allowed branches: {}",
                allowed.join(", ")
            );
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scratch directory
// ---------------------------------------------------------------------------

/// UUID-named scratch directory removed on drop unless debug is set.
struct ScratchDir {
    path: PathBuf,
    keep: bool,
}

impl ScratchDir {
    fn create(parent: &Path, keep: bool) -> Result<Self> {
        let path = parent.join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&path)
            .with_context(|| format!("failed to create scratch dir: {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o774))
                .with_context(|| format!("failed to chmod scratch dir: {}", path.display()))?;
        }

        Ok(ScratchDir { path, keep })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.keep {
            debug!(path = %self.path.display(), "keeping scratch dir");
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove scratch dir");
        }
    }
}

// ---------------------------------------------------------------------------
// Git helpers
// ---------------------------------------------------------------------------

/// Materialise `rev` into `dest` by piping `git archive` through `tar`.
fn archive_tree(rev: &str, dest: &Path) -> Result<()> {
    let script = format!("git archive '{}' | tar -x -C '{}'", rev, dest.display());
    let output = Command::new("bash")
        .arg("-c")
        .arg(&script)
        .output()
        .context("failed to run git archive")?;

    if !output.status.success() {
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        let text = String::from_utf8_lossy(&combined);

        if text.contains("Damaged tar archive") {
            bail!("repository might be empty");
        }
        bail!("cannot archive repository: {}", text.trim());
    }

    Ok(())
}

/// Whether the update rewrites history: true when the merge base of the
/// two revisions is not the old tip.  Creations and deletions are never
/// force pushes.
pub fn is_force_push(hook: &HookInfo) -> Result<bool> {
    if hook.old_rev == ZERO_SHA || hook.new_rev == ZERO_SHA {
        return Ok(false);
    }

    let output = Command::new("git")
        .args(["merge-base", &hook.old_rev, &hook.new_rev])
        .output()
        .context("failed to run git merge-base")?;

    if !output.status.success() {
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        return Err(anyhow!(
            "git merge-base failed: {}",
            String::from_utf8_lossy(&combined).trim()
        ));
    }

    let base = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok(base != hook.old_rev)
}

/// Full commit message of `sha`, trimmed.
pub fn read_commit_message(sha: &str) -> Result<String> {
    let output = Command::new("git")
        .args(["show", "-s", "--format=%B", sha])
        .output()
        .context("failed to run git show")?;

    if !output.status.success() {
        bail!(
            "git show failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
