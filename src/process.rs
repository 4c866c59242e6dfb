//! Git subprocess orchestration.
//!
//! Every spawned `git` runs in its own process group so the whole
//! descendant tree (e.g. `upload-pack` pack helpers) can be torn down
//! with a single signal when the driving task exits.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// GitChild
// ---------------------------------------------------------------------------

/// A running git subprocess plus its process-group handle.
///
/// Dropping an unreaped `GitChild` signals the entire group; a clean
/// [`wait`](GitChild::wait) disarms that teardown.
pub struct GitChild {
    pub child: Child,
    pgid: Option<i32>,
    reaped: bool,
}

impl GitChild {
    /// Wait for the subprocess and return its exit code (1 when the
    /// process was killed by a signal).
    pub async fn wait(&mut self) -> Result<i32> {
        let status = self
            .child
            .wait()
            .await
            .context("failed to wait on git subprocess")?;
        self.reaped = true;
        Ok(status.code().unwrap_or(1))
    }

    /// Signal the whole process group, SIGTERM first.  Used on abnormal
    /// exit paths where the peer vanished mid-stream.
    pub fn terminate_group(&mut self) {
        if self.reaped {
            return;
        }
        self.reaped = true;

        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let pgid = Pid::from_raw(pgid);
            if let Err(e) = killpg(pgid, Signal::SIGTERM) {
                debug!(%pgid, error = %e, "SIGTERM to git process group failed");
                let _ = killpg(pgid, Signal::SIGKILL);
            }
        }
    }
}

impl Drop for GitChild {
    fn drop(&mut self) {
        if !self.reaped {
            warn!("git subprocess dropped before wait; terminating group");
            self.terminate_group();
        }
    }
}

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

/// Spawn `git_path` with `args`, stdio fully piped.
///
/// `cwd` and `envs` extend the inherited environment; the child is placed
/// in a fresh process group with `kill_on_drop` as a second line of
/// defence against leaks.
pub fn spawn_git<I, S>(
    git_path: &str,
    args: I,
    cwd: Option<&Path>,
    envs: &[(String, String)],
) -> Result<GitChild>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(git_path);
    cmd.args(args);

    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for (k, v) in envs {
        cmd.env(k, v);
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {git_path}"))?;

    // With process_group(0) the child's pid doubles as the group id.
    let pgid = child.id().map(|pid| pid as i32);
    debug!(?pgid, "git subprocess started");

    Ok(GitChild {
        child,
        pgid,
        reaped: false,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn spawns_and_reaps_git() {
        let mut child = spawn_git("git", ["--version"], None, &[]).unwrap();

        let mut stdout = child.child.stdout.take().unwrap();
        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();

        assert_eq!(child.wait().await.unwrap(), 0);
        assert!(out.starts_with("git version"), "got {out:?}");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let mut child = spawn_git("git", ["not-a-real-subcommand"], None, &[]).unwrap();
        assert_ne!(child.wait().await.unwrap(), 0);
    }
}
