//! Bare-repository store.
//!
//! Filesystem-level operations on the directory tree under
//! [`Config::dir`](crate::Config::dir): existence checks, bare
//! initialisation on first push, and hook-script installation.  All
//! operations are async (Tokio) since they run inside the adapters'
//! request paths.

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::Config;

// ---------------------------------------------------------------------------
// Existence
// ---------------------------------------------------------------------------

/// A repository exists iff its `objects` directory does.
pub fn repo_exists(path: &Path) -> bool {
    path.join("objects").is_dir()
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Initialise a bare repository named `name` under the configured root
/// and install the configured hook scripts.
///
/// `git init --bare` tolerates an existing directory, so concurrent
/// auto-creates race benignly: one side wins the init, the other observes
/// the populated directory.
pub async fn init_repo(name: &str, config: &Config) -> Result<()> {
    let path = config.repo_path(name);

    let output = Command::new(&config.git_path)
        .arg("init")
        .arg("--bare")
        .arg(&path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("failed to spawn {} init --bare", config.git_path))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git init --bare failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    for (hook, script) in &config.hooks {
        if script.is_empty() {
            continue;
        }
        let hook_path = path.join("hooks").join(hook);
        info!(hook = %hook, repo = %name, "installing hook script");
        write_hook(&hook_path, script).await?;
    }

    debug!(repo = %name, path = %path.display(), "bare repo initialised");
    Ok(())
}

// ---------------------------------------------------------------------------
// Bulk hook setup
// ---------------------------------------------------------------------------

/// Rewrite the hook scripts of every repository under the configured root.
///
/// Existing entries under each `hooks/` directory are removed first so
/// stale scripts from an earlier configuration do not linger.
pub async fn setup_hooks(config: &Config) -> Result<()> {
    let mut entries = tokio::fs::read_dir(&config.dir)
        .await
        .with_context(|| format!("failed to read repo root: {}", config.dir.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }

        let hooks_dir = entry.path().join("hooks");
        if let Ok(mut existing) = tokio::fs::read_dir(&hooks_dir).await {
            while let Ok(Some(hook_file)) = existing.next_entry().await {
                if let Err(e) = tokio::fs::remove_file(hook_file.path()).await {
                    warn!(path = %hook_file.path().display(), error = %e, "failed to remove stale hook");
                }
            }
        }

        for (hook, script) in &config.hooks {
            if script.is_empty() {
                continue;
            }
            write_hook(&hooks_dir.join(hook), script).await?;
        }
    }

    Ok(())
}

/// Write a hook script, executable by owner/group/other.
async fn write_hook(path: &Path, script: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, script)
        .await
        .with_context(|| format!("failed to write hook: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .await
            .with_context(|| format!("failed to chmod hook: {}", path.display()))?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_config(dir: &Path) -> Config {
        Config {
            dir: dir.to_path_buf(),
            hooks: HashMap::from([
                ("pre-receive".to_string(), b"#!/bin/sh\nexit 0\n".to_vec()),
                ("update".to_string(), Vec::new()),
            ]),
            ..Config::default()
        }
    }

    #[test]
    fn exists_requires_objects_dir() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!repo_exists(tmp.path()));

        std::fs::create_dir_all(tmp.path().join("objects")).unwrap();
        assert!(repo_exists(tmp.path()));
    }

    #[tokio::test]
    async fn init_creates_bare_repo_with_hooks() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());

        init_repo("hello.git", &config).await.unwrap();

        let repo = tmp.path().join("hello.git");
        assert!(repo_exists(&repo));

        let hook = repo.join("hooks/pre-receive");
        assert!(hook.is_file());

        // Empty scripts are skipped entirely.
        assert!(!repo.join("hooks/update").is_file());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&hook).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[tokio::test]
    async fn setup_hooks_replaces_existing_scripts() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());

        init_repo("a.git", &config).await.unwrap();
        let stale = tmp.path().join("a.git/hooks/post-update");
        std::fs::write(&stale, b"#!/bin/sh\n").unwrap();

        setup_hooks(&config).await.unwrap();

        assert!(!stale.is_file(), "stale hook should be removed");
        assert!(tmp.path().join("a.git/hooks/pre-receive").is_file());
    }
}
