//! Server configuration.
//!
//! A single [`Config`] value is constructed by the host, handed to the
//! adapters, and never mutated after the server starts.  Auth callbacks
//! are attached to the adapters themselves so the config stays a plain
//! value type.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::repo;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the repository tree.
    pub dir: PathBuf,
    /// Executable used to run git.  Resolved via `PATH` when bare.
    pub git_path: String,
    /// Required SSH login name when auth is on.  Empty disables the check.
    pub git_user: String,
    /// Create missing repositories (`git init --bare`) on first access.
    pub auto_create: bool,
    /// Split incoming repository paths as `<namespace>/<repo>`.
    pub use_namespace: bool,
    /// Gate requests through the host's auth callbacks.
    pub auth: bool,

    /// Rewrite hook scripts in every existing repository at startup.
    pub auto_hooks: bool,
    /// Hook name → script body, installed into `<repo>/hooks/` at mode 0755.
    pub hooks: HashMap<String, Vec<u8>>,

    /// HTTP listener port; 0 lets the OS assign one.
    pub http_port: u16,
    /// SSH listener port; 0 lets the OS assign one.
    pub ssh_port: u16,
    /// TLS certificate path.  HTTPS is used iff both `tls_cert` and
    /// `tls_key` are set.
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,

    /// Directory holding the SSH host key; created on demand.
    pub key_dir: PathBuf,
    /// Host-key file name under `key_dir`.
    pub key_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            dir: PathBuf::from("./"),
            git_path: "git".to_string(),
            git_user: "git".to_string(),
            auto_create: true,
            use_namespace: false,
            auth: false,
            auto_hooks: false,
            hooks: HashMap::new(),
            http_port: 8080,
            ssh_port: 2222,
            tls_cert: None,
            tls_key: None,
            key_dir: PathBuf::from(".keys"),
            key_name: "gitkit.rsa".to_string(),
        }
    }
}

impl Config {
    /// Absolute-or-relative path of the SSH host private key.
    pub fn key_path(&self) -> PathBuf {
        self.key_dir.join(&self.key_name)
    }

    /// On-disk path of a repository relative to the configured root.
    pub fn repo_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Ensure the repository root exists and, when `auto_hooks` is set,
    /// rewrite the hook scripts of every repository under it.
    ///
    /// Called once at adapter startup; failures here are fatal.
    pub async fn setup(&self) -> Result<()> {
        if !self.dir.is_dir() {
            tokio::fs::create_dir_all(&self.dir).await.with_context(|| {
                format!("failed to create repository root: {}", self.dir.display())
            })?;
            set_dir_mode(&self.dir, 0o755)?;
        }

        if self.auto_hooks {
            repo::setup_hooks(self).await?;
        }

        Ok(())
    }
}

#[cfg(unix)]
fn set_dir_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(mode);
    std::fs::set_permissions(path, perms)
        .with_context(|| format!("failed to chmod {}", path.display()))
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.git_path, "git");
        assert_eq!(config.git_user, "git");
        assert!(config.auto_create);
        assert!(!config.auth);
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.ssh_port, 2222);
        assert_eq!(config.key_path(), PathBuf::from(".keys/gitkit.rsa"));
    }

    #[tokio::test]
    async fn setup_creates_the_repo_root() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            dir: tmp.path().join("repos"),
            ..Config::default()
        };

        config.setup().await.unwrap();
        assert!(config.dir.is_dir());
    }
}
