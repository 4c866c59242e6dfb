//! SSH host-key issue and storage.
//!
//! The SSH adapter needs a stable host key across restarts.  When the
//! configured key file is missing a fresh 2048-bit RSA key pair is
//! written: the private key PEM at mode 0600 with a companion `.pub`
//! in OpenSSH authorized-keys form at mode 0644.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use russh_keys::key::{KeyPair, SignatureHash};
use russh_keys::PublicKeyBase64;
use tracing::info;

// ---------------------------------------------------------------------------
// KeyStore
// ---------------------------------------------------------------------------

pub struct KeyStore {
    key_dir: PathBuf,
    key_name: String,
}

impl KeyStore {
    pub fn new(key_dir: impl Into<PathBuf>, key_name: impl Into<String>) -> Self {
        KeyStore {
            key_dir: key_dir.into(),
            key_name: key_name.into(),
        }
    }

    fn key_path(&self) -> PathBuf {
        self.key_dir.join(&self.key_name)
    }

    /// Generate a 2048-bit RSA key pair and persist both halves.
    pub fn create_rsa(&self) -> Result<()> {
        std::fs::create_dir_all(&self.key_dir).with_context(|| {
            format!("failed to create key directory: {}", self.key_dir.display())
        })?;

        let key = KeyPair::generate_rsa(2048, SignatureHash::SHA2_256)
            .context("RSA key generation failed")?;

        let key_path = self.key_path();
        let mut pem = Vec::new();
        russh_keys::encode_pkcs8_pem(&key, &mut pem).context("failed to encode private key")?;
        std::fs::write(&key_path, &pem)
            .with_context(|| format!("failed to write private key: {}", key_path.display()))?;
        set_mode(&key_path, 0o600)?;

        let pub_path = key_path.with_extension(
            key_path
                .extension()
                .map(|e| format!("{}.pub", e.to_string_lossy()))
                .unwrap_or_else(|| "pub".to_string()),
        );
        let pub_line = format!("{} {}\n", key.name(), key.public_key_base64());
        std::fs::write(&pub_path, pub_line)
            .with_context(|| format!("failed to write public key: {}", pub_path.display()))?;
        set_mode(&pub_path, 0o644)?;

        info!(path = %key_path.display(), "generated RSA host key");
        Ok(())
    }

    /// Load the private host key.
    pub fn load(&self) -> Result<KeyPair> {
        let key_path = self.key_path();
        let contents = std::fs::read_to_string(&key_path)
            .with_context(|| format!("failed to read host key: {}", key_path.display()))?;

        russh_keys::decode_secret_key(&contents, None)
            .with_context(|| format!("failed to decode host key: {}", key_path.display()))
    }

    /// Load the host key, generating it first if the file is absent.
    pub fn load_or_create(&self) -> Result<KeyPair> {
        if !self.key_path().is_file() {
            self.create_rsa()?;
        }
        self.load()
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to chmod {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_and_reloads_host_key() {
        let tmp = tempfile::tempdir().unwrap();
        let store = KeyStore::new(tmp.path(), "gitkit.rsa");

        let key = store.load_or_create().unwrap();
        assert!(!key.public_key_base64().is_empty());

        let priv_path = tmp.path().join("gitkit.rsa");
        let pub_path = tmp.path().join("gitkit.rsa.pub");
        assert!(priv_path.is_file());
        assert!(pub_path.is_file());

        let pub_line = std::fs::read_to_string(&pub_path).unwrap();
        assert!(pub_line.contains("ssh-rsa") || pub_line.contains("rsa-sha2"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let priv_mode = std::fs::metadata(&priv_path).unwrap().permissions().mode();
            let pub_mode = std::fs::metadata(&pub_path).unwrap().permissions().mode();
            assert_eq!(priv_mode & 0o777, 0o600);
            assert_eq!(pub_mode & 0o777, 0o644);
        }

        // A second load must return the same key, not regenerate.
        let again = store.load_or_create().unwrap();
        assert_eq!(key.public_key_base64(), again.public_key_base64());
    }
}
