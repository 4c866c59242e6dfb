//! Credentials and host-supplied authentication capabilities.

use std::sync::Arc;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::command::GitCommand;
use crate::error::Error;

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// Username and password from an HTTP basic-auth header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// Parse an `Authorization` header value into a [`Credential`].
pub fn parse_basic_auth(header: &str) -> Result<Credential, Error> {
    let encoded = header
        .strip_prefix("Basic ")
        .ok_or(Error::NotBasicAuth)?;

    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
    let decoded = String::from_utf8(decoded).map_err(|_| Error::InvalidCredential)?;

    let (username, password) = decoded
        .split_once(':')
        .ok_or(Error::InvalidCredential)?;

    Ok(Credential {
        username: username.to_string(),
        password: password.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Public keys
// ---------------------------------------------------------------------------

/// A public key resolved by the host's lookup callback.
///
/// `id` is opaque to the server; it is exported to the spawned git process
/// as `GITKIT_KEY` so receive hooks can attribute the push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub id: String,
    pub name: String,
    pub fingerprint: String,
    pub content: String,
}

// ---------------------------------------------------------------------------
// Capability types
// ---------------------------------------------------------------------------

/// Repository context handed to the HTTP auth callback.
#[derive(Debug, Clone)]
pub struct RepoContext {
    /// Repository path relative to the configured root.
    pub name: String,
    /// Absolute on-disk path.
    pub path: std::path::PathBuf,
}

/// HTTP credential check: return `true` to admit the request.
pub type HttpAuthFn = Arc<dyn Fn(&Credential, &RepoContext) -> anyhow::Result<bool> + Send + Sync>;

/// SSH key lookup: map an `authorized_keys` line to a known key, or `None`.
pub type PubKeyLookupFn = Arc<dyn Fn(&str) -> anyhow::Result<Option<PublicKey>> + Send + Sync>;

/// Optional per-key repository allow-list used to fill the
/// `repositories` extension.
pub type ReposForKeyFn = Arc<dyn Fn(&PublicKey) -> anyhow::Result<Vec<String>> + Send + Sync>;

/// SSH command authorisation: key id plus the parsed command, before the
/// subprocess is spawned.
pub type SshAuthFn = Arc<dyn Fn(&str, &GitCommand) -> anyhow::Result<bool> + Send + Sync>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
