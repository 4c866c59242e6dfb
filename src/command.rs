//! Parsing of Git shell commands.
//!
//! Over SSH a Git client requests `git-upload-pack 'repo.git'` (or the
//! space-separated `git upload-pack` form) as the exec payload.  Only the
//! three pack/archive verbs are accepted; everything else is rejected
//! before any subprocess is considered.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::Error;

static GIT_COMMAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(git[-\s]upload-pack|git[-\s]upload-archive|git[-\s]receive-pack) '(.*)'$")
        .expect("git command regex is valid")
});

// ---------------------------------------------------------------------------
// GitCommand
// ---------------------------------------------------------------------------

/// A validated Git transport command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCommand {
    /// The verb exactly as the client sent it, e.g. `git-upload-pack`
    /// or `git receive-pack`.
    pub verb: String,
    /// Repository path relative to the configured root.  Never starts
    /// with `/` and never contains `.` or `..` segments.
    pub repo: String,
}

/// Parse a raw exec payload into a [`GitCommand`].
pub fn parse_git_command(cmd: &str) -> Result<GitCommand, Error> {
    let caps = GIT_COMMAND_RE
        .captures(cmd)
        .ok_or(Error::InvalidGitCommand)?;

    Ok(GitCommand {
        verb: caps[1].to_string(),
        repo: sanitize_repo_path(&caps[2]),
    })
}

/// Normalise a client-supplied repository path.
///
/// Strips the absolute prefix and drops `.`/`..` segments so the joined
/// path cannot escape the repository root.
fn sanitize_repo_path(path: &str) -> String {
    path.split('/')
        .filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..")
        .collect::<Vec<_>>()
        .join("/")
}

/// Split a repository path into `(namespace, repo)`.
///
/// Repeated slashes collapse; the final segment is the repo and everything
/// before it, joined by single slashes, is the namespace.  A single-segment
/// path has an empty namespace.
pub fn namespace_and_repo(path: &str) -> (String, String) {
    let mut segments: Vec<&str> = path.split('/').filter(|seg| !seg.is_empty()).collect();
    let repo = segments.pop().unwrap_or_default().to_string();
    (segments.join("/"), repo)
}

/// Derive the git subcommand from a transport verb: `git-receive-pack`
/// and `git receive-pack` both become `receive-pack`.
pub fn sub_command(verb: &str) -> &str {
    verb.strip_prefix("git-")
        .or_else(|| verb.strip_prefix("git "))
        .unwrap_or(verb)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
