//! Git hook stdin wire format.
//!
//! `receive-pack` invokes hooks with lines of `<old-sha> <new-sha> <ref>`
//! on stdin and the repository as the working directory.  This module
//! parses one such line and classifies what the push did.

use std::env;
use std::fmt;
use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Sentinel "no commit" revision on hook input: a ref is being created
/// when it appears as the old side, deleted when it is the new side.
pub const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// What a single ref update means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookAction {
    BranchPush,
    BranchCreate,
    BranchDelete,
    TagCreate,
    TagDelete,
    TagPush,
}

impl HookAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookAction::BranchPush => "branch.push",
            HookAction::BranchCreate => "branch.create",
            HookAction::BranchDelete => "branch.delete",
            HookAction::TagCreate => "tag.create",
            HookAction::TagDelete => "tag.delete",
            HookAction::TagPush => "tag.push",
        }
    }
}

impl fmt::Display for HookAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// HookInfo
// ---------------------------------------------------------------------------

/// Context for one ref update, as seen by a receive-side hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookInfo {
    pub action: HookAction,
    pub repo_name: String,
    pub repo_path: String,
    pub old_rev: String,
    pub new_rev: String,
    /// Full ref, e.g. `refs/heads/master`.
    pub r#ref: String,
    /// Second ref component: `heads` or `tags`.
    pub ref_type: String,
    /// Final ref component, e.g. `master`.
    pub ref_name: String,
}

/// Read one hook input line from `input`.
///
/// Hooks run with the repository as their working directory, so the repo
/// path and name are taken from the current directory.
pub fn read_hook_input<R: BufRead>(input: R) -> Result<HookInfo> {
    let line = input
        .lines()
        .next()
        .context("empty hook input")?
        .context("failed to read hook input")?;

    let cwd = env::current_dir().context("failed to resolve working directory")?;
    parse_hook_line(&line, &cwd)
}

fn parse_hook_line(line: &str, repo_dir: &Path) -> Result<HookInfo> {
    let chunks: Vec<&str> = line.trim_end_matches('\n').split(' ').collect();
    if chunks.len() != 3 {
        return Err(Error::InvalidHookInput.into());
    }

    let refchunks: Vec<&str> = chunks[2].split('/').collect();
    if refchunks.len() < 3 {
        return Err(Error::InvalidHookInput.into());
    }

    let repo_name = repo_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut info = HookInfo {
        action: HookAction::BranchPush,
        repo_name,
        repo_path: repo_dir.to_string_lossy().into_owned(),
        old_rev: chunks[0].to_string(),
        new_rev: chunks[1].to_string(),
        r#ref: chunks[2].to_string(),
        ref_type: refchunks[1].to_string(),
        ref_name: refchunks[2..].join("/"),
    };
    info.action = parse_hook_action(&info);

    Ok(info)
}

/// Classify a ref update from its revisions and ref type.
pub fn parse_hook_action(h: &HookInfo) -> HookAction {
    let tag = h.ref_type == "tags";

    if h.old_rev == ZERO_SHA && h.new_rev != ZERO_SHA {
        if tag {
            HookAction::TagCreate
        } else {
            HookAction::BranchCreate
        }
    } else if h.old_rev != ZERO_SHA && h.new_rev == ZERO_SHA {
        if tag {
            HookAction::TagDelete
        } else {
            HookAction::BranchDelete
        }
    } else if tag {
        HookAction::TagPush
    } else {
        HookAction::BranchPush
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const OLD: &str = "e285100b636ac67fa28d85685072158edaa01685";
    const NEW: &str = "a3d33576d686e7dc1d90ec4b1a6e94e760a893b2";

    #[test]
    fn parses_a_master_push() {
        let line = format!("{OLD} {NEW} refs/heads/master\n");
        let info = parse_hook_line(&line, Path::new("/tmp/repos/hello.git")).unwrap();

        assert_eq!(info.old_rev, OLD);
        assert_eq!(info.new_rev, NEW);
        assert_eq!(info.r#ref, "refs/heads/master");
        assert_eq!(info.ref_type, "heads");
        assert_eq!(info.ref_name, "master");
        assert_eq!(info.repo_name, "hello.git");
        assert_eq!(info.action, HookAction::BranchPush);
        assert_eq!(info.action.to_string(), "branch.push");
    }

    #[test]
    fn nested_ref_names_keep_their_slashes() {
        let line = format!("{OLD} {NEW} refs/heads/feature/login");
        let info = parse_hook_line(&line, Path::new("/tmp/r.git")).unwrap();
        assert_eq!(info.ref_name, "feature/login");
    }

    #[test]
    fn classifies_all_actions() {
        let cases = [
            (ZERO_SHA, NEW, "heads", "branch.create"),
            (OLD, ZERO_SHA, "heads", "branch.delete"),
            (OLD, NEW, "heads", "branch.push"),
            (ZERO_SHA, NEW, "tags", "tag.create"),
            (OLD, ZERO_SHA, "tags", "tag.delete"),
        ];

        for (old, new, ref_type, expected) in cases {
            let info = HookInfo {
                action: HookAction::BranchPush,
                repo_name: String::new(),
                repo_path: String::new(),
                old_rev: old.to_string(),
                new_rev: new.to_string(),
                r#ref: String::new(),
                ref_type: ref_type.to_string(),
                ref_name: String::new(),
            };
            assert_eq!(parse_hook_action(&info).as_str(), expected);
        }
    }

    #[test]
    fn rejects_malformed_lines() {
        for line in ["", "one two", "one two three four", "a b not-a-ref"] {
            assert!(
                parse_hook_line(line, Path::new("/tmp/r.git")).is_err(),
                "line {line:?}"
            );
        }
    }
}
