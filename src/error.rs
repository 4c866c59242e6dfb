//! Crate error type.
//!
//! Typed failures that callers are expected to match on live here; the
//! plumbing-heavy paths (subprocess orchestration, stream copies) use
//! [`anyhow`] with context instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// `listen` was called on an adapter that already holds a listener.
    #[error("server has already been started")]
    AlreadyStarted,

    /// `serve` was called before `listen`.
    #[error("cannot call serve() before listen()")]
    NoListener,

    /// The SSH exec payload did not match any of the allowed Git commands.
    #[error("invalid git command")]
    InvalidGitCommand,

    /// The hook stdin line was not `<old-sha> <new-sha> <ref>`.
    #[error("Invalid hook input")]
    InvalidHookInput,

    /// The `Authorization` header is not HTTP basic authentication.
    #[error("not a basic authentication")]
    NotBasicAuth,

    /// The basic-auth payload failed to decode.
    #[error("illegal base64 data: {0}")]
    IllegalBase64(#[from] base64::DecodeError),

    /// The decoded basic-auth payload had no `username:password` separator.
    #[error("invalid credential format")]
    InvalidCredential,

    /// A pkt-line payload plus its prefix would exceed `0xFFFF` bytes.
    #[error("pkt-line payload too long: {0} bytes")]
    PktLineOverflow(usize),
}
