//! Embeddable Git server.
//!
//! Serves a tree of bare repositories over two transports at once: the
//! Git smart-HTTP protocol and the Git wire protocol over SSH session
//! channels.  The actual Git work is delegated to the installed `git`
//! binary; this crate supplies the transports, authentication seams,
//! repository auto-creation, server-side hook installation, and a
//! receive-side harness for the host's post-receive executable.
//!
//! A minimal host looks like:
//!
//! ```no_run
//! use gitkit::{Config, Server, ServerOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config {
//!         dir: "/var/repos".into(),
//!         ..Config::default()
//!     };
//!     Server::new(config, ServerOptions::all()).run().await
//! }
//! ```
//!
//! Hosts that need custom routing or auth attach callbacks to the
//! individual adapters ([`GitHttp`], [`SshServer`]) instead of using the
//! combined [`Server`].

pub mod auth;
pub mod command;
pub mod config;
pub mod error;
pub mod hook;
pub mod http;
pub mod keys;
pub mod pktline;
pub mod process;
pub mod receiver;
pub mod repo;
pub mod server;
pub mod ssh;

pub use auth::{Credential, HttpAuthFn, PubKeyLookupFn, PublicKey, ReposForKeyFn, SshAuthFn};
pub use command::{parse_git_command, GitCommand};
pub use config::Config;
pub use error::Error;
pub use hook::{read_hook_input, HookAction, HookInfo, ZERO_SHA};
pub use http::GitHttp;
pub use receiver::{is_force_push, read_commit_message, Receiver};
pub use server::{Server, ServerOptions};
pub use ssh::SshServer;

/// Crate version, advertised in the SSH server identification string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
