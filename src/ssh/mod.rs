//! SSH transport adapter.
//!
//! Accepts SSH connections from Git clients, authenticates them by public
//! key through the host's lookup callback, and pipes the requested
//! `upload-pack`/`receive-pack`/`upload-archive` subprocess across the
//! session channel.
//!
//! The lifecycle is split so a host can bind a port (possibly `:0`) and
//! then serve from its own task: [`SshServer::listen`] followed by
//! [`SshServer::serve`]; [`SshServer::stop`] unblocks `serve`.

pub mod session;

pub use session::SshSession;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use russh::{MethodSet, SshId};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::auth::{PubKeyLookupFn, ReposForKeyFn, SshAuthFn};
use crate::config::Config;
use crate::error::Error;
use crate::keys::KeyStore;

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// The SSH half of the server.
pub struct SshServer {
    config: Config,
    /// Maps an offered `authorized_keys` line to a known key.  Required
    /// when [`Config::auth`] is set.
    pub public_key_lookup: Option<PubKeyLookupFn>,
    /// Optional per-key repository list, exported to the subprocess as
    /// the `repositories` extension.
    pub repos_for_key: Option<ReposForKeyFn>,
    /// Optional command-level authorisation applied before each spawn.
    pub ssh_auth: Option<SshAuthFn>,

    ssh_config: Option<Arc<russh::server::Config>>,
    listener: Option<TcpListener>,
    shutdown: Arc<Notify>,
}

impl SshServer {
    pub fn new(mut config: Config) -> Self {
        if config.git_path.is_empty() {
            config.git_path = "git".to_string();
        }
        SshServer {
            config,
            public_key_lookup: None,
            repos_for_key: None,
            ssh_auth: None,
            ssh_config: None,
            listener: None,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Network address of the bound listener.  Useful after binding
    /// port 0 to learn the OS-assigned port.
    pub fn address(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Bind `addr` and prepare the server: generate/load the host key,
    /// wire up authentication, and ensure the repository root exists.
    pub async fn listen(&mut self, addr: &str) -> Result<()> {
        if self.listener.is_some() {
            bail!(Error::AlreadyStarted);
        }

        self.setup()?;
        self.config.setup().await?;

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind SSH listener on {addr}"))?;
        info!(address = %listener.local_addr()?, "git SSH server listening");
        self.listener = Some(listener);
        Ok(())
    }

    /// Accept connections until [`stop`](SshServer::stop) is called.
    pub async fn serve(&mut self) -> Result<()> {
        let listener = self.listener.take().ok_or(Error::NoListener)?;
        let ssh_config = self
            .ssh_config
            .clone()
            .ok_or(Error::NoListener)?;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = accepted.context("SSH accept failed")?;
                    info!(%peer, "new SSH client connection");

                    let handler = self.new_session(Some(peer));
                    let config = Arc::clone(&ssh_config);
                    tokio::spawn(async move {
                        match russh::server::run_stream(config, socket, handler).await {
                            Ok(session) => {
                                if let Err(e) = session.await {
                                    warn!(%peer, error = %e, "SSH session ended with error");
                                }
                            }
                            Err(e) => warn!(%peer, error = %e, "SSH handshake failed"),
                        }
                    });
                }
                () = self.shutdown.notified() => {
                    info!("SSH server stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Convenience wrapper around [`listen`](SshServer::listen) then
    /// [`serve`](SshServer::serve).
    pub async fn listen_and_serve(&mut self, addr: &str) -> Result<()> {
        self.listen(addr).await?;
        self.serve().await
    }

    /// Unblock [`serve`](SshServer::serve).  In-flight sessions run to
    /// completion on their own tasks.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    // -- Setup --------------------------------------------------------------

    /// Build the russh server configuration: host key plus auth methods.
    /// Idempotent per instance.
    fn setup(&mut self) -> Result<()> {
        if self.ssh_config.is_some() {
            return Ok(());
        }

        if self.config.key_dir.as_os_str().is_empty() {
            bail!("key directory is not provided");
        }

        if self.config.auth {
            if self.public_key_lookup.is_none() {
                bail!("public key lookup func is not provided");
            }
            if self.repos_for_key.is_none() {
                info!("no repository callback; an authorized key may access any repository");
            }
        }

        let store = KeyStore::new(&self.config.key_dir, &self.config.key_name);
        let host_key = store.load_or_create()?;

        let methods = if self.config.auth {
            MethodSet::PUBLICKEY
        } else {
            MethodSet::NONE
        };

        let ssh_config = russh::server::Config {
            server_id: SshId::Standard(format!("SSH-2.0-gitkit {}", crate::VERSION)),
            keys: vec![host_key],
            methods,
            inactivity_timeout: Some(Duration::from_secs(600)),
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            ..Default::default()
        };

        self.ssh_config = Some(Arc::new(ssh_config));
        Ok(())
    }

    fn new_session(&self, peer: Option<SocketAddr>) -> SshSession {
        SshSession::new(
            self.config.clone(),
            peer,
            self.public_key_lookup.clone(),
            self.repos_for_key.clone(),
            self.ssh_auth.clone(),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(tmp: &std::path::Path) -> Config {
        Config {
            dir: tmp.join("repos"),
            key_dir: tmp.join("keys"),
            auth: false,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn serve_before_listen_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = SshServer::new(test_config(tmp.path()));

        let err = server.serve().await.unwrap_err();
        assert_eq!(err.to_string(), "cannot call serve() before listen()");
    }

    #[tokio::test]
    async fn double_listen_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = SshServer::new(test_config(tmp.path()));

        server.listen("127.0.0.1:0").await.unwrap();
        assert!(server.address().is_some());

        let err = server.listen("127.0.0.1:0").await.unwrap_err();
        assert_eq!(err.to_string(), "server has already been started");
    }

    #[tokio::test]
    async fn listen_requires_lookup_when_auth_enabled() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = SshServer::new(Config {
            auth: true,
            ..test_config(tmp.path())
        });

        let err = server.listen("127.0.0.1:0").await.unwrap_err();
        assert!(err
            .to_string()
            .contains("public key lookup func is not provided"));
    }

    #[tokio::test]
    async fn stop_unblocks_serve() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = SshServer::new(test_config(tmp.path()));
        server.listen("127.0.0.1:0").await.unwrap();

        server.stop();
        // The stored permit makes serve() return immediately.
        server.serve().await.unwrap();
    }

    #[tokio::test]
    async fn listen_generates_host_key() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let key_path = config.key_path();

        let mut server = SshServer::new(config);
        server.listen("127.0.0.1:0").await.unwrap();

        assert!(key_path.is_file());
        assert!(key_path.with_extension("rsa.pub").is_file());
    }
}
