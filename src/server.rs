//! Combined server orchestrator.
//!
//! Owns the HTTP and SSH adapters and runs whichever are enabled
//! concurrently on their configured ports.  Hosts that need more control
//! (custom routers, separate lifecycles) use [`GitHttp`] and
//! [`SshServer`] directly.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::auth::{HttpAuthFn, PubKeyLookupFn, ReposForKeyFn, SshAuthFn};
use crate::config::Config;
use crate::http::GitHttp;
use crate::ssh::SshServer;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Which transports the combined server runs, plus the host callbacks.
#[derive(Default)]
pub struct ServerOptions {
    pub enable_http: bool,
    pub enable_ssh: bool,
    pub http_auth: Option<HttpAuthFn>,
    pub public_key_lookup: Option<PubKeyLookupFn>,
    pub repos_for_key: Option<ReposForKeyFn>,
    pub ssh_auth: Option<SshAuthFn>,
}

impl ServerOptions {
    /// Both transports, no auth callbacks.
    pub fn all() -> Self {
        ServerOptions {
            enable_http: true,
            enable_ssh: true,
            ..ServerOptions::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct Server {
    config: Config,
    http: Option<GitHttp>,
    ssh: Option<SshServer>,
}

impl Server {
    /// Build the enabled adapters from `config`.
    pub fn new(mut config: Config, options: ServerOptions) -> Self {
        if config.git_path.is_empty() {
            config.git_path = "git".to_string();
        }

        let http = options.enable_http.then(|| match options.http_auth {
            Some(auth) => GitHttp::with_auth(config.clone(), auth),
            None => GitHttp::new(config.clone()),
        });

        let ssh = options.enable_ssh.then(|| {
            let mut ssh = SshServer::new(config.clone());
            ssh.public_key_lookup = options.public_key_lookup;
            ssh.repos_for_key = options.repos_for_key;
            ssh.ssh_auth = options.ssh_auth;
            ssh
        });

        Server { config, http, ssh }
    }

    /// Run the enabled adapters until one of them fails.
    ///
    /// With both enabled, HTTP runs on a spawned task and SSH in the
    /// foreground; a fatal error from either tears the server down.
    pub async fn run(mut self) -> Result<()> {
        let http_addr: SocketAddr = ([127, 0, 0, 1], self.config.http_port).into();
        let ssh_addr = format!("127.0.0.1:{}", self.config.ssh_port);

        match (self.http.take(), self.ssh.as_mut()) {
            (Some(http), Some(ssh)) => {
                http.setup().await?;
                info!(port = self.config.http_port, "git smart HTTP server enabled");
                info!(port = self.config.ssh_port, "git SSH server enabled");

                let http_task = tokio::spawn(async move {
                    if let Err(e) = http.serve(http_addr).await {
                        error!(error = %e, "HTTP server failed");
                        return Err(e);
                    }
                    Ok(())
                });

                let ssh_result = ssh.listen_and_serve(&ssh_addr).await;
                http_task.abort();
                ssh_result
            }
            (Some(http), None) => {
                http.setup().await?;
                info!(port = self.config.http_port, "git smart HTTP server enabled");
                http.serve(http_addr).await
            }
            (None, Some(ssh)) => {
                info!(port = self.config.ssh_port, "git SSH server enabled");
                ssh.listen_and_serve(&ssh_addr).await
            }
            (None, None) => anyhow::bail!("no transports enabled"),
        }
        .context("server terminated")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_transports_is_an_error() {
        let server = Server::new(Config::default(), ServerOptions::default());
        assert!(server.run().await.is_err());
    }
}
