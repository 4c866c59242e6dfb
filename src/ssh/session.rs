//! Per-connection SSH session handler implementing the russh
//! [`Handler`] trait.
//!
//! Each inbound connection gets its own [`SshSession`].  Authentication
//! resolves the offered public key through the host's lookup callback and
//! records the resulting extensions; an `exec` request parses the Git
//! command, optionally auto-creates the repository, spawns git, and pipes
//! channel stdin/stdout/stderr to the subprocess.  One exec is serviced
//! per channel.

use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::Result;
use base64::Engine as _;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty, Sig};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::auth::{PubKeyLookupFn, ReposForKeyFn, SshAuthFn};
use crate::command::{parse_git_command, sub_command};
use crate::config::Config;
use crate::process::spawn_git;
use crate::repo::{init_repo, repo_exists};

const STREAM_CHUNK_SIZE: usize = 32 * 1024;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

pub struct SshSession {
    config: Config,
    peer: Option<SocketAddr>,

    public_key_lookup: Option<PubKeyLookupFn>,
    repos_for_key: Option<ReposForKeyFn>,
    ssh_auth: Option<SshAuthFn>,

    /// Values recorded at authentication time and exported to the spawned
    /// git process as `GITKIT_<UPPER(KEY)>` variables.
    extensions: HashMap<String, String>,
    key_id: Option<String>,

    /// Channel stdin pumps for in-flight execs.  Dropping a sender closes
    /// the subprocess stdin.
    stdin_pipes: HashMap<ChannelId, mpsc::UnboundedSender<Vec<u8>>>,
}

impl SshSession {
    pub fn new(
        config: Config,
        peer: Option<SocketAddr>,
        public_key_lookup: Option<PubKeyLookupFn>,
        repos_for_key: Option<ReposForKeyFn>,
        ssh_auth: Option<SshAuthFn>,
    ) -> Self {
        SshSession {
            config,
            peer,
            public_key_lookup,
            repos_for_key,
            ssh_auth,
            extensions: HashMap::new(),
            key_id: None,
            stdin_pipes: HashMap::new(),
        }
    }

    fn reject_channel(&self, channel: ChannelId, session: &mut Session, msg: &str) {
        session.data(channel, CryptoVec::from_slice(msg.as_bytes()));
        session.close(channel);
    }
}

// ---------------------------------------------------------------------------
// Exec payload cleaning
// ---------------------------------------------------------------------------

/// Strip shell framing junk that precedes the git verb in exec payloads
/// and remove stray NUL bytes.
fn clean_exec_payload(raw: &str) -> String {
    let from_git = raw.find("git").map_or(raw, |i| &raw[i..]);
    from_git.replace('\0', "").trim().to_string()
}

/// SHA-256 fingerprint of an offered key in the `ssh-keygen -l` format.
fn fingerprint_of(key: &PublicKey) -> String {
    let blob_b64 = key.public_key_base64();
    let blob = base64::engine::general_purpose::STANDARD
        .decode(blob_b64.as_bytes())
        .unwrap_or_default();
    let hash = Sha256::digest(&blob);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{encoded}")
}

/// Environment exported to the spawned git process for one extension.
fn extension_env(key: &str, value: &str) -> (String, String) {
    (format!("GITKIT_{}", key.to_uppercase()), value.to_string())
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.config.auth {
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }
        debug!(user = %user, "accepting unauthenticated SSH session");
        Ok(Auth::Accept)
    }

    /// Authenticate a client by public key.
    ///
    /// The offered key is marshalled to its `authorized_keys` line and
    /// resolved through the host's lookup callback; the resulting key id,
    /// fingerprint, name, and repository list are carried to the spawned
    /// subprocess.  Nothing about which factor failed is revealed.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        if !self.config.auth {
            return Ok(Auth::Accept);
        }

        let fp = fingerprint_of(key);
        info!(
            peer = ?self.peer,
            user = %user,
            fingerprint = %fp,
            "SSH public-key auth attempt"
        );

        let reject = Ok(Auth::Reject {
            proceed_with_methods: None,
        });

        if !self.config.git_user.is_empty() && user != self.config.git_user {
            warn!(user = %user, "login name does not match the configured git user");
            return reject;
        }

        let Some(lookup) = &self.public_key_lookup else {
            error!("public key lookup func is not provided");
            return reject;
        };

        let line = format!("{} {}", key.name(), key.public_key_base64());
        let pkey = match lookup(line.trim()) {
            Ok(Some(pkey)) => pkey,
            Ok(None) => {
                warn!(fingerprint = %fp, "auth handler did not return a key");
                return reject;
            }
            Err(e) => {
                error!(fingerprint = %fp, error = %e, "public key lookup failed");
                return reject;
            }
        };

        let repos = match &self.repos_for_key {
            Some(repos_fn) => match repos_fn(&pkey) {
                Ok(repos) => repos,
                Err(e) => {
                    error!(key = %pkey.id, error = %e, "repository lookup failed");
                    return reject;
                }
            },
            None => Vec::new(),
        };

        self.key_id = Some(pkey.id.clone());
        self.extensions = HashMap::from([
            ("key".to_string(), pkey.id),
            ("fingerprint".to_string(), pkey.fingerprint),
            ("name".to_string(), pkey.name),
            ("repositories".to_string(), repos.join(",")),
        ]);

        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    /// `env` requests are validated and discarded.  Client environment is
    /// never forwarded to the subprocess; only the authentication-time
    /// extensions are.
    async fn env_request(
        &mut self,
        _channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let name = variable_name.trim_start_matches('\x04');
        if name.is_empty() {
            warn!("discarding env request with empty name");
            return Ok(());
        }
        debug!(name = %name, value = %variable_value, "ignoring client env request");
        Ok(())
    }

    /// Forward channel data into the stdin of the channel's subprocess.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = self.stdin_pipes.get(&channel) {
            let _ = tx.send(data.to_vec());
        }
        Ok(())
    }

    /// Client finished sending; closing the pump closes subprocess stdin.
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.stdin_pipes.remove(&channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.stdin_pipes.remove(&channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw = String::from_utf8_lossy(data);
        info!(peer = ?self.peer, command = %raw, "SSH exec request");

        if self.stdin_pipes.contains_key(&channel) {
            warn!("second exec request on channel; rejecting");
            self.reject_channel(channel, session, "Unsupported request type.\r\n");
            return Ok(());
        }

        let cmd = match parse_git_command(&clean_exec_payload(&raw)) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(error = %e, "error parsing exec command");
                self.reject_channel(channel, session, "Invalid command.\r\n");
                return Ok(());
            }
        };

        let repo_path = self.config.repo_path(&cmd.repo);
        if !repo_exists(&repo_path) && self.config.auto_create {
            if let Err(e) = init_repo(&cmd.repo, &self.config).await {
                error!(repo = %cmd.repo, error = %e, "auto-create failed");
                self.reject_channel(channel, session, "Could not create repository.\r\n");
                return Ok(());
            }
        }
        if !repo_exists(&repo_path) {
            warn!(repo = %cmd.repo, "repository does not exist");
            self.reject_channel(channel, session, "Repository not found.\r\n");
            return Ok(());
        }

        if self.config.auth {
            if let Some(ssh_auth) = &self.ssh_auth {
                let key_id = self.key_id.clone().unwrap_or_default();
                match ssh_auth(&key_id, &cmd) {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(key = %key_id, repo = %cmd.repo, "command rejected by auth callback");
                        self.reject_channel(channel, session, "Access denied.\r\n");
                        return Ok(());
                    }
                    Err(e) => {
                        error!(key = %key_id, error = %e, "ssh auth callback failed");
                        self.reject_channel(channel, session, "Access denied.\r\n");
                        return Ok(());
                    }
                }
            }
        }

        let envs: Vec<(String, String)> = self
            .extensions
            .iter()
            .map(|(k, v)| extension_env(k, v))
            .collect();

        let mut child = match spawn_git(
            &self.config.git_path,
            [sub_command(&cmd.verb), cmd.repo.as_str()],
            Some(&self.config.dir),
            &envs,
        ) {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "failed to start git");
                self.reject_channel(channel, session, "Failed to start git.\r\n");
                return Ok(());
            }
        };

        let mut stdin = child.child.stdin.take().expect("stdin piped");
        let mut stdout = child.child.stdout.take().expect("stdout piped");
        let mut stderr = child.child.stderr.take().expect("stderr piped");

        // Channel data → subprocess stdin, on its own pump.  The sender is
        // dropped on channel EOF, which ends the pump and closes stdin.
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.stdin_pipes.insert(channel, tx);
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if stdin.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        // The exec reply must precede any stdout bytes.
        session.channel_success(channel);

        let handle = session.handle();
        tokio::spawn(async move {
            let stdout_handle = handle.clone();
            let stdout_pump = async {
                let mut buf = vec![0_u8; STREAM_CHUNK_SIZE];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stdout_handle
                                .data(channel, CryptoVec::from_slice(&buf[..n]))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
            };

            let stderr_handle = handle.clone();
            let stderr_pump = async {
                let mut buf = vec![0_u8; STREAM_CHUNK_SIZE];
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stderr_handle
                                .extended_data(channel, 1, CryptoVec::from_slice(&buf[..n]))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
            };

            tokio::join!(stdout_pump, stderr_pump);

            let code = match child.wait().await {
                Ok(code) => {
                    if code != 0 {
                        warn!(code, "git exited non-zero");
                    }
                    code as u32
                }
                Err(e) => {
                    error!(error = %e, "failed to reap git");
                    1
                }
            };

            let _ = handle.exit_status_request(channel, code).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
        });

        Ok(())
    }

    // Only `env` and `exec` are serviced; every other session-channel
    // request gets the same rejection and a closed channel.

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!("unsupported shell request");
        self.reject_channel(channel, session, "Unsupported request type.\r\n");
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(subsystem = %name, "unsupported subsystem request");
        self.reject_channel(channel, session, "Unsupported request type.\r\n");
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(term = %term, "unsupported pty request");
        self.reject_channel(channel, session, "Unsupported request type.\r\n");
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!("unsupported window-change request");
        self.reject_channel(channel, session, "Unsupported request type.\r\n");
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!("unsupported x11 request");
        self.reject_channel(channel, session, "Unsupported request type.\r\n");
        Ok(())
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!("unsupported agent request");
        self.reject_channel(channel, session, "Unsupported request type.\r\n");
        Ok(false)
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(?signal, "unsupported signal request");
        self.reject_channel(channel, session, "Unsupported request type.\r\n");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleans_exec_framing() {
        assert_eq!(
            clean_exec_payload("git-upload-pack 'hello.git'"),
            "git-upload-pack 'hello.git'"
        );
        assert_eq!(
            clean_exec_payload("'()\u{0}\u{0}git-upload-pack 'hello.git'"),
            "git-upload-pack 'hello.git'"
        );
        assert_eq!(clean_exec_payload("ls -la"), "ls -la");
    }

    #[test]
    fn extension_env_uppercases_keys() {
        assert_eq!(
            extension_env("key", "12345"),
            ("GITKIT_KEY".to_string(), "12345".to_string())
        );
        assert_eq!(
            extension_env("fingerprint", "SHA256:abc"),
            ("GITKIT_FINGERPRINT".to_string(), "SHA256:abc".to_string())
        );
        assert_eq!(
            extension_env("repositories", "a.git,b.git"),
            (
                "GITKIT_REPOSITORIES".to_string(),
                "a.git,b.git".to_string()
            )
        );
    }
}
