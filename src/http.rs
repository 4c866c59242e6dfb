//! Smart-HTTP protocol adapter.
//!
//! Fronts the local `git` binary over the three smart-HTTP endpoints:
//!
//! - `GET  …/info/refs?service=<svc>` — reference advertisement
//! - `POST …/git-upload-pack`          — fetch RPC
//! - `POST …/git-receive-pack`         — push RPC
//!
//! Requests are matched by method and URL-path suffix; anything else is
//! a 403.  Subprocess stdout is streamed to the response body as it is
//! produced so long-running pack negotiations are not buffered.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use flate2::read::GzDecoder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::auth::{parse_basic_auth, HttpAuthFn, RepoContext};
use crate::command::sub_command;
use crate::config::Config;
use crate::pktline::{write_flush, write_pkt_line, FlushingWriter};
use crate::process::spawn_git;
use crate::repo::{init_repo, repo_exists};

// ---------------------------------------------------------------------------
// Service table
// ---------------------------------------------------------------------------

enum ServiceKind {
    Advertise,
    Rpc(&'static str),
}

struct Service {
    method: Method,
    suffix: &'static str,
    kind: ServiceKind,
}

fn services() -> [Service; 3] {
    [
        Service {
            method: Method::GET,
            suffix: "/info/refs",
            kind: ServiceKind::Advertise,
        },
        Service {
            method: Method::POST,
            suffix: "/git-upload-pack",
            kind: ServiceKind::Rpc("git-upload-pack"),
        },
        Service {
            method: Method::POST,
            suffix: "/git-receive-pack",
            kind: ServiceKind::Rpc("git-receive-pack"),
        },
    ]
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// The smart-HTTP half of the server.
pub struct GitHttp {
    shared: Arc<Shared>,
}

struct Shared {
    config: Config,
    auth_func: Option<HttpAuthFn>,
}

impl GitHttp {
    pub fn new(config: Config) -> Self {
        GitHttp {
            shared: Arc::new(Shared {
                config,
                auth_func: None,
            }),
        }
    }

    /// Attach the host's credential check.  Only consulted when
    /// [`Config::auth`] is set.
    pub fn with_auth(config: Config, auth_func: HttpAuthFn) -> Self {
        GitHttp {
            shared: Arc::new(Shared {
                config,
                auth_func: Some(auth_func),
            }),
        }
    }

    /// Ensure the repository root (and startup hooks) exist.
    pub async fn setup(&self) -> Result<()> {
        self.shared.config.setup().await
    }

    /// Build the axum router.  Hosts may mount this under their own
    /// application instead of calling [`serve`](GitHttp::serve).
    pub fn router(&self) -> Router {
        Router::new()
            .route("/{*path}", any(dispatch))
            .fallback(|| async { (StatusCode::FORBIDDEN, "Forbidden") })
            .with_state(Arc::clone(&self.shared))
    }

    /// Bind `addr` and serve until the task is cancelled.  HTTPS is used
    /// iff both TLS paths are configured.
    pub async fn serve(&self, addr: SocketAddr) -> Result<()> {
        let app = self.router();
        let config = &self.shared.config;

        match (&config.tls_cert, &config.tls_key) {
            (Some(cert), Some(key)) => {
                let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                    .await
                    .context("failed to load TLS certificate/key")?;
                info!(%addr, "git smart-HTTP server listening (TLS)");
                axum_server::bind_rustls(addr, tls)
                    .serve(app.into_make_service())
                    .await
                    .context("HTTPS server error")?;
            }
            _ => {
                let listener = tokio::net::TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;
                info!(%addr, "git smart-HTTP server listening");
                axum::serve(listener, app).await.context("HTTP server error")?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

async fn dispatch(State(state): State<Arc<Shared>>, req: Request) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    info!(%method, %path, "git http request");

    let Some(svc) = services()
        .into_iter()
        .find(|svc| svc.method == method && path.ends_with(svc.suffix))
    else {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    };

    let repo_name = repo_name_from_path(&path);
    if repo_name.is_empty() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let repo = RepoContext {
        path: state.config.repo_path(&repo_name),
        name: repo_name,
    };

    if state.config.auth {
        if let Err(resp) = authenticate(&state, req.headers(), &repo) {
            return resp;
        }
    }

    if !repo_exists(&repo.path) && state.config.auto_create {
        if let Err(e) = init_repo(&repo.name, &state.config).await {
            error!(repo = %repo.name, error = %e, "auto-create failed");
        }
    }

    if !repo_exists(&repo.path) {
        error!(repo = %repo.name, path = %repo.path.display(), "repository does not exist");
        return StatusCode::NOT_FOUND.into_response();
    }

    match svc.kind {
        ServiceKind::Advertise => {
            let service = query_param(req.uri().query(), "service");
            advertise(&state, &repo, service.as_deref()).await
        }
        ServiceKind::Rpc(rpc) => {
            let headers = req.headers().clone();
            let body = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
                Ok(body) => body,
                Err(e) => {
                    error!(error = %e, "failed to read request body");
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            };
            post_rpc(&state, &repo, rpc, &headers, body).await
        }
    }
}

/// The first path segment names the repo.  Relative segments are
/// rejected so the joined path cannot escape the repo root.
fn repo_name_from_path(path: &str) -> String {
    let first = path.split('/').find(|seg| !seg.is_empty()).unwrap_or_default();
    if first == "." || first == ".." {
        return String::new();
    }
    first.to_string()
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix(name)?.strip_prefix('=').map(String::from))
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"\"")],
        "",
    )
        .into_response()
}

fn authenticate(state: &Shared, headers: &HeaderMap, repo: &RepoContext) -> Result<(), Response> {
    let Some(auth_func) = &state.auth_func else {
        error!("auth enabled but no auth backend provided");
        return Err(StatusCode::UNAUTHORIZED.into_response());
    };

    let Some(header_value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return Err(unauthorized());
    };

    let cred = match parse_basic_auth(header_value) {
        Ok(cred) => cred,
        Err(e) => {
            error!(error = %e, "bad authorization header");
            return Err(unauthorized());
        }
    };

    match auth_func(&cred, repo) {
        Ok(true) => Ok(()),
        Ok(false) => {
            error!(user = %cred.username, "rejected user");
            Err(unauthorized())
        }
        Err(e) => {
            error!(user = %cred.username, error = %e, "auth backend error");
            Err(unauthorized())
        }
    }
}

// ---------------------------------------------------------------------------
// GET info/refs
// ---------------------------------------------------------------------------

async fn advertise(state: &Shared, repo: &RepoContext, service: Option<&str>) -> Response {
    let rpc = match service {
        Some(rpc @ ("git-upload-pack" | "git-receive-pack")) => rpc.to_string(),
        _ => return (StatusCode::NOT_FOUND, "Not Found").into_response(),
    };

    let repo_arg = repo.path.to_string_lossy();
    let mut child = match spawn_git(
        &state.config.git_path,
        [
            sub_command(&rpc),
            "--stateless-rpc",
            "--advertise-refs",
            repo_arg.as_ref(),
        ],
        None,
        &[],
    ) {
        Ok(child) => child,
        Err(e) => {
            error!(error = %e, "failed to start git for advertisement");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let stdout = child.child.stdout.take().expect("stdout piped");
    let stderr = child.child.stderr.take().expect("stderr piped");
    drop(child.child.stdin.take());
    let mut merged = merge_output(stdout, stderr);

    let banner = format!("# service={rpc}\n");
    let (tx, rx) = tokio::io::duplex(32 * 1024);

    tokio::spawn(async move {
        let mut out = FlushingWriter::new(tx);
        let copy = async {
            write_pkt_line(&mut out, &banner).await?;
            write_flush(&mut out).await?;
            while let Some(chunk) = merged.recv().await {
                out.write_all(&chunk).await?;
            }
            out.shutdown().await?;
            anyhow::Ok(())
        };

        if let Err(e) = copy.await {
            warn!(error = %e, "advertisement stream ended early");
            child.terminate_group();
            return;
        }
        match child.wait().await {
            Ok(0) => {}
            Ok(code) => error!(code, "git advertisement exited non-zero"),
            Err(e) => error!(error = %e, "failed to reap git advertisement"),
        }
    });

    (
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                format!("application/x-{rpc}-advertisement"),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(ReaderStream::new(rx)),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// POST rpc
// ---------------------------------------------------------------------------

async fn post_rpc(
    state: &Shared,
    repo: &RepoContext,
    rpc: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let body = match decode_body(headers, body) {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "failed to decode request body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let repo_arg = repo.path.to_string_lossy();
    let mut child = match spawn_git(
        &state.config.git_path,
        [sub_command(rpc), "--stateless-rpc", repo_arg.as_ref()],
        None,
        &[],
    ) {
        Ok(child) => child,
        Err(e) => {
            error!(error = %e, "failed to start git rpc");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut stdin = child.child.stdin.take().expect("stdin piped");
    let stdout = child.child.stdout.take().expect("stdout piped");
    let stderr = child.child.stderr.take().expect("stderr piped");
    let mut merged = merge_output(stdout, stderr);

    let (tx, rx) = tokio::io::duplex(32 * 1024);

    tokio::spawn(async move {
        let mut out = FlushingWriter::new(tx);
        let copy = async {
            stdin.write_all(&body).await?;
            drop(stdin); // EOF tells git the request is complete
            while let Some(chunk) = merged.recv().await {
                out.write_all(&chunk).await?;
            }
            out.shutdown().await?;
            anyhow::Ok(())
        };

        if let Err(e) = copy.await {
            warn!(error = %e, "rpc stream ended early");
            child.terminate_group();
            return;
        }
        match child.wait().await {
            Ok(0) => debug!("git rpc complete"),
            Ok(code) => error!(code, "git rpc exited non-zero"),
            Err(e) => error!(error = %e, "failed to reap git rpc"),
        }
    });

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, format!("application/x-{rpc}-result")),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(ReaderStream::new(rx)),
    )
        .into_response()
}

/// Inflate the request body when the client sent `Content-Encoding: gzip`.
fn decode_body(headers: &HeaderMap, body: Bytes) -> Result<Bytes> {
    let gzipped = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));

    if !gzipped {
        return Ok(body);
    }

    use std::io::Read;
    let mut decoded = Vec::with_capacity(body.len() * 2);
    GzDecoder::new(&body[..])
        .read_to_end(&mut decoded)
        .context("gzip decode failed")?;
    Ok(Bytes::from(decoded))
}

/// Merge subprocess stdout and stderr into one chunk stream for the
/// response body — the async stand-in for pointing both descriptors at
/// the same pipe.  Stdout chunk order is preserved; stderr (sideband
/// progress text) interleaves as it is produced.
fn merge_output(
    mut stdout: tokio::process::ChildStdout,
    mut stderr: tokio::process::ChildStderr,
) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel::<Vec<u8>>(16);

    let stdout_tx = tx.clone();
    tokio::spawn(async move {
        let mut buf = vec![0_u8; 32 * 1024];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdout_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    tokio::spawn(async move {
        let mut buf = vec![0_u8; 32 * 1024];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    rx
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
