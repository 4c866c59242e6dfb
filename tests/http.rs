//! Smart-HTTP integration tests.
//!
//! These drive the axum router in-process against repositories created
//! with the system `git` binary.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use gitkit::auth::{Credential, RepoContext};
use gitkit::{Config, GitHttp};

fn test_config(dir: &std::path::Path) -> Config {
    Config {
        dir: dir.to_path_buf(),
        hooks: HashMap::from([(
            "post-receive".to_string(),
            b"#!/bin/sh\nexit 0\n".to_vec(),
        )]),
        ..Config::default()
    }
}

#[tokio::test]
async fn advertisement_starts_with_service_banner() {
    let tmp = tempfile::tempdir().unwrap();
    let app = GitHttp::new(test_config(tmp.path())).router();

    let response = app
        .oneshot(
            Request::get("/hello.git/info/refs?service=git-upload-pack")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/x-git-upload-pack-advertisement"
    );
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert!(
        body.starts_with(b"001e# service=git-upload-pack\n0000"),
        "unexpected body prefix: {:?}",
        &body[..body.len().min(64)]
    );

    // Auto-create kicked in and installed the configured hook.
    let repo = tmp.path().join("hello.git");
    assert!(repo.join("objects").is_dir());
    assert!(repo.join("hooks/post-receive").is_file());
}

#[tokio::test]
async fn advertisement_requires_a_known_service() {
    let tmp = tempfile::tempdir().unwrap();
    let app = GitHttp::new(test_config(tmp.path())).router();

    let response = app
        .oneshot(
            Request::get("/hello.git/info/refs?service=git-evil")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unmatched_routes_are_forbidden() {
    let tmp = tempfile::tempdir().unwrap();
    let app = GitHttp::new(test_config(tmp.path())).router();

    let response = app
        .oneshot(
            Request::get("/hello.git/some/other/path")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn missing_repo_without_auto_create_is_404() {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        auto_create: false,
        ..test_config(tmp.path())
    };
    let app = GitHttp::new(config).router();

    let response = app
        .oneshot(
            Request::get("/nope.git/info/refs?service=git-upload-pack")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn auth_without_backend_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        auth: true,
        ..test_config(tmp.path())
    };
    let app = GitHttp::new(config).router();

    let response = app
        .oneshot(
            Request::get("/hello.git/info/refs?service=git-upload-pack")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    // No subprocess ran: the repo must not have been created.
    assert!(!tmp.path().join("hello.git").exists());
}

#[tokio::test]
async fn missing_credentials_get_a_challenge() {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        auth: true,
        ..test_config(tmp.path())
    };
    let auth: gitkit::HttpAuthFn =
        Arc::new(|cred: &Credential, _repo: &RepoContext| Ok(cred.password == "sesame"));
    let app = GitHttp::with_auth(config, auth).router();

    let response = app
        .oneshot(
            Request::get("/hello.git/info/refs?service=git-upload-pack")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()[header::WWW_AUTHENTICATE],
        "Basic realm=\"\""
    );
}

#[tokio::test]
async fn accepted_credentials_reach_the_subprocess() {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        auth: true,
        ..test_config(tmp.path())
    };
    let auth: gitkit::HttpAuthFn =
        Arc::new(|cred: &Credential, _repo: &RepoContext| Ok(cred.password == "sesame"));
    let app = GitHttp::with_auth(config, auth).router();

    // "git:sesame"
    let response = app
        .oneshot(
            Request::get("/hello.git/info/refs?service=git-upload-pack")
                .header(header::AUTHORIZATION, "Basic Z2l0OnNlc2FtZQ==")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert!(body.starts_with(b"001e# service=git-upload-pack\n0000"));
}

#[tokio::test]
async fn rejected_credentials_spawn_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        auth: true,
        ..test_config(tmp.path())
    };
    let auth: gitkit::HttpAuthFn = Arc::new(|_: &Credential, _: &RepoContext| Ok(false));
    let app = GitHttp::with_auth(config, auth).router();

    let response = app
        .oneshot(
            Request::get("/hello.git/info/refs?service=git-upload-pack")
                .header(header::AUTHORIZATION, "Basic Z2l0OnNlc2FtZQ==")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(!tmp.path().join("hello.git").exists());
}

#[tokio::test]
async fn upload_pack_rpc_answers_a_trivial_request() {
    let tmp = tempfile::tempdir().unwrap();
    let app = GitHttp::new(test_config(tmp.path())).router();

    // Create the repo first via the advertisement round-trip.
    let response = app
        .clone()
        .oneshot(
            Request::get("/hello.git/info/refs?service=git-upload-pack")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // A lone flush-pkt is a complete (empty) upload-pack request.
    let response = app
        .oneshot(
            Request::post("/hello.git/git-upload-pack")
                .header(header::CONTENT_TYPE, "application/x-git-upload-pack-request")
                .body(Body::from("0000"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/x-git-upload-pack-result"
    );
}
