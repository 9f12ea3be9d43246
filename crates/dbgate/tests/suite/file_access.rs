use axum::http::StatusCode;
use serde_json::json;

use crate::harness::{post, GatewayBuilder, SpyBackend, TestGateway};

fn gateway_for(root: &std::path::Path) -> TestGateway {
    GatewayBuilder::new(SpyBackend::new())
        .sandbox(root, vec![root.to_path_buf()])
        .build()
}

fn file_request(path: &str) -> String {
    json!({ "File": path }).to_string()
}

#[tokio::test]
async fn serves_exact_bytes_of_authorized_file() {
    let dir = tempfile::tempdir().unwrap();
    let contents: Vec<u8> = b"#include <stdio.h>\n\xff\x00binary tail"
        .iter()
        .copied()
        .cycle()
        .take(200_000)
        .collect();
    std::fs::write(dir.path().join("hello.c"), &contents).unwrap();
    let gw = gateway_for(dir.path());

    let response = post(&gw.app, "/handle/file/get", &file_request("hello.c")).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, contents);

    let absolute = dir.path().join("hello.c");
    let response = post(
        &gw.app,
        "/handle/file/get",
        &file_request(absolute.to_str().unwrap()),
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body.len(), contents.len());
}

#[tokio::test]
async fn file_outside_roots_is_illegal() {
    let dir = tempfile::tempdir().unwrap();
    let gw = gateway_for(dir.path());

    let response = post(&gw.app, "/handle/file/get", &file_request("/etc/passwd")).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.text(), "Illegal file access");

    let response = post(&gw.app, "/handle/file/get", &file_request("../../etc/passwd")).await;
    assert_eq!(response.text(), "Illegal file access");
}

#[tokio::test]
async fn empty_and_malformed_requests_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let gw = gateway_for(dir.path());

    let response = post(&gw.app, "/handle/file/get", "{}").await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.text(), "No path provided");

    let response = post(&gw.app, "/handle/file/get", "not json").await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_file_inside_root_is_a_server_error() {
    let dir = tempfile::tempdir().unwrap();
    let gw = gateway_for(dir.path());

    let response = post(&gw.app, "/handle/file/get", &file_request("nowhere.c")).await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn file_access_does_not_touch_the_debugger() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.c"), "int a;\n").unwrap();
    let gw = gateway_for(dir.path());

    post(&gw.app, "/handle/file/get", &file_request("a.c")).await;
    assert!(gw.spy().calls().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn symlink_behind_a_missing_directory_is_illegal() {
    let dir = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    std::fs::write(outside.path().join("secret"), "TOP SECRET").unwrap();
    std::fs::create_dir(dir.path().join("src")).unwrap();
    std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("src/link")).unwrap();
    let gw = gateway_for(dir.path());

    for path in ["src/link", "src/nope/../link"] {
        let response = post(&gw.app, "/handle/file/get", &file_request(path)).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST, "{path}");
        assert_eq!(response.text(), "Illegal file access", "{path}");
    }
}
