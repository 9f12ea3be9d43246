use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use dbgate::{AccessGuard, AccessToken};
use dbgate_mi::Command;

use crate::harness::{get, post, send, GatewayBuilder, SpyBackend, TestGateway};

const PORT: u16 = 7443;

fn remote_gateway() -> TestGateway {
    GatewayBuilder::new(SpyBackend::new())
        .guard(AccessGuard::remote(AccessToken::new("0123abcd"), PORT))
        .build()
}

#[tokio::test]
async fn loopback_gateway_needs_no_credentials() {
    let gw = GatewayBuilder::new(SpyBackend::new()).build();
    assert_eq!(get(&gw.app, "/handle/breakpoint/list").await.status, StatusCode::OK);
}

#[tokio::test]
async fn remote_request_without_credentials_is_forbidden() {
    let gw = remote_gateway();

    let response = post(&gw.app, "/handle/exec/run", "{}").await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(response.text(), "Permission Denied");
    assert!(response.headers.get(header::LOCATION).is_none());

    let response = get(&gw.app, "/output").await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);

    assert!(gw.spy().calls().is_empty());
}

#[tokio::test]
async fn wrong_token_gets_no_redirect() {
    let gw = remote_gateway();
    let response = get(&gw.app, "/handle/breakpoint/list?MAGIC=0123abce").await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert!(response.headers.get(header::SET_COOKIE).is_none());
}

#[tokio::test]
async fn one_time_token_redirects_and_sets_cookie() {
    let gw = remote_gateway();

    let response = get(&gw.app, "/handle/breakpoint/list?MAGIC=0123abcd").await;
    assert_eq!(response.status, StatusCode::FOUND);
    assert_eq!(
        response.headers[header::LOCATION],
        "/handle/breakpoint/list"
    );
    let cookie = response.headers[header::SET_COOKIE].to_str().unwrap().to_owned();
    assert!(cookie.starts_with("MAGIC7443=0123abcd;"), "{cookie}");
    assert!(cookie.contains("HttpOnly"));
    // The redirect itself must not run the command.
    assert!(gw.spy().calls().is_empty());

    let credential = cookie.split(';').next().unwrap();
    let request = Request::builder()
        .method(Method::GET)
        .uri("/handle/breakpoint/list")
        .header(header::COOKIE, credential)
        .body(Body::empty())
        .unwrap();
    let response = send(&gw.app, request).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(gw.spy().calls(), vec![Command::BreakList]);
}

#[tokio::test]
async fn cookie_for_another_port_is_not_accepted() {
    let gw = remote_gateway();
    let request = Request::builder()
        .method(Method::GET)
        .uri("/handle/thread/listids")
        .header(header::COOKIE, "MAGIC8080=0123abcd")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&gw.app, request).await.status, StatusCode::FORBIDDEN);
}
