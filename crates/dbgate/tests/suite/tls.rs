use std::{net::SocketAddr, sync::Arc};

use dbgate::{tls::load_server_config, AccessGuard, AccessToken, Listener};
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::harness::{GatewayBuilder, SpyBackend};

struct TlsServer {
    addr: SocketAddr,
    ca: CertificateDer<'static>,
    stop: CancellationToken,
    _dir: tempfile::TempDir,
}

async fn start(token: &str) -> TlsServer {
    let dir = tempfile::tempdir().unwrap();
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, generated.cert.pem()).unwrap();
    std::fs::write(&key_path, generated.key_pair.serialize_pem()).unwrap();

    let config = load_server_config(&cert_path, &key_path).unwrap();
    let listener = Listener::bind("127.0.0.1", 0, Some(config)).await.unwrap();
    assert!(listener.is_tls());
    let addr = listener.local_addr().unwrap();

    let gw = GatewayBuilder::new(SpyBackend::new())
        .guard(AccessGuard::remote(AccessToken::new(token), addr.port()))
        .build();
    let stop = CancellationToken::new();
    tokio::spawn(listener.serve(gw.app, stop.clone()));

    TlsServer {
        addr,
        ca: generated.cert.der().clone(),
        stop,
        _dir: dir,
    }
}

/// Sends one HTTP/1.1 request over TLS and returns the raw response.
async fn request(server: &TlsServer, head: &str) -> String {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(server.ca.clone()).unwrap();
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();

    let tcp = TcpStream::connect(server.addr).await.unwrap();
    let mut tls = TlsConnector::from(Arc::new(config))
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();
    tls.write_all(head.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let _ = tls.read_to_end(&mut response).await;
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn remote_listener_requires_token_over_https() {
    let server = start("c0ffee").await;

    let response = request(
        &server,
        "GET /handle/breakpoint/list HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 403"), "{response}");
    assert!(response.ends_with("Permission Denied"), "{response}");

    let response = request(
        &server,
        "GET /handle/breakpoint/list?MAGIC=c0ffee HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 302"), "{response}");
    let lower = response.to_ascii_lowercase();
    assert!(lower.contains("location: /handle/breakpoint/list\r\n"), "{response}");
    assert!(
        response.contains(&format!("MAGIC{}=c0ffee;", server.addr.port())),
        "{response}"
    );

    let head = format!(
        "GET /handle/breakpoint/list HTTP/1.1\r\nHost: localhost\r\nCookie: MAGIC{}=c0ffee\r\nConnection: close\r\n\r\n",
        server.addr.port()
    );
    let response = request(&server, &head).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");

    server.stop.cancel();
}

#[tokio::test]
async fn plain_clients_cannot_talk_to_a_tls_listener() {
    let server = start("c0ffee").await;

    let mut tcp = TcpStream::connect(server.addr).await.unwrap();
    tcp.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    let _ = tcp.read_to_end(&mut response).await;
    assert!(!String::from_utf8_lossy(&response).contains("HTTP/1.1"));

    server.stop.cancel();
}
