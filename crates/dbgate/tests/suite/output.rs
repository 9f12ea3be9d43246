use std::{net::SocketAddr, time::Duration};

use dbgate::{AccessGuard, AccessToken};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

use crate::harness::{eventually, serve, GatewayBuilder, SpyBackend};

type Viewer = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(addr: SocketAddr) -> Viewer {
    let (socket, _) = connect_async(format!("ws://{addr}/output"))
        .await
        .expect("websocket handshake");
    socket
}

async fn next_envelope(viewer: &mut Viewer) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), viewer.next())
            .await
            .expect("timed out waiting for an event")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message {other:?}"),
        }
    }
}

/// Next console text, skipping heartbeats.
async fn next_output(viewer: &mut Viewer) -> Value {
    loop {
        let envelope = next_envelope(viewer).await;
        if envelope["Type"] != "heartbeat" {
            return envelope["Data"].clone();
        }
    }
}

#[tokio::test]
async fn forwards_debugger_output_as_envelopes() {
    let gw = GatewayBuilder::new(SpyBackend::new()).build();
    let (addr, _stop) = serve(gw.app.clone()).await;
    let mut viewer = connect(addr).await;

    gw.feed.console.send("Breakpoint 1, main ()\n".into()).await.unwrap();
    assert_eq!(
        next_envelope(&mut viewer).await,
        json!({"Type": "console", "Data": "Breakpoint 1, main ()\n"})
    );

    gw.feed
        .records
        .send(json!({"Type": "exec", "Class": "stopped", "Results": {"reason": "breakpoint-hit"}}))
        .await
        .unwrap();
    let envelope = next_envelope(&mut viewer).await;
    assert_eq!(envelope["Type"], "async");
    assert_eq!(envelope["Data"]["Class"], "stopped");

    gw.feed.log.send("warning: no symbols\n".into()).await.unwrap();
    assert_eq!(next_envelope(&mut viewer).await["Type"], "gdb");

    gw.feed.target.send("hello, world\n".into()).await.unwrap();
    assert_eq!(
        next_envelope(&mut viewer).await,
        json!({"Type": "target", "Data": "hello, world\n"})
    );
}

#[tokio::test]
async fn idle_viewer_receives_heartbeats() {
    let gw = GatewayBuilder::new(SpyBackend::new())
        .heartbeat(Duration::from_millis(50))
        .build();
    let (addr, _stop) = serve(gw.app.clone()).await;
    let mut viewer = connect(addr).await;

    assert_eq!(
        next_envelope(&mut viewer).await,
        json!({"Type": "heartbeat", "Data": ""})
    );
}

#[tokio::test]
async fn viewer_disconnect_tears_down_the_session_once() {
    let gw = GatewayBuilder::new(SpyBackend::new())
        .heartbeat(Duration::from_millis(20))
        .build();
    let (addr, _stop) = serve(gw.app.clone()).await;
    let mut viewer = connect(addr).await;
    next_envelope(&mut viewer).await;

    viewer.close(None).await.unwrap();
    drop(viewer);

    eventually(|| gw.spy().exits() == 1).await;
    assert!(gw.gateway.session().is_ended());

    // A later explicit exit is a no-op.
    gw.gateway.session().teardown().await;
    assert_eq!(gw.spy().exits(), 1);
}

#[tokio::test]
async fn session_end_closes_the_stream() {
    let gw = GatewayBuilder::new(SpyBackend::new()).build();
    let (addr, _stop) = serve(gw.app.clone()).await;
    let mut viewer = connect(addr).await;
    gw.feed.console.send("attached\n".into()).await.unwrap();
    next_envelope(&mut viewer).await;

    gw.gateway.session().teardown().await;

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(message)) = viewer.next().await {
            if message.is_close() {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "viewer was not disconnected");
}

#[tokio::test]
async fn second_viewer_waits_for_the_first() {
    let gw = GatewayBuilder::new(SpyBackend::new())
        .heartbeat(Duration::from_millis(20))
        .build();
    let (addr, _stop) = serve(gw.app.clone()).await;
    let mut first = connect(addr).await;
    gw.feed.console.send("one\n".into()).await.unwrap();
    assert_eq!(next_output(&mut first).await, "one\n");

    let mut second = connect(addr).await;
    gw.feed.console.send("two\n".into()).await.unwrap();
    assert_eq!(next_output(&mut first).await, "two\n");

    let nothing = tokio::time::timeout(Duration::from_millis(100), second.next()).await;
    assert!(nothing.is_err(), "second viewer received events while the first was attached");

    first.close(None).await.unwrap();
    eventually(|| gw.gateway.session().is_ended()).await;
    drop(second);
}

#[tokio::test]
async fn remote_handshake_without_credentials_is_refused() {
    let gw = GatewayBuilder::new(SpyBackend::new())
        .guard(AccessGuard::remote(AccessToken::new("feedface"), 1))
        .build();
    let (addr, _stop) = serve(gw.app.clone()).await;

    let err = connect_async(format!("ws://{addr}/output")).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 403);
        }
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
    assert!(!gw.gateway.session().is_ended());
}
