//! The `/output` event stream.
//!
//! One forwarding loop per connected viewer fans in the four debugger output
//! channels plus a heartbeat timer and writes each item as a JSON envelope:
//!
//! ```json
//! {"Type": "console", "Data": "Breakpoint 1, main () at hello.c:4\n"}
//! ```
//!
//! The heartbeat is an inactivity timeout: it fires only when nothing else was
//! sent for a full interval.

use std::{future::Future, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use dbgate_mi::{AsyncRecord, MiEvents};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{backend::DebugBackend, gateway::Gateway};

const TARGET: &str = "dbgate.events";

/// Receiving ends of the debugger's output channels.
#[derive(Debug)]
pub struct EventStreams<R> {
    pub console: mpsc::Receiver<String>,
    pub target: mpsc::Receiver<String>,
    pub log: mpsc::Receiver<String>,
    pub records: mpsc::Receiver<R>,
}

impl From<MiEvents> for EventStreams<AsyncRecord> {
    fn from(events: MiEvents) -> Self {
        Self {
            console: events.console,
            target: events.target,
            log: events.log,
            records: events.records,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "Type", content = "Data", rename_all = "lowercase")]
pub enum Envelope<R> {
    Console(String),
    Target(String),
    #[serde(rename = "gdb")]
    Log(String),
    Async(R),
    /// Always carries an empty string.
    Heartbeat(&'static str),
}

impl<R> Envelope<R> {
    pub fn heartbeat() -> Self {
        Envelope::Heartbeat("")
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Console(_) => "console",
            Envelope::Target(_) => "target",
            Envelope::Log(_) => "gdb",
            Envelope::Async(_) => "async",
            Envelope::Heartbeat(_) => "heartbeat",
        }
    }
}

/// Where serialized envelopes go.
pub trait EnvelopeSink: Send {
    type Error: std::fmt::Display;

    fn send_text(&mut self, text: String) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

impl EnvelopeSink for SplitSink<WebSocket, Message> {
    type Error = axum::Error;

    async fn send_text(&mut self, text: String) -> Result<(), Self::Error> {
        self.send(Message::Text(text)).await
    }
}

impl EnvelopeSink for mpsc::Sender<String> {
    type Error = mpsc::error::SendError<String>;

    async fn send_text(&mut self, text: String) -> Result<(), Self::Error> {
        self.send(text).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// A write failed; the viewer is gone.
    Disconnected,
    /// The session ended while forwarding.
    SessionEnded,
}

/// Forwards events until a write fails or `shutdown` fires.
///
/// Envelopes of the same type keep their channel order. Envelopes that fail to
/// serialize are logged and dropped.
pub async fn forward<S, R>(
    sink: &mut S,
    streams: &mut EventStreams<R>,
    heartbeat_interval: Duration,
    shutdown: &CancellationToken,
) -> ForwardOutcome
where
    S: EnvelopeSink,
    R: Serialize + Send,
{
    let heartbeat = tokio::time::sleep(heartbeat_interval);
    tokio::pin!(heartbeat);

    loop {
        let envelope = tokio::select! {
            _ = shutdown.cancelled() => return ForwardOutcome::SessionEnded,
            Some(text) = streams.console.recv() => Envelope::Console(text),
            Some(text) = streams.target.recv() => Envelope::Target(text),
            Some(text) = streams.log.recv() => Envelope::Log(text),
            Some(record) = streams.records.recv() => Envelope::Async(record),
            () = &mut heartbeat => Envelope::heartbeat(),
        };

        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(
                    target: TARGET,
                    kind = envelope.kind(),
                    error = %err,
                    "dropping event that failed to serialize"
                );
                continue;
            }
        };

        if let Err(err) = sink.send_text(text).await {
            tracing::debug!(target: TARGET, error = %err, "event stream write failed");
            return ForwardOutcome::Disconnected;
        }
        heartbeat
            .as_mut()
            .reset(tokio::time::Instant::now() + heartbeat_interval);
    }
}

pub(crate) async fn output<B: DebugBackend>(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<Gateway<B>>>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let (sink, mut incoming) = socket.split();
        // Keep reading so control frames get answered; viewers never send data.
        let drain = tokio::spawn(async move { while let Some(Ok(_)) = incoming.next().await {} });
        gateway.stream_events(sink).await;
        drain.abort();
    })
}
