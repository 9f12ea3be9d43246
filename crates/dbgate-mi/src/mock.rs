//! Scripted in-memory gdb peer for tests.
//!
//! Every command gets `^done` unless a different reply was registered for its
//! operation. `-gdb-exit` is answered with `^exit`, after which the peer hangs up.

use std::{collections::HashMap, sync::Arc};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf},
    sync::Mutex,
};

use crate::client::{MiClient, MiClientConfig, MiEvents};

const DUPLEX_CAPACITY: usize = 64 * 1024;

#[derive(Default)]
struct Script {
    replies: HashMap<String, String>,
    commands: Vec<String>,
}

struct MockInner {
    writer: Mutex<Option<WriteHalf<DuplexStream>>>,
    script: parking_lot::Mutex<Script>,
}

#[derive(Clone)]
pub struct MockGdb {
    inner: Arc<MockInner>,
}

impl MockGdb {
    /// Connects a fresh [`MiClient`] to a scripted peer.
    pub fn spawn(config: MiClientConfig) -> (MiClient, MiEvents, MockGdb) {
        let (client_side, peer_side) = tokio::io::duplex(DUPLEX_CAPACITY);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (peer_read, peer_write) = tokio::io::split(peer_side);

        let mock = MockGdb {
            inner: Arc::new(MockInner {
                writer: Mutex::new(Some(peer_write)),
                script: parking_lot::Mutex::new(Script::default()),
            }),
        };
        tokio::spawn(mock.clone().respond(peer_read));

        let (client, events) = MiClient::from_streams(client_read, client_write, config);
        (client, events, mock)
    }

    /// Registers the reply (without token) for an operation such as `-break-insert`.
    pub fn reply_to(&self, operation: &str, reply: &str) {
        self.inner
            .script
            .lock()
            .replies
            .insert(operation.to_owned(), reply.to_owned());
    }

    /// Never answers the given operation.
    pub fn stay_silent_on(&self, operation: &str) {
        self.reply_to(operation, "");
    }

    /// Command lines received so far, without their tokens.
    pub fn commands(&self) -> Vec<String> {
        self.inner.script.lock().commands.clone()
    }

    /// Writes a raw output line to the client.
    pub async fn emit(&self, line: &str) {
        self.write(line).await;
    }

    /// Hangs up, as if gdb died.
    pub async fn close(&self) {
        let mut writer = self.inner.writer.lock().await;
        if let Some(mut writer) = writer.take() {
            let _ = writer.shutdown().await;
        }
    }

    async fn write(&self, line: &str) {
        let mut writer = self.inner.writer.lock().await;
        if let Some(writer) = writer.as_mut() {
            let _ = writer.write_all(format!("{line}\n").as_bytes()).await;
        }
    }

    async fn respond(self, reader: ReadHalf<DuplexStream>) {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let split = line
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(line.len());
            let (token, command) = line.split_at(split);
            let operation = command.split_whitespace().next().unwrap_or_default().to_owned();

            let reply = {
                let mut script = self.inner.script.lock();
                script.commands.push(command.to_owned());
                script
                    .replies
                    .get(&operation)
                    .cloned()
                    .unwrap_or_else(|| "^done".to_owned())
            };

            if operation == "-gdb-exit" {
                self.write(&format!("{token}^exit")).await;
                self.close().await;
                return;
            }
            if reply.is_empty() {
                continue;
            }
            self.write(&format!("{token}{reply}")).await;
            self.write("(gdb) ").await;
        }
    }
}
