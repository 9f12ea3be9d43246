use std::{
    collections::HashMap,
    ffi::OsString,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde_json::{Map, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    process::Child,
    sync::{mpsc, oneshot, Mutex},
};
use tokio_util::sync::CancellationToken;

use crate::{
    command::Command,
    error::{MiError, Result},
    record::{parse_line, AsyncRecord, Record, ResultClass, ResultRecord, StreamKind},
};

const TARGET: &str = "dbgate.mi";

#[derive(Debug, Clone)]
pub struct MiClientConfig {
    pub reply_timeout: Duration,
    /// How long gdb gets to honour `-gdb-exit` before it is killed.
    pub exit_grace: Duration,
    pub event_channel_size: usize,
}

impl Default for MiClientConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(30),
            exit_grace: Duration::from_secs(2),
            event_channel_size: 1024,
        }
    }
}

/// What to launch: the gdb binary, the program to debug and an optional source directory.
#[derive(Debug, Clone)]
pub struct GdbLaunch {
    pub gdb: PathBuf,
    pub program: PathBuf,
    pub source_dir: Option<PathBuf>,
}

impl GdbLaunch {
    fn args(&self) -> Vec<OsString> {
        let mut args = vec![OsString::from("--interpreter=mi2"), OsString::from("--quiet")];
        if let Some(dir) = &self.source_dir {
            let mut arg = OsString::from("--directory=");
            arg.push(dir);
            args.push(arg);
        }
        args.push(self.program.clone().into_os_string());
        args
    }
}

/// The four asynchronous output streams of a gdb session.
///
/// Channels are bounded; events that arrive while a channel is full are dropped
/// so that command replies are never held up by an absent viewer.
#[derive(Debug)]
pub struct MiEvents {
    pub console: mpsc::Receiver<String>,
    pub target: mpsc::Receiver<String>,
    pub log: mpsc::Receiver<String>,
    pub records: mpsc::Receiver<AsyncRecord>,
}

#[derive(Debug, Clone)]
struct EventSinks {
    console: mpsc::Sender<String>,
    target: mpsc::Sender<String>,
    log: mpsc::Sender<String>,
    records: mpsc::Sender<AsyncRecord>,
}

impl EventSinks {
    fn channel(capacity: usize) -> (Self, MiEvents) {
        let capacity = capacity.max(1);
        let (console_tx, console) = mpsc::channel(capacity);
        let (target_tx, target) = mpsc::channel(capacity);
        let (log_tx, log) = mpsc::channel(capacity);
        let (records_tx, records) = mpsc::channel(capacity);
        (
            Self {
                console: console_tx,
                target: target_tx,
                log: log_tx,
                records: records_tx,
            },
            MiEvents {
                console,
                target,
                log,
                records,
            },
        )
    }

    fn stream(&self, kind: StreamKind, text: String) {
        let (tx, stream) = match kind {
            StreamKind::Console => (&self.console, "console"),
            StreamKind::Target => (&self.target, "target"),
            StreamKind::Log => (&self.log, "log"),
        };
        forward(tx, stream, text);
    }

    fn record(&self, record: AsyncRecord) {
        forward(&self.records, "async", record);
    }
}

fn forward<T>(tx: &mpsc::Sender<T>, stream: &'static str, value: T) {
    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(value) {
        tracing::debug!(target: TARGET, stream, "event channel full; dropping event");
    }
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct Inner {
    writer: Mutex<Writer>,
    pending: parking_lot::Mutex<HashMap<u64, oneshot::Sender<ResultRecord>>>,
    next_token: AtomicU64,
    /// Cancelled once gdb's output stream ends.
    shutdown: CancellationToken,
    /// Cancelled once the gdb process (or, for stream clients, its output) is gone.
    exited: CancellationToken,
    kill: CancellationToken,
    exit_status: parking_lot::Mutex<Option<Result<ExitStatus, String>>>,
    config: MiClientConfig,
}

/// Token-tagged command channel to a gdb process running in MI mode.
#[derive(Clone)]
pub struct MiClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiClient")
            .field("closed", &self.inner.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl MiClient {
    /// Launches gdb and starts reading its output.
    pub fn spawn(launch: &GdbLaunch, config: MiClientConfig) -> Result<(Self, MiEvents)> {
        let mut command = tokio::process::Command::new(&launch.gdb);
        command
            .args(launch.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| MiError::Spawn {
            program: launch.gdb.display().to_string(),
            source,
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(MiError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "gdb stdio pipes unavailable",
            )));
        };

        tracing::info!(
            target: TARGET,
            gdb = %launch.gdb.display(),
            program = %launch.program.display(),
            pid = ?child.id(),
            "launched gdb"
        );

        let (client, sinks, events) = Self::start(stdout, stdin, config);
        tokio::spawn(read_stderr(stderr, sinks));
        tokio::spawn(wait_for_exit(child, client.inner.clone()));
        Ok((client, events))
    }

    /// Drives an MI session over arbitrary streams. The session counts as exited
    /// once `reader` reaches end of input.
    pub fn from_streams<R, W>(reader: R, writer: W, config: MiClientConfig) -> (Self, MiEvents)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (client, _sinks, events) = Self::start(reader, writer, config);
        let inner = client.inner.clone();
        tokio::spawn(async move {
            inner.shutdown.cancelled().await;
            inner.exited.cancel();
        });
        (client, events)
    }

    fn start<R, W>(reader: R, writer: W, config: MiClientConfig) -> (Self, EventSinks, MiEvents)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (sinks, events) = EventSinks::channel(config.event_channel_size);
        let inner = Arc::new(Inner {
            writer: Mutex::new(Box::new(writer)),
            pending: parking_lot::Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            exited: CancellationToken::new(),
            kill: CancellationToken::new(),
            exit_status: parking_lot::Mutex::new(None),
            config,
        });
        tokio::spawn(read_loop(reader, inner.clone(), sinks.clone()));
        (Self { inner }, sinks, events)
    }

    /// Sends one command and waits for its result record.
    ///
    /// `^error` replies become [`MiError::Rejected`] carrying gdb's message.
    pub async fn request(&self, command: &Command) -> Result<Map<String, Value>> {
        let line = command.to_mi()?;
        if self.inner.shutdown.is_cancelled() {
            return Err(MiError::ConnectionClosed);
        }

        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(token, tx);
        let _pending = PendingGuard {
            inner: &self.inner,
            token,
        };

        tracing::debug!(target: TARGET, token, command = command.name(), "sending command");
        self.write_line(format!("{token}{line}\n").as_bytes()).await?;

        let record = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return Err(MiError::ConnectionClosed),
            res = tokio::time::timeout(self.inner.config.reply_timeout, rx) => {
                match res {
                    Ok(Ok(record)) => record,
                    Ok(Err(_closed)) => return Err(MiError::ConnectionClosed),
                    Err(_elapsed) => return Err(MiError::Timeout),
                }
            }
        };

        match record.class {
            ResultClass::Error => Err(MiError::Rejected(
                record.error_message().unwrap_or("unknown gdb error").to_owned(),
            )),
            ResultClass::Done | ResultClass::Running | ResultClass::Connected | ResultClass::Exit => {
                Ok(record.results)
            }
        }
    }

    /// Asks gdb to quit; kills it if it is still running after the grace period.
    ///
    /// `-gdb-exit` is written directly and does not wait behind queued commands.
    pub async fn exit(&self) {
        if let Err(err) = self.write_line(b"-gdb-exit\n").await {
            tracing::debug!(target: TARGET, error = %err, "failed to send -gdb-exit");
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.exited.cancelled() => {}
                _ = tokio::time::sleep(inner.config.exit_grace) => {
                    tracing::warn!(target: TARGET, "gdb did not exit in time; killing it");
                    inner.kill.cancel();
                }
            }
        });
    }

    /// Resolves once gdb has exited. Returns the exit status when a process was launched.
    pub async fn wait(&self) -> Result<Option<ExitStatus>> {
        self.inner.exited.cancelled().await;
        match self.inner.exit_status.lock().clone() {
            Some(Ok(status)) => Ok(Some(status)),
            Some(Err(message)) => Err(MiError::Wait(message)),
            None => Ok(None),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    async fn write_line(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

}

/// Forgets a request's reply slot however `request` returns, including when its
/// future is dropped before gdb answers.
struct PendingGuard<'a> {
    inner: &'a Inner,
    token: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.token);
    }
}

async fn read_loop<R: AsyncRead + Unpin>(reader: R, inner: Arc<Inner>, sinks: EventSinks) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = reader.read_until(b'\n', &mut buf) => res,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(target: TARGET, error = %err, "gdb output stream failed");
                break;
            }
        }

        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(&['\r', '\n'][..]);
        match parse_line(line) {
            Ok(Record::Result(record)) => {
                let tx = match record.token {
                    Some(token) => inner.pending.lock().remove(&token),
                    None => None,
                };
                match tx {
                    Some(tx) => {
                        let _ = tx.send(record);
                    }
                    None => {
                        tracing::debug!(target: TARGET, token = ?record.token, "unsolicited result record");
                    }
                }
            }
            Ok(Record::Async(record)) => sinks.record(record),
            Ok(Record::Stream(record)) => sinks.stream(record.kind, record.text),
            Ok(Record::Prompt) => {}
            // Anything that is not MI is the debuggee writing to the terminal it shares with gdb.
            Err(_) => sinks.stream(StreamKind::Target, format!("{line}\n")),
        }
    }

    inner.shutdown.cancel();

    // Dropping the senders fails every waiting `request` with `ConnectionClosed`.
    let pending = std::mem::take(&mut *inner.pending.lock());
    drop(pending);
}

async fn read_stderr<R: AsyncRead + Unpin>(stderr: R, sinks: EventSinks) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        sinks.stream(StreamKind::Log, format!("{line}\n"));
    }
}

async fn wait_for_exit(mut child: Child, inner: Arc<Inner>) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = inner.kill.cancelled() => {
            if let Err(err) = child.start_kill() {
                tracing::debug!(target: TARGET, error = %err, "failed to kill gdb");
            }
            child.wait().await
        }
    };

    let status = match status {
        Ok(status) => {
            tracing::info!(target: TARGET, %status, "gdb exited");
            Ok(status)
        }
        Err(err) => {
            tracing::error!(target: TARGET, error = %err, "failed to wait for gdb");
            Err(err.to_string())
        }
    };
    *inner.exit_status.lock() = Some(status);
    inner.exited.cancel();
}
