use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use dbgate_mi::command::{ExecArgsParams, ExecRunParams};
use dbgate_mi::Command;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{BackendError, DebugBackend},
    dispatch::Dispatcher,
    error::GatewayError,
};

const TARGET: &str = "dbgate.session";

/// The one debug session of this process.
///
/// `shutdown` is cancelled exactly once, either by [`Session::teardown`] or when the
/// debugger exits on its own. Everything that talks to the backend selects on it.
pub struct Session<B> {
    backend: B,
    shutdown: CancellationToken,
    torn_down: AtomicBool,
}

impl<B: DebugBackend> Session<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            shutdown: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_ended(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Ends the session and asks the debugger to quit.
    ///
    /// Only the first call does anything; concurrent and later calls return immediately.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            tracing::debug!(target: TARGET, "session teardown already requested");
            return;
        }
        tracing::info!(target: TARGET, "tearing down debug session");
        self.shutdown.cancel();
        self.backend.exit().await;
    }

    /// Marks the session as over after the debugger went away by itself.
    fn finish(&self) {
        self.torn_down.store(true, Ordering::Release);
        self.shutdown.cancel();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to start the debug session ({command}): {source}")]
    Startup {
        command: &'static str,
        #[source]
        source: GatewayError,
    },
    #[error("lost track of the debugger: {0}")]
    Wait(#[source] BackendError),
}

/// Starts the program under the debugger and waits for the debugger to go away.
pub struct Supervisor<B> {
    dispatcher: Arc<Dispatcher<B>>,
}

impl<B: DebugBackend> Supervisor<B> {
    pub fn new(dispatcher: Arc<Dispatcher<B>>) -> Self {
        Self { dispatcher }
    }

    /// Sets the program arguments, runs the program, then blocks until the debugger exits.
    ///
    /// Startup failures tear the session down and are returned as errors. A session
    /// ended by a viewer before startup finished is not an error.
    pub async fn run(&self, program_args: String) -> Result<(), SupervisorError> {
        let session = self.dispatcher.session();

        if let Err(err) = self.start(program_args).await {
            if matches!(
                err,
                SupervisorError::Startup {
                    source: GatewayError::SessionEnded,
                    ..
                }
            ) {
                tracing::info!(target: TARGET, "session ended before the program started");
            } else {
                session.teardown().await;
                return Err(err);
            }
        }

        let outcome = session.backend().wait().await;
        session.finish();
        tracing::info!(target: TARGET, "debug session finished");
        outcome.map_err(SupervisorError::Wait)
    }

    async fn start(&self, args: String) -> Result<(), SupervisorError> {
        self.dispatcher
            .invoke(Command::ExecArguments(ExecArgsParams { args }))
            .await
            .map_err(|source| SupervisorError::Startup {
                command: "exec-arguments",
                source,
            })?;
        self.dispatcher
            .invoke(Command::ExecRun(ExecRunParams::default()))
            .await
            .map_err(|source| SupervisorError::Startup {
                command: "exec-run",
                source,
            })?;
        Ok(())
    }
}
