//! The contract the gateway needs from a debugger.

use std::future::Future;

use dbgate_mi::{AsyncRecord, Command, MiClient, MiError};
use serde::Serialize;
use serde_json::Value;

const TARGET: &str = "dbgate.session";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The debugger refused the command (bad location, unknown thread, ...).
    #[error("{0}")]
    Rejected(String),
    /// The debugger could not be reached or did not answer.
    #[error("{0}")]
    Unavailable(String),
}

impl From<MiError> for BackendError {
    fn from(err: MiError) -> Self {
        match err {
            MiError::Rejected(message) => BackendError::Rejected(message),
            MiError::InvalidCommand(err) => BackendError::Rejected(err.to_string()),
            other => BackendError::Unavailable(other.to_string()),
        }
    }
}

/// A debugger that runs one command at a time.
///
/// Callers are responsible for never having two `execute` calls in flight.
pub trait DebugBackend: Send + Sync + 'static {
    /// Payload of async status records forwarded to viewers.
    type Record: Serialize + Send + 'static;

    fn execute(&self, command: Command) -> impl Future<Output = Result<Value, BackendError>> + Send;

    /// Asks the debugger to quit. Must not wait behind an in-flight command.
    fn exit(&self) -> impl Future<Output = ()> + Send;

    /// Resolves once the debugger process is gone.
    fn wait(&self) -> impl Future<Output = Result<(), BackendError>> + Send;
}

impl DebugBackend for MiClient {
    type Record = AsyncRecord;

    async fn execute(&self, command: Command) -> Result<Value, BackendError> {
        let results = self.request(&command).await?;
        Ok(Value::Object(results))
    }

    async fn exit(&self) {
        MiClient::exit(self).await;
    }

    async fn wait(&self) -> Result<(), BackendError> {
        let status = MiClient::wait(self).await?;
        if let Some(status) = status {
            tracing::info!(target: TARGET, %status, "debugger process ended");
        }
        Ok(())
    }
}
