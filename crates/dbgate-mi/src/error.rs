use crate::command::CommandError;

#[derive(Debug, thiserror::Error)]
pub enum MiError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    InvalidCommand(#[from] CommandError),

    /// gdb answered `^error`; the message is gdb's own.
    #[error("{0}")]
    Rejected(String),

    #[error("gdb connection closed")]
    ConnectionClosed,

    #[error("timed out waiting for gdb reply")]
    Timeout,

    #[error("failed to wait for gdb: {0}")]
    Wait(String),
}

pub type Result<T, E = MiError> = std::result::Result<T, E>;
