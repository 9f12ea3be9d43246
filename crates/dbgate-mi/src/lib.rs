//! Driver for gdb's machine interface (MI).
//!
//! [`MiClient`] launches `gdb --interpreter=mi2`, tags each [`Command`] with a
//! numeric token and matches result records back to the waiting caller.
//! Everything else gdb prints is split into four [`MiEvents`] streams.

pub mod command;
mod client;
mod error;
pub mod record;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use client::{GdbLaunch, MiClient, MiClientConfig, MiEvents};
pub use command::{Command, CommandError};
pub use error::{MiError, Result};
pub use record::{AsyncKind, AsyncRecord};
