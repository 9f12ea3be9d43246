//! Debug session gateway.
//!
//! Exposes one gdb session to browser clients:
//!
//! - `/handle/...` routes run debugger commands one at a time ([`Dispatcher`]).
//! - `/output` is a WebSocket that streams the debugger's output as JSON envelopes
//!   with an inactivity heartbeat ([`events`]).
//! - `/handle/file/get` serves source files from an allow-list of roots ([`AuthorizedPaths`]).
//! - Off-loopback listeners require a per-process access token ([`AccessGuard`]).
//!
//! The [`Session`] ties the pieces together: a viewer disconnect or an explicit exit
//! tears it down once, and every later command fails fast.

pub mod access;
pub mod backend;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod gateway;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod tls;

pub use access::{AccessDecision, AccessGuard, AccessMode, AccessToken};
pub use backend::{BackendError, DebugBackend};
pub use dispatch::Dispatcher;
pub use error::GatewayError;
pub use events::{Envelope, EnvelopeSink, EventStreams, ForwardOutcome};
pub use gateway::Gateway;
pub use sandbox::AuthorizedPaths;
pub use server::Listener;
pub use session::{Session, Supervisor, SupervisorError};
