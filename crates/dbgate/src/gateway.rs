use std::{sync::Arc, time::Duration};

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::sync::Mutex;

use crate::{
    access::{self, AccessGuard},
    backend::DebugBackend,
    dispatch::{self, Dispatcher},
    events::{self, EnvelopeSink, EventStreams, ForwardOutcome},
    sandbox::{self, AuthorizedPaths},
    session::Session,
};

const TARGET: &str = "dbgate.events";

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Shared state behind every HTTP route.
pub struct Gateway<B: DebugBackend> {
    dispatcher: Arc<Dispatcher<B>>,
    /// Held by the viewer currently attached to `/output`.
    events: Mutex<EventStreams<B::Record>>,
    sandbox: AuthorizedPaths,
    heartbeat: Duration,
}

impl<B: DebugBackend> Gateway<B> {
    pub fn new(
        dispatcher: Arc<Dispatcher<B>>,
        events: EventStreams<B::Record>,
        sandbox: AuthorizedPaths,
    ) -> Self {
        Self {
            dispatcher,
            events: Mutex::new(events),
            sandbox,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher<B> {
        &self.dispatcher
    }

    pub fn session(&self) -> &Session<B> {
        self.dispatcher.session()
    }

    pub fn sandbox(&self) -> &AuthorizedPaths {
        &self.sandbox
    }

    /// Builds the HTTP surface. Every route sits behind `guard`.
    pub fn router(self: Arc<Self>, guard: AccessGuard) -> Router {
        dispatch::routes::<B>()
            .route("/handle/file/get", post(sandbox::file_get::<B>))
            .route("/output", get(events::output::<B>))
            .layer(middleware::from_fn_with_state(guard, access::enforce))
            .with_state(self)
    }

    /// Streams debugger output into `sink` until the viewer goes away or the
    /// session ends.
    ///
    /// Only one viewer receives events at a time; a second one waits here until
    /// the first disconnects. Losing the attached viewer ends the session.
    pub async fn stream_events<S: EnvelopeSink>(&self, mut sink: S) {
        let shutdown = self.session().shutdown_token();
        let mut streams = tokio::select! {
            _ = shutdown.cancelled() => return,
            streams = self.events.lock() => streams,
        };

        tracing::info!(target: TARGET, "viewer attached to event stream");
        match events::forward(&mut sink, &mut streams, self.heartbeat, shutdown).await {
            ForwardOutcome::Disconnected => {
                drop(streams);
                tracing::info!(target: TARGET, "viewer disconnected");
                self.session().teardown().await;
            }
            ForwardOutcome::SessionEnded => {
                tracing::debug!(target: TARGET, "session ended while streaming events");
            }
        }
    }
}
