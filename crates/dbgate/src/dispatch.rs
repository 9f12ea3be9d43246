//! `/handle/...` command routes.
//!
//! Each route decodes its parameters, runs exactly one backend command and maps
//! the outcome onto a status code. Decode failures never reach the backend.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, MethodRouter},
    Router,
};
use dbgate_mi::command::{
    BreakDisableParams, BreakEnableParams, BreakInsertParams, ExecArgsParams, ExecContinueParams,
    ExecInterruptParams, ExecNextParams, ExecRunParams, ExecStepParams, StackListFramesParams,
    StackListVariablesParams, ThreadInfoParams, ThreadSelectParams, VarCreateParams,
    VarDeleteParams, VarListChildrenParams,
};
use dbgate_mi::Command;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{
    backend::{BackendError, DebugBackend},
    error::GatewayError,
    gateway::Gateway,
    session::Session,
};

const TARGET: &str = "dbgate.dispatch";

/// Runs backend commands strictly one after another.
///
/// Waiting callers queue in arrival order; all of them fail fast once the session ends.
/// A command that has reached the backend keeps the turn until it is answered, even
/// when its caller has gone away.
pub struct Dispatcher<B> {
    session: Arc<Session<B>>,
    turn: Arc<Mutex<()>>,
}

impl<B: DebugBackend> Dispatcher<B> {
    pub fn new(session: Arc<Session<B>>) -> Self {
        Self {
            session,
            turn: Arc::new(Mutex::new(())),
        }
    }

    pub fn session(&self) -> &Arc<Session<B>> {
        &self.session
    }

    pub async fn invoke(&self, command: Command) -> Result<Value, GatewayError> {
        let shutdown = self.session.shutdown_token();
        if shutdown.is_cancelled() {
            return Err(GatewayError::SessionEnded);
        }

        let name = command.name();
        let turn = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(GatewayError::SessionEnded),
            turn = self.turn.clone().lock_owned() => turn,
        };

        tracing::debug!(target: TARGET, command = name, "dispatching");
        let session = self.session.clone();
        let running = tokio::spawn(async move {
            let result = session.backend().execute(command).await;
            drop(turn);
            result
        });

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(GatewayError::SessionEnded),
            joined = running => match joined {
                Ok(result) => result.map_err(GatewayError::from),
                Err(err) => Err(GatewayError::Backend(BackendError::Unavailable(format!(
                    "{name} did not complete: {err}"
                )))),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Reply {
    Empty,
    Json,
}

pub(crate) fn decode<P: DeserializeOwned>(body: &[u8]) -> Result<P, GatewayError> {
    serde_json::from_slice(body).map_err(|err| GatewayError::Decode(err.to_string()))
}

pub(crate) fn error_response(err: GatewayError) -> Response {
    if err.is_client_error() {
        tracing::debug!(target: TARGET, error = %err, "request rejected");
    } else {
        tracing::warn!(target: TARGET, error = %err, "request failed");
    }
    err.into_response()
}

async fn respond<B: DebugBackend>(
    dispatcher: &Dispatcher<B>,
    command: Result<Command, GatewayError>,
    reply: Reply,
) -> Response {
    let outcome = async {
        let value = dispatcher.invoke(command?).await?;
        Ok::<_, GatewayError>(match reply {
            Reply::Empty => StatusCode::OK.into_response(),
            Reply::Json => {
                let body = serde_json::to_vec(&value)?;
                ([(CONTENT_TYPE, "application/json")], body).into_response()
            }
        })
    };
    outcome.await.unwrap_or_else(error_response)
}

fn command<B, P>(build: fn(P) -> Command, reply: Reply) -> MethodRouter<Arc<Gateway<B>>>
where
    B: DebugBackend,
    P: DeserializeOwned + 'static,
{
    post(
        move |State(gateway): State<Arc<Gateway<B>>>, body: Bytes| async move {
            let command = decode::<P>(&body).map(build);
            respond(gateway.dispatcher(), command, reply).await
        },
    )
}

/// Parameterless queries accept GET as well as POST and ignore any body.
fn query<B: DebugBackend>(command: Command) -> MethodRouter<Arc<Gateway<B>>> {
    let handler = move |State(gateway): State<Arc<Gateway<B>>>| {
        let command = command.clone();
        async move { respond(gateway.dispatcher(), Ok(command), Reply::Json).await }
    };
    get(handler.clone()).post(handler)
}

async fn exec_interrupt<B: DebugBackend>(
    State(gateway): State<Arc<Gateway<B>>>,
    body: Bytes,
) -> Response {
    let params = match decode::<ExecInterruptParams>(&body) {
        Ok(params) => params,
        Err(err) => return error_response(err),
    };
    // Interrupting races with the program stopping by itself; failures are expected.
    if let Err(err) = gateway
        .dispatcher()
        .invoke(Command::ExecInterrupt(params))
        .await
    {
        tracing::debug!(target: TARGET, error = %err, "interrupt failed");
    }
    StatusCode::OK.into_response()
}

async fn gdb_exit<B: DebugBackend>(State(gateway): State<Arc<Gateway<B>>>) -> StatusCode {
    gateway.session().teardown().await;
    StatusCode::OK
}

pub(crate) fn routes<B: DebugBackend>() -> Router<Arc<Gateway<B>>> {
    Router::new()
        .route(
            "/handle/exec/next",
            command::<B, ExecNextParams>(Command::ExecNext, Reply::Empty),
        )
        .route(
            "/handle/exec/step",
            command::<B, ExecStepParams>(Command::ExecStep, Reply::Empty),
        )
        .route(
            "/handle/exec/continue",
            command::<B, ExecContinueParams>(Command::ExecContinue, Reply::Empty),
        )
        .route(
            "/handle/exec/run",
            command::<B, ExecRunParams>(Command::ExecRun, Reply::Empty),
        )
        .route(
            "/handle/exec/args",
            command::<B, ExecArgsParams>(Command::ExecArguments, Reply::Empty),
        )
        .route("/handle/exec/interrupt", post(exec_interrupt::<B>))
        .route(
            "/handle/breakpoint/insert",
            command::<B, BreakInsertParams>(Command::BreakInsert, Reply::Json),
        )
        .route(
            "/handle/breakpoint/enable",
            command::<B, BreakEnableParams>(Command::BreakEnable, Reply::Empty),
        )
        .route(
            "/handle/breakpoint/disable",
            command::<B, BreakDisableParams>(Command::BreakDisable, Reply::Empty),
        )
        .route("/handle/breakpoint/list", query::<B>(Command::BreakList))
        .route("/handle/thread/listids", query::<B>(Command::ThreadListIds))
        .route(
            "/handle/thread/select",
            command::<B, ThreadSelectParams>(Command::ThreadSelect, Reply::Json),
        )
        .route(
            "/handle/thread/info",
            command::<B, ThreadInfoParams>(Command::ThreadInfo, Reply::Json),
        )
        .route("/handle/frame/stackinfo", query::<B>(Command::StackInfoFrame))
        .route(
            "/handle/frame/stacklist",
            command::<B, StackListFramesParams>(Command::StackListFrames, Reply::Json),
        )
        .route(
            "/handle/frame/variableslist",
            command::<B, StackListVariablesParams>(Command::StackListVariables, Reply::Json),
        )
        .route(
            "/handle/variable/create",
            command::<B, VarCreateParams>(Command::VarCreate, Reply::Json),
        )
        .route(
            "/handle/variable/delete",
            command::<B, VarDeleteParams>(Command::VarDelete, Reply::Empty),
        )
        .route(
            "/handle/variable/listchildren",
            command::<B, VarListChildrenParams>(Command::VarListChildren, Reply::Json),
        )
        .route("/handle/gdb/exit", get(gdb_exit::<B>).post(gdb_exit::<B>))
}
