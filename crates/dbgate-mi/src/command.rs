//! Typed MI commands.
//!
//! Parameter structs use PascalCase field names so they decode directly from
//! the JSON bodies browser clients send. Every field is optional.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("{field} must not contain line breaks")]
    LineBreak { field: &'static str },
    #[error("{0} is required")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExecNextParams {
    pub reverse: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExecStepParams {
    pub reverse: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExecContinueParams {
    pub reverse: bool,
    pub all: bool,
    pub thread_group: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExecRunParams {
    pub all: bool,
    pub thread_group: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExecArgsParams {
    pub args: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExecInterruptParams {
    pub all: bool,
    pub thread_group: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BreakInsertParams {
    pub location: String,
    pub temporary: bool,
    pub hardware: bool,
    pub pending: bool,
    pub disabled: bool,
    pub tracepoint: bool,
    pub condition: String,
    pub ignore_count: u32,
    pub thread_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BreakEnableParams {
    pub breakpoints: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BreakDisableParams {
    pub breakpoints: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ThreadSelectParams {
    pub thread_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ThreadInfoParams {
    pub thread_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StackListFramesParams {
    pub no_frame_filters: bool,
    pub low_frame: Option<u32>,
    pub high_frame: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StackListVariablesParams {
    pub thread: String,
    pub frame: String,
    pub no_frame_filters: bool,
    pub skip_unavailable: bool,
    pub all_values: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VarCreateParams {
    /// Variable object name; empty lets gdb pick one.
    pub name: String,
    /// Frame address, `*` (current frame) or `@` (floating); empty means `*`.
    pub frame_addr: String,
    pub expression: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VarDeleteParams {
    pub name: String,
    pub children_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VarListChildrenParams {
    pub name: String,
    pub all_values: bool,
    pub from: Option<i64>,
    pub to: Option<i64>,
}

/// One request against the debugger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ExecNext(ExecNextParams),
    ExecStep(ExecStepParams),
    ExecContinue(ExecContinueParams),
    ExecRun(ExecRunParams),
    ExecArguments(ExecArgsParams),
    ExecInterrupt(ExecInterruptParams),
    BreakInsert(BreakInsertParams),
    BreakEnable(BreakEnableParams),
    BreakDisable(BreakDisableParams),
    BreakList,
    ThreadListIds,
    ThreadSelect(ThreadSelectParams),
    ThreadInfo(ThreadInfoParams),
    StackInfoFrame,
    StackListFrames(StackListFramesParams),
    StackListVariables(StackListVariablesParams),
    VarCreate(VarCreateParams),
    VarDelete(VarDeleteParams),
    VarListChildren(VarListChildrenParams),
}

impl Command {
    /// The MI operation name, without the leading dash.
    pub fn name(&self) -> &'static str {
        match self {
            Command::ExecNext(_) => "exec-next",
            Command::ExecStep(_) => "exec-step",
            Command::ExecContinue(_) => "exec-continue",
            Command::ExecRun(_) => "exec-run",
            Command::ExecArguments(_) => "exec-arguments",
            Command::ExecInterrupt(_) => "exec-interrupt",
            Command::BreakInsert(_) => "break-insert",
            Command::BreakEnable(_) => "break-enable",
            Command::BreakDisable(_) => "break-disable",
            Command::BreakList => "break-list",
            Command::ThreadListIds => "thread-list-ids",
            Command::ThreadSelect(_) => "thread-select",
            Command::ThreadInfo(_) => "thread-info",
            Command::StackInfoFrame => "stack-info-frame",
            Command::StackListFrames(_) => "stack-list-frames",
            Command::StackListVariables(_) => "stack-list-variables",
            Command::VarCreate(_) => "var-create",
            Command::VarDelete(_) => "var-delete",
            Command::VarListChildren(_) => "var-list-children",
        }
    }

    /// Renders the command line (without token or trailing newline).
    pub fn to_mi(&self) -> Result<String, CommandError> {
        let mut line = MiLine::new(self.name());
        match self {
            Command::ExecNext(params) => {
                line.flag(params.reverse, "--reverse");
            }
            Command::ExecStep(params) => {
                line.flag(params.reverse, "--reverse");
            }
            Command::ExecContinue(params) => {
                line.flag(params.reverse, "--reverse");
                line.thread_scope(params.all, &params.thread_group)?;
            }
            Command::ExecRun(params) => {
                line.thread_scope(params.all, &params.thread_group)?;
            }
            Command::ExecArguments(params) => {
                // gdb takes the remainder of the line verbatim as the argument string.
                reject_line_breaks("Args", &params.args)?;
                if !params.args.is_empty() {
                    line.raw(&params.args);
                }
            }
            Command::ExecInterrupt(params) => {
                line.thread_scope(params.all, &params.thread_group)?;
            }
            Command::BreakInsert(params) => {
                line.flag(params.temporary, "-t");
                line.flag(params.hardware, "-h");
                line.flag(params.pending, "-f");
                line.flag(params.disabled, "-d");
                line.flag(params.tracepoint, "-a");
                if !params.condition.is_empty() {
                    line.option("-c", "Condition", &params.condition)?;
                }
                if params.ignore_count > 0 {
                    line.raw("-i");
                    line.raw(&params.ignore_count.to_string());
                }
                if !params.thread_id.is_empty() {
                    line.option("-p", "ThreadId", &params.thread_id)?;
                }
                if !params.location.is_empty() {
                    line.arg("Location", &params.location)?;
                }
            }
            Command::BreakEnable(params) => {
                line.args("Breakpoints", &params.breakpoints)?;
            }
            Command::BreakDisable(params) => {
                line.args("Breakpoints", &params.breakpoints)?;
            }
            Command::BreakList | Command::ThreadListIds | Command::StackInfoFrame => {}
            Command::ThreadSelect(params) => {
                if params.thread_id.is_empty() {
                    return Err(CommandError::Missing("ThreadId"));
                }
                line.arg("ThreadId", &params.thread_id)?;
            }
            Command::ThreadInfo(params) => {
                if !params.thread_id.is_empty() {
                    line.arg("ThreadId", &params.thread_id)?;
                }
            }
            Command::StackListFrames(params) => {
                line.flag(params.no_frame_filters, "--no-frame-filters");
                if let (Some(low), Some(high)) = (params.low_frame, params.high_frame) {
                    line.raw(&low.to_string());
                    line.raw(&high.to_string());
                }
            }
            Command::StackListVariables(params) => {
                if !params.thread.is_empty() {
                    line.option("--thread", "Thread", &params.thread)?;
                }
                if !params.frame.is_empty() {
                    line.option("--frame", "Frame", &params.frame)?;
                }
                line.flag(params.no_frame_filters, "--no-frame-filters");
                line.flag(params.skip_unavailable, "--skip-unavailable");
                line.raw(if params.all_values {
                    "--all-values"
                } else {
                    "--simple-values"
                });
            }
            Command::VarCreate(params) => {
                if params.expression.is_empty() {
                    return Err(CommandError::Missing("Expression"));
                }
                line.arg("Name", non_empty_or(&params.name, "-"))?;
                line.arg("FrameAddr", non_empty_or(&params.frame_addr, "*"))?;
                line.arg("Expression", &params.expression)?;
            }
            Command::VarDelete(params) => {
                if params.name.is_empty() {
                    return Err(CommandError::Missing("Name"));
                }
                line.flag(params.children_only, "-c");
                line.arg("Name", &params.name)?;
            }
            Command::VarListChildren(params) => {
                if params.name.is_empty() {
                    return Err(CommandError::Missing("Name"));
                }
                line.flag(params.all_values, "--all-values");
                line.arg("Name", &params.name)?;
                if let (Some(from), Some(to)) = (params.from, params.to) {
                    line.raw(&from.to_string());
                    line.raw(&to.to_string());
                }
            }
        }
        Ok(line.finish())
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

fn reject_line_breaks(field: &'static str, value: &str) -> Result<(), CommandError> {
    if value.contains(&['\n', '\r'][..]) {
        Err(CommandError::LineBreak { field })
    } else {
        Ok(())
    }
}

struct MiLine {
    buf: String,
}

impl MiLine {
    fn new(operation: &str) -> Self {
        let mut buf = String::with_capacity(64);
        buf.push('-');
        buf.push_str(operation);
        Self { buf }
    }

    fn raw(&mut self, text: &str) {
        self.buf.push(' ');
        self.buf.push_str(text);
    }

    fn flag(&mut self, enabled: bool, flag: &str) {
        if enabled {
            self.raw(flag);
        }
    }

    fn arg(&mut self, field: &'static str, value: &str) -> Result<(), CommandError> {
        reject_line_breaks(field, value)?;
        self.buf.push(' ');
        push_quoted(&mut self.buf, value);
        Ok(())
    }

    fn args(&mut self, field: &'static str, values: &[String]) -> Result<(), CommandError> {
        if values.is_empty() {
            return Err(CommandError::Missing(field));
        }
        for value in values {
            self.arg(field, value)?;
        }
        Ok(())
    }

    fn option(&mut self, option: &str, field: &'static str, value: &str) -> Result<(), CommandError> {
        self.raw(option);
        self.arg(field, value)
    }

    fn thread_scope(&mut self, all: bool, thread_group: &str) -> Result<(), CommandError> {
        if all {
            self.raw("--all");
        } else if !thread_group.is_empty() {
            self.option("--thread-group", "ThreadGroup", thread_group)?;
        }
        Ok(())
    }

    fn finish(self) -> String {
        self.buf
    }
}

/// Emits `value` bare when it is a plain word, otherwise as an MI c-string.
fn push_quoted(out: &mut String, value: &str) {
    let plain = !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\\' || c == '\'');
    if plain {
        out.push_str(value);
        return;
    }
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\{:03o}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
