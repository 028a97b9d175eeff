mod expr;
mod logger;
mod server;
mod variable;

use std::env;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use dap::events::{Event, OutputEventBody, StoppedEventBody};
use dap::requests::Command;
use dap::responses::{
    BreakpointLocationsResponse, ContinueResponse, EvaluateResponse, ResponseBody, ScopesResponse,
    SetBreakpointsResponse, SourceResponse, StackTraceResponse, StepInTargetsResponse,
    ThreadsResponse, VariablesResponse,
};
use dap::types::{
    Breakpoint, BreakpointLocation, Capabilities, OutputEventCategory, Scope,
    ScopePresentationhint, Source, StackFrame, StepInTarget, StoppedEventReason, Thread, Variable,
};
use itertools::Itertools;
use serde_json::Value;

use crate::debugger::state::ReconstructedState;
use crate::debugger::trace::AvmValue;
use crate::debugger::{Debugger, FrameSource, StopReason};
use expr::HoverExpr;
use logger::DapLogger;
use server::DapServer;
use variable::{Node, ReferenceRegistry, VarRef, VarScope};

pub const SIMULATE_RESPONSE_ENV: &str = "ALGORAND_SIMULATION_RESPONSE_PATH";
pub const SOURCES_DESCRIPTION_ENV: &str = "ALGORAND_TXN_GROUP_SOURCES_DESCRIPTION_PATH";

/// How long a `launch` waits for `configurationDone` before starting anyway.
const CONFIGURATION_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub simulate_trace_path: PathBuf,
    pub sources_path: PathBuf,
}

impl SessionConfig {
    pub fn from_env() -> anyhow::Result<SessionConfig> {
        let trace = env::var(SIMULATE_RESPONSE_ENV)
            .with_context(|| format!("{SIMULATE_RESPONSE_ENV} is not set"))?;
        let sources = env::var(SOURCES_DESCRIPTION_ENV)
            .with_context(|| format!("{SOURCES_DESCRIPTION_ENV} is not set"))?;

        Ok(SessionConfig {
            simulate_trace_path: PathBuf::from(trace),
            sources_path: PathBuf::from(sources),
        })
    }
}

/// One DAP session over one transport. Requests are served strictly in
/// order; every reply goes out before the stop event it causes.
pub struct DapApplication<R: Read, W: Write + Send + 'static> {
    server: DapServer<R, W>,
    config: SessionConfig,
    debugger: Option<Debugger>,
    registry: ReferenceRegistry,

    initialized: bool,
    configured: bool,
    started: bool,
    stop_on_entry: bool,
    terminated_sent: bool,
}

macro_rules! session_or_fail {
    ($self:expr, $seq:expr) => {{
        match $self.debugger.as_mut() {
            Some(debugger) => debugger,
            None => {
                $self.server.respond_error($seq, "No debug session")?;
                return Ok(true);
            }
        }
    }};
}

impl<R: Read, W: Write + Send + 'static> DapApplication<R, W> {
    pub fn new(input: R, output: W, config: SessionConfig) -> DapApplication<R, W> {
        DapApplication {
            server: DapServer::new(input, output),
            config,
            debugger: None,
            registry: ReferenceRegistry::default(),
            initialized: false,
            configured: false,
            started: false,
            stop_on_entry: false,
            terminated_sent: false,
        }
    }

    pub fn run(mut self) -> anyhow::Result<()> {
        let logger = DapLogger::new(self.server.output());
        let filter = logger.filter();
        crate::log::LOGGER.switch(logger, filter);

        loop {
            let req = match self.server.poll_request() {
                Ok(Some(req)) => req,
                Ok(None) => {
                    log::warn!("unexpected end of input stream");
                    break;
                }
                Err(e) => {
                    log::error!("{e}");
                    continue;
                }
            };

            match self.handle_request(req) {
                Ok(true) => { /* Success */ }
                Ok(false) => break,
                Err(e) => {
                    log::error!("{e}");
                }
            }
        }

        Ok(())
    }

    fn handle_request(&mut self, req: dap::requests::Request) -> anyhow::Result<bool> {
        let seq = req.seq;

        if !self.initialized
            && !matches!(req.command, Command::Initialize(_) | Command::Disconnect(_))
        {
            self.server.respond_error(seq, "Adapter is not initialized")?;
            return Ok(true);
        }

        match req.command {
            Command::Initialize(_args) => {
                self.initialized = true;
                self.server.respond_success(
                    seq,
                    ResponseBody::Initialize(Capabilities {
                        supports_configuration_done_request: Some(true),
                        supports_step_back: Some(true),
                        supports_breakpoint_locations_request: Some(true),
                        supports_evaluate_for_hovers: Some(true),
                        supports_delayed_stack_trace_loading: Some(true),
                        supports_step_in_targets_request: Some(true),
                        supports_single_thread_execution_requests: Some(false),
                        ..Default::default()
                    }),
                )?;
            }
            Command::Launch(args) => {
                return self.handle_launch(seq, args.additional_data, false);
            }
            Command::Attach(args) => {
                return self.handle_launch(seq, args.additional_data, true);
            }
            Command::ConfigurationDone => {
                self.configured = true;
                self.server
                    .respond_success(seq, ResponseBody::ConfigurationDone)?;
                if self.debugger.is_some() && !self.started {
                    self.start_session()?;
                }
            }
            Command::Threads => {
                self.server.respond_success(
                    seq,
                    ResponseBody::Threads(ThreadsResponse {
                        threads: vec![Thread {
                            id: 1,
                            name: "AVM execution".to_string(),
                        }],
                    }),
                )?;
            }
            Command::StackTrace(args) => {
                let debugger = session_or_fail!(self, seq);

                let frames = debugger.stack_frames();
                let start = args.start_frame.unwrap_or(0).max(0) as usize;
                let levels = match args.levels {
                    Some(levels) if levels > 0 => levels as usize,
                    _ => frames.len(),
                };

                let stack_frames = frames
                    .iter()
                    .enumerate()
                    .skip(start)
                    .take(levels)
                    .map(|(index, frame)| {
                        let source = match &frame.source {
                            FrameSource::Teal { path } => Source {
                                name: path
                                    .file_name()
                                    .map(|n| n.to_string_lossy().into_owned()),
                                path: Some(path.to_string_lossy().into_owned()),
                                ..Default::default()
                            },
                            FrameSource::Document { group_index, name } => Source {
                                name: Some(name.clone()),
                                source_reference: Some(*group_index as i32 + 1),
                                ..Default::default()
                            },
                        };

                        StackFrame {
                            id: index as i64,
                            name: frame.name.clone(),
                            source: Some(source),
                            line: i64::from(frame.line) + 1,
                            column: i64::from(frame.column) + 1,
                            ..Default::default()
                        }
                    })
                    .collect_vec();

                self.server.respond_success(
                    seq,
                    ResponseBody::StackTrace(StackTraceResponse {
                        total_frames: Some(frames.len() as i64),
                        stack_frames,
                    }),
                )?;
            }
            Command::Scopes(args) => {
                let frame = args.frame_id.max(0) as u32;
                self.server.respond_success(
                    seq,
                    ResponseBody::Scopes(ScopesResponse {
                        scopes: vec![
                            Scope {
                                name: "Execution State".to_string(),
                                presentation_hint: Some(ScopePresentationhint::Locals),
                                variables_reference: VarRef {
                                    scope: VarScope::Execution,
                                    frame,
                                    var_id: 0,
                                }
                                .pack(),
                                named_variables: Some(2),
                                expensive: false,
                                ..Default::default()
                            },
                            Scope {
                                name: "On-chain State".to_string(),
                                variables_reference: VarRef {
                                    scope: VarScope::Chain,
                                    frame,
                                    var_id: 0,
                                }
                                .pack(),
                                expensive: false,
                                ..Default::default()
                            },
                        ],
                    }),
                )?;
            }
            Command::Variables(args) => {
                let Some(var_ref) = VarRef::unpack(args.variables_reference as u64) else {
                    self.server.respond_error(seq, "Unknown variables reference")?;
                    return Ok(true);
                };

                let debugger = session_or_fail!(self, seq);
                let variables = match debugger.reconstructed_state(var_ref.frame as usize) {
                    Some(state) => collect_variables(&mut self.registry, var_ref, &state),
                    None => Vec::new(),
                };

                self.server.respond_success(
                    seq,
                    ResponseBody::Variables(VariablesResponse { variables }),
                )?;
            }
            Command::Evaluate(args) => {
                let debugger = session_or_fail!(self, seq);

                let hover = match expr::parse(&args.expression) {
                    Ok(hover) => hover,
                    Err(_) => {
                        self.server.respond_error(
                            seq,
                            format!("Unsupported expression: {}", args.expression),
                        )?;
                        return Ok(true);
                    }
                };

                let frame = args.frame_id.unwrap_or(0).max(0) as u32;
                let Some(state) = debugger.reconstructed_state(frame as usize) else {
                    self.server.respond_error(seq, "Unknown frame")?;
                    return Ok(true);
                };

                let evaluated = evaluate_hover(hover, &state);
                let (result, type_field, variables_reference) = match evaluated {
                    Ok(value) => {
                        let base = VarRef {
                            scope: VarScope::Execution,
                            frame,
                            var_id: 0,
                        };
                        let reference = match &value {
                            AvmValue::Bytes(bytes) => base
                                .with_node(self.registry.insert(Node::Bytes(bytes.clone())))
                                .pack(),
                            AvmValue::Uint(_) => 0,
                        };
                        (
                            variable::render_value(&value),
                            Some(variable::type_name(&value).to_string()),
                            reference,
                        )
                    }
                    // Out-of-range resolves to a message, not a failure.
                    Err(message) => (message, None, 0),
                };

                self.server.respond_success(
                    seq,
                    ResponseBody::Evaluate(EvaluateResponse {
                        result,
                        type_field,
                        variables_reference,
                        ..Default::default()
                    }),
                )?;
            }
            Command::BreakpointLocations(args) => {
                let debugger = session_or_fail!(self, seq);

                let file = args
                    .source
                    .path
                    .as_deref()
                    .and_then(|path| debugger.file_for_client_path(path.as_ref()));

                let breakpoints = match file {
                    Some(file) => {
                        let first = client_line_to_index(args.line);
                        let last = client_line_to_index(args.end_line.unwrap_or(args.line));
                        debugger
                            .breakpoint_locations(file, first..=last.max(first))
                            .into_iter()
                            .map(|(line, column)| BreakpointLocation {
                                line: i64::from(line) + 1,
                                column: Some(i64::from(column) + 1),
                                ..Default::default()
                            })
                            .collect_vec()
                    }
                    None => Vec::new(),
                };

                self.server.respond_success(
                    seq,
                    ResponseBody::BreakpointLocations(BreakpointLocationsResponse { breakpoints }),
                )?;
            }
            Command::SetBreakpoints(args) => {
                let requests = args
                    .breakpoints
                    .iter()
                    .flatten()
                    .map(|bp| {
                        (
                            client_line_to_index(bp.line),
                            bp.column.map(client_line_to_index),
                        )
                    })
                    .collect_vec();

                let file = self.debugger.as_ref().and_then(|debugger| {
                    args.source
                        .path
                        .as_deref()
                        .and_then(|path| debugger.file_for_client_path(path.as_ref()))
                });

                let requested = args.breakpoints.iter().flatten();
                let breakpoints = match (file, self.debugger.as_mut()) {
                    (Some(file), Some(debugger)) => debugger
                        .set_breakpoints(file, &requests)
                        .into_iter()
                        .zip(requested)
                        .map(|(bp, orig)| Breakpoint {
                            id: Some(bp.id),
                            verified: bp.verified,
                            source: Some(args.source.clone()),
                            line: Some(orig.line),
                            column: bp.resolved_column.map(|c| i64::from(c) + 1),
                            ..Default::default()
                        })
                        .collect_vec(),
                    // No session or unknown file: report everything unverified.
                    _ => requested
                        .map(|orig| Breakpoint {
                            verified: false,
                            source: Some(args.source.clone()),
                            line: Some(orig.line),
                            ..Default::default()
                        })
                        .collect_vec(),
                };

                self.server.respond_success(
                    seq,
                    ResponseBody::SetBreakpoints(SetBreakpointsResponse { breakpoints }),
                )?;
            }
            Command::StepInTargets(_args) => {
                let debugger = session_or_fail!(self, seq);

                let targets = debugger
                    .step_in_targets()
                    .into_iter()
                    .map(|target| StepInTarget {
                        id: target.id,
                        label: target.label,
                        line: target.line.map(|l| i64::from(l) + 1),
                        column: target.column.map(|c| i64::from(c) + 1),
                        ..Default::default()
                    })
                    .collect_vec();

                self.server.respond_success(
                    seq,
                    ResponseBody::StepInTargets(StepInTargetsResponse { targets }),
                )?;
            }
            Command::Next(_args) => {
                let debugger = session_or_fail!(self, seq);
                let reason = debugger.step_over();
                self.server.respond_success(seq, ResponseBody::Next)?;
                self.emit_stop(reason)?;
            }
            Command::StepIn(_args) => {
                let debugger = session_or_fail!(self, seq);
                let reason = debugger.step_in();
                self.server.respond_success(seq, ResponseBody::StepIn)?;
                self.emit_stop(reason)?;
            }
            Command::StepOut(_args) => {
                let debugger = session_or_fail!(self, seq);
                let reason = debugger.step_out();
                self.server.respond_success(seq, ResponseBody::StepOut)?;
                self.emit_stop(reason)?;
            }
            Command::StepBack(_args) => {
                let debugger = session_or_fail!(self, seq);
                let reason = debugger.step_back();
                self.server.respond_success(seq, ResponseBody::StepBack)?;
                self.emit_stop(reason)?;
            }
            Command::Continue(_args) => {
                let debugger = session_or_fail!(self, seq);
                let reason = debugger.continue_forward();
                self.server.respond_success(
                    seq,
                    ResponseBody::Continue(ContinueResponse {
                        ..Default::default()
                    }),
                )?;
                self.emit_stop(reason)?;
            }
            Command::ReverseContinue(_args) => {
                let debugger = session_or_fail!(self, seq);
                let reason = debugger.reverse_continue();
                self.server
                    .respond_success(seq, ResponseBody::ReverseContinue)?;
                self.emit_stop(reason)?;
            }
            Command::Source(args) => {
                let debugger = session_or_fail!(self, seq);

                let group_index = (args.source_reference.max(1) - 1) as usize;
                match debugger.document_text(group_index) {
                    Some(content) => self.server.respond_success(
                        seq,
                        ResponseBody::Source(SourceResponse {
                            content: content.to_string(),
                            mime_type: Some("application/json".to_string()),
                        }),
                    )?,
                    None => self.server.respond_error(seq, "Unknown source reference")?,
                }
            }
            Command::Disconnect(_) => {
                self.server.respond_success(seq, ResponseBody::Disconnect)?;
                return Ok(false);
            }
            _ => {
                log::warn!("unknown command: {:?}", req.command);
                self.server.respond_cancel(seq)?;
            }
        }

        Ok(true)
    }

    fn handle_launch(
        &mut self,
        seq: i64,
        data: Option<Value>,
        attach: bool,
    ) -> anyhow::Result<bool> {
        if self.debugger.is_some() {
            self.server.respond_error(seq, "Session already launched")?;
            return Ok(true);
        }

        let mut trace_path = self.config.simulate_trace_path.clone();
        let mut sources_path = self.config.sources_path.clone();
        if let Some(data) = &data {
            if let Some(path) = data.get("simulateTracePath").and_then(Value::as_str) {
                trace_path = PathBuf::from(path);
            }
            if let Some(path) = data
                .get("txnGroupSourcesDescriptionPath")
                .and_then(Value::as_str)
            {
                sources_path = PathBuf::from(path);
            }
            self.stop_on_entry = data
                .get("stopOnEntry")
                .and_then(Value::as_bool)
                .unwrap_or(false);
        }

        match Debugger::launch(&trace_path, &sources_path) {
            Ok(debugger) => {
                self.debugger = Some(debugger);

                let body = if attach {
                    ResponseBody::Attach
                } else {
                    ResponseBody::Launch
                };
                self.server.respond_success(seq, body)?;
                self.server.send_event(Event::Initialized)?;

                if self.configured {
                    self.start_session()?;
                    Ok(true)
                } else {
                    self.await_configuration()
                }
            }
            Err(e) => {
                log::error!("launch failed: {e}");
                self.server.respond_error(seq, format!("launch failed: {e}"))?;
                self.server.send_event(Event::Output(OutputEventBody {
                    category: Some(OutputEventCategory::Stderr),
                    output: format!("cannot load simulation trace: {e}\n"),
                    ..Default::default()
                }))?;
                self.server.send_event(Event::Terminated(None))?;
                self.terminated_sent = true;
                Ok(true)
            }
        }
    }

    /// Serves requests until `configurationDone` arrives, bounded by
    /// [`CONFIGURATION_WAIT`], then starts the session. Clients are allowed
    /// to set breakpoints between `launch` and `configurationDone`.
    fn await_configuration(&mut self) -> anyhow::Result<bool> {
        let deadline = Instant::now() + CONFIGURATION_WAIT;

        while !self.configured && Instant::now() < deadline {
            let req = match self.server.poll_request() {
                Ok(Some(req)) => req,
                Ok(None) => return Ok(false),
                Err(e) => {
                    log::error!("{e}");
                    break;
                }
            };
            if !self.handle_request(req)? {
                return Ok(false);
            }
        }

        if !self.configured {
            log::warn!("configurationDone not received, starting the session anyway");
        }
        if !self.started {
            self.start_session()?;
        }
        Ok(true)
    }

    fn start_session(&mut self) -> anyhow::Result<()> {
        if self.started {
            return Ok(());
        }
        let Some(debugger) = self.debugger.as_mut() else {
            return Ok(());
        };
        self.started = true;

        let reason = if debugger.terminated() {
            StopReason::Terminated
        } else if self.stop_on_entry {
            StopReason::Entry
        } else {
            debugger.continue_forward()
        };
        self.emit_stop(reason)
    }

    fn emit_stop(&mut self, reason: StopReason) -> anyhow::Result<()> {
        self.registry.clear();

        match reason {
            StopReason::Terminated => {
                if !self.terminated_sent {
                    self.server.send_event(Event::Terminated(None))?;
                    self.terminated_sent = true;
                }
            }
            StopReason::Entry | StopReason::Step | StopReason::Breakpoint { .. } => {
                let (reason, hit_breakpoint_ids) = match reason {
                    StopReason::Entry => (StoppedEventReason::Entry, None),
                    StopReason::Breakpoint { id } => {
                        (StoppedEventReason::Breakpoint, Some(vec![id]))
                    }
                    _ => (StoppedEventReason::Step, None),
                };

                self.server.send_event(Event::Stopped(StoppedEventBody {
                    reason,
                    description: None,
                    thread_id: Some(1),
                    preserve_focus_hint: None,
                    text: None,
                    all_threads_stopped: None,
                    hit_breakpoint_ids,
                }))?;
            }
        }

        Ok(())
    }
}

/// Client lines/columns are 1-based. Out-of-range input maps to a line no
/// source map can contain, so it verifies nothing and matches nothing.
fn client_line_to_index(line: i64) -> u32 {
    if line < 1 {
        u32::MAX
    } else {
        (line - 1).min(i64::from(u32::MAX)) as u32
    }
}

fn evaluate_hover(hover: HoverExpr, state: &ReconstructedState) -> Result<AvmValue, String> {
    match hover {
        HoverExpr::Stack(index) => {
            let len = state.stack.len() as i64;
            let absolute = if index < 0 { len + index } else { index };
            if (0..len).contains(&absolute) {
                Ok(state.stack[absolute as usize].clone())
            } else {
                Err(format!("stack[{index}] out of range"))
            }
        }
        HoverExpr::Scratch(slot) => {
            if (0..=255).contains(&slot) {
                Ok(state
                    .scratch
                    .get(&(slot as u8))
                    .cloned()
                    .unwrap_or(AvmValue::Uint(0)))
            } else {
                Err(format!("scratch[{slot}] out of range"))
            }
        }
    }
}

/// Children of a variables reference, resolved against the reconstructed
/// state of the reference's frame.
fn collect_variables(
    registry: &mut ReferenceRegistry,
    var_ref: VarRef,
    state: &ReconstructedState,
) -> Vec<Variable> {
    let node = if var_ref.var_id == 0 {
        match var_ref.scope {
            VarScope::Execution => {
                return vec![
                    Variable {
                        name: "stack".to_string(),
                        value: format!("{} values", state.stack.len()),
                        variables_reference: var_ref.with_node(registry.insert(Node::Stack)).pack(),
                        indexed_variables: Some(state.stack.len() as i64),
                        ..Default::default()
                    },
                    Variable {
                        name: "scratch".to_string(),
                        value: format!("{} slots", state.scratch.len()),
                        variables_reference: var_ref
                            .with_node(registry.insert(Node::Scratch))
                            .pack(),
                        named_variables: Some(state.scratch.len() as i64),
                        ..Default::default()
                    },
                ];
            }
            VarScope::Chain => {
                return state
                    .chain
                    .apps
                    .keys()
                    .map(|&app_id| Variable {
                        name: format!("app {app_id}"),
                        value: "application state".to_string(),
                        variables_reference: var_ref
                            .with_node(registry.insert(Node::App(app_id)))
                            .pack(),
                        named_variables: Some(3),
                        ..Default::default()
                    })
                    .collect_vec();
            }
            VarScope::None => return Vec::new(),
        }
    } else {
        match registry.get(var_ref.var_id) {
            Some(node) => node.clone(),
            None => return Vec::new(),
        }
    };

    match node {
        Node::Stack => state
            .stack
            .iter()
            .enumerate()
            .map(|(index, value)| {
                variable::avm_variable(registry, var_ref, index.to_string(), value)
            })
            .collect_vec(),
        Node::Scratch => state
            .scratch
            .iter()
            .map(|(slot, value)| variable::avm_variable(registry, var_ref, slot.to_string(), value))
            .collect_vec(),
        Node::App(app_id) => {
            let (globals, locals, boxes) = match state.chain.apps.get(&app_id) {
                Some(app) => (app.global.len(), app.local.len(), app.boxes.len()),
                None => (0, 0, 0),
            };
            vec![
                Variable {
                    name: "globalState".to_string(),
                    value: format!("{globals} entries"),
                    variables_reference: var_ref
                        .with_node(registry.insert(Node::AppGlobal(app_id)))
                        .pack(),
                    named_variables: Some(globals as i64),
                    ..Default::default()
                },
                Variable {
                    name: "localState".to_string(),
                    value: format!("{locals} accounts"),
                    variables_reference: var_ref
                        .with_node(registry.insert(Node::AppLocal(app_id)))
                        .pack(),
                    named_variables: Some(locals as i64),
                    ..Default::default()
                },
                Variable {
                    name: "boxState".to_string(),
                    value: format!("{boxes} entries"),
                    variables_reference: var_ref
                        .with_node(registry.insert(Node::AppBoxes(app_id)))
                        .pack(),
                    named_variables: Some(boxes as i64),
                    ..Default::default()
                },
            ]
        }
        Node::AppGlobal(app_id) => state
            .chain
            .apps
            .get(&app_id)
            .map(|app| byte_map_variables(registry, var_ref, &app.global))
            .unwrap_or_default(),
        Node::AppBoxes(app_id) => state
            .chain
            .apps
            .get(&app_id)
            .map(|app| byte_map_variables(registry, var_ref, &app.boxes))
            .unwrap_or_default(),
        Node::AppLocal(app_id) => state
            .chain
            .apps
            .get(&app_id)
            .map(|app| {
                app.local
                    .iter()
                    .map(|(account, entries)| Variable {
                        name: account.clone(),
                        value: format!("{} entries", entries.len()),
                        variables_reference: var_ref
                            .with_node(
                                registry
                                    .insert(Node::AppLocalAccount(app_id, account.clone())),
                            )
                            .pack(),
                        named_variables: Some(entries.len() as i64),
                        ..Default::default()
                    })
                    .collect_vec()
            })
            .unwrap_or_default(),
        Node::AppLocalAccount(app_id, account) => state
            .chain
            .apps
            .get(&app_id)
            .and_then(|app| app.local.get(&account))
            .map(|entries| byte_map_variables(registry, var_ref, entries))
            .unwrap_or_default(),
        Node::Bytes(bytes) => variable::expand_bytes(&bytes),
    }
}

fn byte_map_variables(
    registry: &mut ReferenceRegistry,
    var_ref: VarRef,
    map: &crate::debugger::state::ByteMap,
) -> Vec<Variable> {
    map.iter()
        .map(|(key, value)| {
            variable::avm_variable(registry, var_ref, variable::render_key(key), value)
        })
        .collect_vec()
}
