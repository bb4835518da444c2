use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use revmpi_proto::{CheckpointId, Command, CommandResult, InternalTopic, WorkerId};
use revmpi_symbol::{DebugModel, ParseOptions};

use crate::breakpoint::BreakpointKind;
use crate::checkpoint::{self, CheckpointEngine, CheckpointMode};
use crate::interceptor::{EventSink, Interception, MessageEventInterceptor};
use crate::process::{ProcessContext, StopEvent};
use crate::stack::{self, StackFrame};
use crate::variable;

const HELP: &str = "\
Commands:
    b <line>      set a breakpoint at <line> of the entry source file
                  (a negative line ignores the first hit)
    s             execute one instruction
    c             continue until the next breakpoint
    r <id>        restore a checkpoint
    p <var>       print a variable
    pd <topic>    print internal state (last, modules, vars, maps, loc, cp, bps)
    help          show this help
    q             quit";

/// Settings of a traced worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebuggerConfig {
    /// How checkpoints keep memory.
    pub checkpoint_mode: CheckpointMode,

    /// Spool directory of snapshot checkpoints.
    pub checkpoint_dir: PathBuf,

    /// Outermost function of stack walks, whose source file hosts user
    /// breakpoints.
    pub entry_function: String,

    /// Offset applied to source line numbers.
    pub line_offset: u64,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            checkpoint_mode: CheckpointMode::default(),
            checkpoint_dir: std::env::temp_dir(),
            entry_function: "main".to_owned(),
            line_offset: 0,
        }
    }
}

/// Applies [Command]s to a traced process.
///
/// Progress commands (single-step, continue) always end on a stop the user
/// asked for, or on process exit. Message events hit on the way are
/// recorded and reported to the event sink, without stopping.
pub struct Dispatcher {
    model: DebugModel,
    process: ProcessContext,
    checkpoints: CheckpointEngine,
    interceptor: MessageEventInterceptor,
    sink: Box<dyn EventSink>,
    entry_function: String,
    entry_file: String,
    stack: Vec<StackFrame>,
}

impl Dispatcher {
    /// Loads the debug information of `target`, launches it under trace and
    /// arms the message-event breakpoints.
    #[tracing::instrument(skip_all, fields(target = %target.as_ref().display()))]
    pub fn launch(
        target: impl AsRef<Path>,
        args: &[String],
        config: &DebuggerConfig,
        sink: Box<dyn EventSink>,
    ) -> crate::Result<Self> {
        let model = DebugModel::parse_with(
            target.as_ref(),
            ParseOptions {
                line_offset: config.line_offset,
            },
        )?;

        let entry_file = model.entry_source_file(&config.entry_function)?.to_owned();

        let mut process = ProcessContext::start(target, args, model.is_pie())?;

        let interceptor = MessageEventInterceptor::new(&model, &process);
        interceptor.arm(&mut process)?;

        let store = checkpoint::open_store(
            config.checkpoint_mode,
            &config.checkpoint_dir,
            &model,
            process.target(),
        );

        tracing::info!(store = store.name(), %entry_file, "debugger ready");

        Ok(Self {
            model,
            process,
            checkpoints: CheckpointEngine::new(store),
            interceptor,
            sink,
            entry_function: config.entry_function.clone(),
            entry_file,
            stack: Vec::new(),
        })
    }

    /// Traced process.
    pub fn process(&self) -> &ProcessContext {
        &self.process
    }

    /// Debug information of the traced executable.
    pub fn model(&self) -> &DebugModel {
        &self.model
    }

    /// Checkpoints taken so far.
    pub fn checkpoints(&self) -> &CheckpointEngine {
        &self.checkpoints
    }

    /// Call stack computed after the last command.
    pub fn stack(&self) -> &[StackFrame] {
        &self.stack
    }

    /// Source file hosting user breakpoints.
    pub fn entry_file(&self) -> &str {
        &self.entry_file
    }

    /// Sets the worker ID stamped on reported operations.
    pub fn set_worker_id(&mut self, worker_id: WorkerId) {
        self.interceptor.set_worker_id(worker_id);
    }

    /// Applies a command.
    ///
    /// Recoverable failures are reported through [CommandResult::error].
    /// An `Err` is fatal: the traced process can no longer be controlled.
    pub fn apply(&mut self, command: &Command) -> crate::Result<CommandResult> {
        tracing::debug!(%command, "applying command");

        if self.process.is_exited() && !matches!(command, Command::Quit | Command::Help) {
            return Ok(CommandResult {
                error: Some("process has exited".to_owned()),
                exited: true,
                output: None,
            });
        }

        let outcome = match command {
            Command::SetBreakpoint { line } => self.set_breakpoint(*line).map(Some),
            Command::SingleStep => self.progress(true),
            Command::Continue => self.progress(false),
            Command::Restore { checkpoint } => self.restore(checkpoint).map(Some),
            Command::Print { variable } => self.print(variable).map(Some),
            Command::PrintInternal { topic } => self.print_internal(*topic).map(Some),
            Command::Quit => {
                self.process.kill();
                Ok(None)
            }
            Command::Help => Ok(Some(HELP.to_owned())),
        };

        let mut result = match outcome {
            Ok(output) => CommandResult {
                output,
                ..Default::default()
            },
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, %command, "command failed");
                return Err(e);
            }
            Err(e) => {
                tracing::debug!(error = %e, %command, "command failed");
                CommandResult::with_error(e)
            }
        };

        result.exited = self.process.is_exited();

        if result.exited {
            self.stack.clear();
        } else {
            self.stack = stack::walk(&self.process, &self.model, &self.entry_function)?
                .map_while(Result::ok)
                .collect();

            if command.is_progress() {
                tracing::info!(stack = %stack::format_frames(&self.stack), "call stack");
            }
        }

        Ok(result)
    }

    fn set_breakpoint(&mut self, line: i64) -> crate::Result<String> {
        let static_addr = self.model.line_to_address(&self.entry_file, line.unsigned_abs())?;
        let addr = self.process.to_runtime(static_addr);

        if line < 0 {
            self.process.insert_breakpoint_skipping_first_hit(addr)?;
        } else {
            self.process.insert_breakpoint(addr, BreakpointKind::User)?;
        }

        Ok(format!(
            "breakpoint set at {addr:#x} (line {} of {})",
            line.unsigned_abs(),
            self.entry_file
        ))
    }

    fn progress(&mut self, single_step: bool) -> crate::Result<Option<String>> {
        let stop = self.process.continue_execution(single_step)?;

        self.settle(single_step, stop)?;

        if self.process.is_exited() {
            return Ok(None);
        }

        Ok(Some(self.location()?))
    }

    /// Clears the breakpoints hit after a resume, until a stop the user
    /// asked for.
    fn settle(&mut self, single_step: bool, mut stop: StopEvent) -> crate::Result<()> {
        loop {
            if let StopEvent::Exited(_) = stop {
                return Ok(());
            }

            let Some(bk) = self.process.restore_at_current_stop()? else {
                return Ok(());
            };

            if bk.skip_first_hit {
                tracing::debug!(addr = format_args!("{:#x}", bk.addr), "first hit skipped");

                stop = self.process.continue_execution(true)?;

                if stop == StopEvent::Trap {
                    self.process.rearm(&bk)?;
                }
            } else {
                let BreakpointKind::MessageEvent { op_name, .. } = &bk.kind else {
                    return Ok(());
                };

                let interception = self.interceptor.intercept(
                    &mut self.process,
                    &self.model,
                    &mut self.checkpoints,
                    self.sink.as_mut(),
                    &self.entry_function,
                    op_name,
                )?;

                if let Interception::Exited(code) = interception {
                    stop = StopEvent::Exited(code);
                }
            }

            if single_step || stop != StopEvent::Trap {
                return Ok(());
            }

            stop = self.process.continue_execution(false)?;
        }
    }

    fn restore(&mut self, id: &CheckpointId) -> crate::Result<String> {
        self.checkpoints
            .restore(&mut self.process, id, self.interceptor.breakpoints())?;

        Ok(format!("restored checkpoint {id} at {}", self.location()?))
    }

    fn print(&self, name: &str) -> crate::Result<String> {
        let var = variable::read_variable(&self.process, &self.model, &self.stack, name)?;
        Ok(var.to_string())
    }

    fn print_internal(&self, topic: InternalTopic) -> crate::Result<String> {
        let mut out = String::new();

        match topic {
            InternalTopic::Last => {
                for (i, frame) in self.stack.iter().enumerate() {
                    let _ = writeln!(out, "#{i} {frame}");
                }
            }
            InternalTopic::Modules => {
                for module in self.model.modules() {
                    let _ = writeln!(out, "{module}");
                }
            }
            InternalTopic::Vars => {
                for var in self.model.variables() {
                    let _ = writeln!(out, "{var}");
                }
            }
            InternalTopic::Maps => out = self.process.memory_maps_text()?,
            InternalTopic::Loc => out = self.location()?,
            InternalTopic::Checkpoints => {
                let _ = writeln!(out, "store: {}", self.checkpoints.store_name());
                for cp in self.checkpoints.checkpoints() {
                    let _ = writeln!(out, "{cp}");
                }
            }
            InternalTopic::Breakpoints => {
                for bk in self.process.breakpoints().sorted() {
                    match self.model.address_to_line(self.process.to_static(bk.addr)) {
                        Ok(loc) => {
                            let _ = writeln!(out, "{bk} line {} of {}", loc.line, loc.file);
                        }
                        Err(_) => {
                            let _ = writeln!(out, "{bk}");
                        }
                    }
                }
            }
        }

        Ok(out.trim_end().to_owned())
    }

    /// Describes where the process is stopped.
    fn location(&self) -> crate::Result<String> {
        let ip = self.process.registers()?.instr_addr();

        let Ok(loc) = self.model.address_to_line(self.process.to_static(ip)) else {
            return Ok(format!("ip={ip:#x} (no line information)"));
        };

        let function = loc.function.map(|f| f.name.as_str()).unwrap_or("??");

        Ok(format!("line {} of {} in {function} (ip={ip:#x})", loc.line, loc.file))
    }
}
