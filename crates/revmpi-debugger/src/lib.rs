//! This crate implements the per-process side of revmpi: a ptrace-based
//! debugger which can step, continue, set breakpoints and read variables of
//! a message-passing worker process, and which can **rewind** it to any
//! message operation it performed.
//!
//! Every call to a function of the message wrapper is intercepted by an
//! internal breakpoint. The debugger then captures a checkpoint (registers,
//! memory and breakpoints) and reports an [OperationRecord] to an
//! [EventSink], so that a coordinator can reason about causality across
//! processes.
//!
//! The [Dispatcher] applies commands synchronously, on the thread which
//! launched the process. [WorkerSession] wraps it into an async handle.
//!
//! # Supported Platforms
//!
//! Linux `x86_64` only.
//!
//! [OperationRecord]: revmpi_proto::OperationRecord

mod breakpoint;
pub mod checkpoint;
mod dispatcher;
mod error;
mod interceptor;
mod process;
mod session;
mod stack;
mod sys;
mod variable;

pub use self::breakpoint::{Breakpoint, BreakpointKind, BreakpointTable, MessageBreakpoint};
pub use self::dispatcher::{DebuggerConfig, Dispatcher};
pub use self::error::{Error, Result};
pub use self::interceptor::{EventSink, Interception, MessageEventInterceptor};
pub use self::process::{ProcessContext, ProcessState, StopEvent, StopReason};
pub use self::session::WorkerSession;
pub use self::stack::{StackFrame, StackWalk, format_frames, walk};
pub use self::sys::{MemoryMap, Registers};
pub use self::variable::{Value, VariableValue, read_global, read_variable};
