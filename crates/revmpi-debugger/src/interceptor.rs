use std::collections::BTreeMap;

use revmpi_proto::{CheckpointId, OperationRecord, WorkerId, ops};
use revmpi_symbol::DebugModel;

use crate::breakpoint::MessageBreakpoint;
use crate::checkpoint::CheckpointEngine;
use crate::process::{ProcessContext, ProcessState, StopEvent};
use crate::stack::{self, StackFrame};
use crate::variable;

/// Receiver of the message operations recorded by a worker.
pub trait EventSink: Send {
    /// Hands over a recorded operation.
    fn report(&mut self, record: OperationRecord);
}

impl EventSink for tokio::sync::mpsc::UnboundedSender<OperationRecord> {
    fn report(&mut self, record: OperationRecord) {
        if self.send(record).is_err() {
            tracing::warn!("event receiver dropped");
        }
    }
}

impl EventSink for Vec<OperationRecord> {
    fn report(&mut self, record: OperationRecord) {
        self.push(record);
    }
}

/// Outcome of [MessageEventInterceptor::intercept].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interception {
    /// The operation was recorded under this checkpoint.
    Recorded(CheckpointId),
    /// The process exited before the operation could be captured.
    Exited(i32),
}

/// Records message operations, caught by breakpoints armed in the
/// functions of the message wrapper.
pub struct MessageEventInterceptor {
    breakpoints: Vec<MessageBreakpoint>,
    worker_id: WorkerId,
}

impl MessageEventInterceptor {
    /// Locates the message-event breakpoint of every wrapped function.
    ///
    /// The breakpoint goes on the second line-table address of the function,
    /// past its prologue (or on the first one, if it is the only one).
    pub fn new(model: &DebugModel, process: &ProcessContext) -> Self {
        let breakpoints = model
            .message_functions()
            .iter()
            .filter_map(|message_fn| {
                let function = model.function(message_fn.function);

                let mut addrs = model
                    .entries_in(function)
                    .into_iter()
                    .map(|entry| entry.address)
                    .collect::<Vec<_>>();
                addrs.sort_unstable();
                addrs.dedup();

                let Some(addr) = addrs.get(1).or(addrs.first()) else {
                    tracing::warn!(function = %function.name, "message function without line entries");
                    return None;
                };

                Some(MessageBreakpoint {
                    addr: process.to_runtime(*addr),
                    function: function.id,
                    op_name: message_fn.op_name.clone(),
                })
            })
            .collect::<Vec<_>>();

        tracing::debug!(count = breakpoints.len(), "message-event breakpoints located");

        Self {
            breakpoints,
            worker_id: WorkerId(0),
        }
    }

    /// Where message-event breakpoints go.
    pub fn breakpoints(&self) -> &[MessageBreakpoint] {
        &self.breakpoints
    }

    /// Worker ID stamped on recorded operations.
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Sets the ID assigned by the coordinator.
    pub fn set_worker_id(&mut self, worker_id: WorkerId) {
        self.worker_id = worker_id;
    }

    /// Arms every message-event breakpoint not armed yet.
    pub fn arm(&self, process: &mut ProcessContext) -> crate::Result<()> {
        process.arm_missing(&self.breakpoints)
    }

    /// Records the operation `op_name`, whose breakpoint was just cleared.
    ///
    /// Steps past the breakpoint instruction and arms the message-event
    /// breakpoints again. Then lets the checkpoint store prepare the capture,
    /// takes a checkpoint, reads the operation's arguments and reports the
    /// operation to `sink`.
    #[tracing::instrument(skip_all, fields(op = op_name))]
    pub fn intercept(
        &self,
        process: &mut ProcessContext,
        model: &DebugModel,
        checkpoints: &mut CheckpointEngine,
        sink: &mut dyn EventSink,
        entry_function: &str,
        op_name: &str,
    ) -> crate::Result<Interception> {
        if let StopEvent::Exited(code) = process.continue_execution(true)? {
            return Ok(Interception::Exited(code));
        }

        self.arm(process)?;

        checkpoints.prepare(process, model, op_name)?;

        if let ProcessState::Exited(code) = process.state() {
            return Ok(Interception::Exited(code));
        }

        let frames = stack::walk(process, model, entry_function)?
            .map_while(Result::ok)
            .collect::<Vec<_>>();

        let checkpoint_id = checkpoints.create(process, model, op_name)?;

        let record = OperationRecord {
            checkpoint_id: checkpoint_id.clone(),
            op_name: op_name.to_owned(),
            parameters: capture_arguments(process, model, &frames, op_name)?,
            worker_id: self.worker_id,
        };

        tracing::debug!(?record, "operation recorded");

        sink.report(record);

        Ok(Interception::Recorded(checkpoint_id))
    }
}

fn capture_arguments(
    process: &ProcessContext,
    model: &DebugModel,
    frames: &[StackFrame],
    op_name: &str,
) -> crate::Result<BTreeMap<String, String>> {
    let mut parameters = BTreeMap::new();

    for (param, var_name) in ops::captured_arguments(op_name) {
        match variable::read_variable(process, model, frames, var_name) {
            Ok(var) => {
                parameters.insert((*param).to_owned(), var.value.to_string());
            }
            Err(e) if !e.is_fatal() => {
                tracing::debug!(error = %e, param, "argument not captured");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(parameters)
}
