//! Checkpoints of a traced process.

mod fork;
mod snapshot;
mod store;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use revmpi_proto::CheckpointId;
use revmpi_symbol::DebugModel;

pub use self::fork::ForkStore;
pub use self::snapshot::SnapshotStore;
pub use self::store::{CaptureContext, CheckpointStore, MemoryImage, MemoryRegion};
use crate::breakpoint::{BreakpointTable, MessageBreakpoint};
use crate::process::ProcessContext;
use crate::sys::Registers;

/// Checkpoint capture strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CheckpointMode {
    /// Copy memory into spool files.
    #[default]
    Snapshot,
    /// Keep memory in process images forked by the message wrapper.
    Fork,
}

/// State of a traced process captured at a message operation.
pub struct Checkpoint {
    /// Unique ID.
    pub id: CheckpointId,

    /// Operation that triggered the capture.
    pub op_name: String,

    /// Registers at capture time.
    pub registers: Registers,

    /// Breakpoints armed at capture time.
    pub breakpoints: BreakpointTable,

    image: Box<dyn MemoryImage>,
}

/// Append-only log of the checkpoints of one process.
pub struct CheckpointEngine {
    store: Box<dyn CheckpointStore>,
    checkpoints: Vec<Checkpoint>,
}

/// Opens the store for `mode`.
///
/// The fork strategy needs support from the message wrapper. When it is
/// unavailable, the snapshot strategy is used instead.
pub fn open_store(
    mode: CheckpointMode,
    spool_dir: &Path,
    model: &DebugModel,
    target: &Path,
) -> Box<dyn CheckpointStore> {
    if mode == CheckpointMode::Fork {
        match ForkStore::new(model, spool_dir, target) {
            Ok(store) => return Box::new(store),
            Err(e) => tracing::warn!(error = %e, "falling back to snapshot checkpoints"),
        }
    }

    Box::new(SnapshotStore::new(spool_dir, target))
}

impl Checkpoint {
    /// Descriptors of the captured memory.
    pub fn regions(&self) -> &[MemoryRegion] {
        self.image.regions()
    }
}

impl CheckpointEngine {
    /// Creates an empty log over `store`.
    pub fn new(store: Box<dyn CheckpointStore>) -> Self {
        Self {
            store,
            checkpoints: Vec::new(),
        }
    }

    /// Name of the capture strategy in use.
    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Checkpoints, oldest first.
    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Checkpoint with this ID.
    pub fn get(&self, id: &CheckpointId) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|cp| &cp.id == id)
    }

    /// Runs the process stopped at the start of `op_name` up to where the
    /// store captures it.
    ///
    /// A store that cannot prepare the capture is not an error: the
    /// checkpoint is then taken wherever the process stopped.
    #[tracing::instrument(skip_all, fields(op = op_name))]
    pub fn prepare(&mut self, process: &mut ProcessContext, model: &DebugModel, op_name: &str) -> crate::Result<()> {
        match self.store.prepare(process, model, op_name) {
            Err(e) if !e.is_fatal() => {
                tracing::warn!(error = %e, "capture not prepared");
                Ok(())
            }
            res => res,
        }
    }

    /// Captures registers, memory and breakpoints of the stopped process.
    #[tracing::instrument(skip_all, fields(op = op_name))]
    pub fn create(
        &mut self,
        process: &ProcessContext,
        model: &DebugModel,
        op_name: &str,
    ) -> crate::Result<CheckpointId> {
        let registers = process.registers()?;

        let image = self.store.capture(&CaptureContext { process, model })?;

        let mut id = CheckpointId::random();
        while self.get(&id).is_some() {
            id = CheckpointId::random();
        }

        tracing::info!(id = %id, regions = image.regions().len(), "checkpoint created");

        self.checkpoints.push(Checkpoint {
            id: id.clone(),
            op_name: op_name.to_owned(),
            registers,
            breakpoints: process.breakpoints().clone(),
            image,
        });

        Ok(id)
    }

    /// Puts the process back in the state of a checkpoint.
    ///
    /// Later checkpoints are discarded. The message-event breakpoints are
    /// armed again, and a breakpoint sitting at the restored instruction
    /// pointer will not report its first hit.
    #[tracing::instrument(skip_all, fields(id = %id))]
    pub fn restore(
        &mut self,
        process: &mut ProcessContext,
        id: &CheckpointId,
        message_bks: &[MessageBreakpoint],
    ) -> crate::Result<()> {
        let index = self
            .checkpoints
            .iter()
            .position(|cp| &cp.id == id)
            .ok_or_else(|| crate::Error::CheckpointNotFound(id.clone()))?;

        let checkpoint = &self.checkpoints[index];

        checkpoint.image.restore(process)?;
        process.restore_state(&checkpoint.registers, &checkpoint.breakpoints)?;
        process.arm_missing(message_bks)?;
        process.skip_breakpoint_at_current_ip()?;

        let discarded = self.checkpoints.len() - index - 1;
        self.checkpoints.truncate(index + 1);

        tracing::info!(op = %self.checkpoints[index].op_name, discarded, "checkpoint restored");

        Ok(())
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (ip={:#x}, {} regions, {} breakpoints)",
            self.id,
            self.op_name,
            self.registers.instr_addr(),
            self.regions().len(),
            self.breakpoints.len()
        )
    }
}

impl FromStr for CheckpointMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "snapshot" => Ok(Self::Snapshot),
            "fork" => Ok(Self::Fork),
            _ => Err(format!("unknown checkpoint mode `{s}` (expected `snapshot` or `fork`)")),
        }
    }
}

impl fmt::Display for CheckpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Snapshot => "snapshot",
            Self::Fork => "fork",
        })
    }
}
