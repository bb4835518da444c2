use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use revmpi_proto::ops::{self, CHECKPOINT_CHILD_VARIABLE};
use revmpi_symbol::{DebugModel, RECORD_HELPER};

use super::snapshot::SnapshotStore;
use super::store::{
    CaptureContext, CheckpointStore, HEAP_IDENT, MemoryImage, MemoryRegion, STACK_IDENT, regions_by_ident,
    select_regions,
};
use crate::process::ProcessContext;
use crate::sys::{self, Pid};
use crate::variable;

/// Relies on the paused process image forked by the message wrapper at each
/// operation.
///
/// Only the stack is copied at capture time. The heap and the writable
/// mappings of the executable are read back from the forked image on
/// restore. Operations for which the wrapper did not fork a fresh image are
/// captured as snapshots.
pub struct ForkStore {
    fallback: SnapshotStore,
    last_child: Option<Pid>,
}

#[derive(Debug)]
struct ForkImage {
    child: Pid,
    child_var_addr: u64,
    stack: Vec<(MemoryRegion, Vec<u8>)>,
    regions: Vec<MemoryRegion>,
}

impl ForkStore {
    /// Creates the store, if the wrapper of `model` retains forked images.
    ///
    /// Snapshots spooled into `spool_dir` are used for the operations which
    /// do not fork.
    pub fn new(model: &DebugModel, spool_dir: &Path, target: &Path) -> crate::Result<Self> {
        if model.lookup_global_variable(CHECKPOINT_CHILD_VARIABLE).is_none() {
            return Err(crate::Error::StoreUnavailable(format!(
                "{CHECKPOINT_CHILD_VARIABLE} is not defined by the target"
            )));
        }

        Ok(Self {
            fallback: SnapshotStore::new(spool_dir, target),
            last_child: None,
        })
    }

    /// Returns the image forked since the last capture, if it is alive.
    fn fresh_child(&self, cx: &CaptureContext<'_>) -> crate::Result<Option<(Pid, u64)>> {
        let var = match variable::read_global(cx.process, cx.model, CHECKPOINT_CHILD_VARIABLE) {
            Ok(var) => var,
            Err(e) if !e.is_fatal() => {
                tracing::debug!(error = %e, "forked image unknown");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let child = var
            .value
            .as_i64()
            .and_then(|pid| i32::try_from(pid).ok())
            .filter(|pid| *pid > 0)
            .map(Pid::from_raw);

        Ok(child
            .filter(|child| Some(*child) != self.last_child && sys::process_exists(*child))
            .map(|child| (child, var.addr)))
    }
}

impl CheckpointStore for ForkStore {
    fn name(&self) -> &'static str {
        "fork"
    }

    /// Lets the wrapper fork, by running the message function until the
    /// record helper returns (or the message function itself returns, if it
    /// does not call the helper).
    fn prepare(&mut self, process: &mut ProcessContext, model: &DebugModel, op_name: &str) -> crate::Result<()> {
        if !ops::is_restorable(op_name) {
            return Ok(());
        }

        let Some(helper) = model.lookup_function(RECORD_HELPER) else {
            return Ok(());
        };

        let helper_entry = process.to_runtime(helper.range.start);
        let caller_return = read_u64(process, process.registers()?.base_pointer() + 8)?;

        match process.run_until(&[helper_entry, caller_return])? {
            Some(addr) if addr == helper_entry => {
                let helper_return = read_u64(process, process.registers()?.stack_pointer())?;

                if process.run_until(&[helper_return])?.is_some() {
                    tracing::debug!("wrapper forked");
                }
            }
            Some(_) => tracing::debug!("message function returned without forking"),
            None => (),
        }

        Ok(())
    }

    fn capture(&mut self, cx: &CaptureContext<'_>) -> crate::Result<Box<dyn MemoryImage>> {
        let Some((child, child_var_addr)) = self.fresh_child(cx)? else {
            tracing::debug!("no fresh forked image, taking a snapshot");
            return self.fallback.capture(cx);
        };

        let stack = regions_by_ident(cx.process, &[STACK_IDENT])?
            .into_iter()
            .map(|region| {
                let data = sys::mem::read_mem_file(cx.process.pid(), region.range.start, region.len())?;
                Ok((region, data))
            })
            .collect::<crate::Result<Vec<_>>>()?;

        let regions = stack.iter().map(|(region, _)| region.clone()).collect();

        self.last_child = Some(child);

        tracing::debug!(child = child.as_raw(), "forked image retained");

        Ok(Box::new(ForkImage {
            child,
            child_var_addr,
            stack,
            regions,
        }))
    }
}

impl MemoryImage for ForkImage {
    fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    fn restore(&self, process: &ProcessContext) -> crate::Result<()> {
        let target = process.target().to_string_lossy();

        let unavailable =
            |e: sys::Error| crate::Error::StoreUnavailable(format!("forked image {}: {e}", self.child));

        // the image is read in full before the process is touched
        let maps = sys::maps::read_memory_maps(self.child).map_err(unavailable)?;
        let image = select_regions(maps, &[HEAP_IDENT, &*target], true)
            .into_iter()
            .map(|region| {
                let data = sys::mem::read_mem_file(self.child, region.range.start, region.len()).map_err(unavailable)?;
                Ok((region, data))
            })
            .collect::<crate::Result<Vec<_>>>()?;

        for (region, data) in image.iter().chain(&self.stack) {
            sys::mem::write_mem_file(process.pid(), region.range.start, data)?;

            tracing::trace!(region = %region, child = self.child.as_raw(), "region restored");
        }

        // the forked image saw its own fork return 0
        let mut child_pid = [0u8; 4];
        LittleEndian::write_i32(&mut child_pid, self.child.as_raw());
        sys::mem::write_mem_file(process.pid(), self.child_var_addr, &child_pid)?;

        Ok(())
    }
}

impl Drop for ForkImage {
    fn drop(&mut self) {
        sys::kill_untraced(self.child);
    }
}

fn read_u64(process: &ProcessContext, addr: u64) -> crate::Result<u64> {
    Ok(LittleEndian::read_u64(&process.peek_memory(addr, 8)?))
}
