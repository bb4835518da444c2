use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;

use revmpi_symbol::FunctionId;

use crate::sys;

/// `int3`
pub const TRAP_OPCODES: [u8; 1] = [0xcc];

/// Why a breakpoint was armed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointKind {
    /// Requested by the user.
    User,

    /// Armed automatically at the entry of a wrapped message function.
    MessageEvent {
        /// The wrapper function.
        function: FunctionId,
        /// Name of the wrapped operation.
        op_name: String,
    },
}

/// A trap opcode written into the traced process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    /// Runtime address of the trap.
    pub addr: u64,

    /// Why the breakpoint was armed.
    pub kind: BreakpointKind,

    /// Whether the next hit must be ignored.
    ///
    /// Set on breakpoints armed exactly at the instruction pointer of a
    /// restored checkpoint, and on user breakpoints requested as such.
    pub skip_first_hit: bool,

    orig_opcodes: [u8; TRAP_OPCODES.len()],
}

/// Where the message-event breakpoint of a wrapped function goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBreakpoint {
    /// Runtime address.
    pub addr: u64,
    /// The wrapper function.
    pub function: FunctionId,
    /// Name of the wrapped operation.
    pub op_name: String,
}

/// Breakpoints armed in a traced process, at most one per address.
///
/// Cloning the table does not touch the process: a clone is a record of
/// which traps were armed, as kept by checkpoints.
#[derive(Debug, Clone, Default)]
pub struct BreakpointTable {
    bks: HashMap<u64, Breakpoint>,
}

impl Breakpoint {
    /// Whether the breakpoint was armed for a message event.
    pub fn is_message_event(&self) -> bool {
        matches!(self.kind, BreakpointKind::MessageEvent { .. })
    }

    /// Instruction bytes replaced by the trap.
    pub fn orig_opcodes(&self) -> &[u8] {
        &self.orig_opcodes
    }
}

impl BreakpointTable {
    /// Breakpoint armed at `addr`.
    pub fn get(&self, addr: u64) -> Option<&Breakpoint> {
        self.bks.get(&addr)
    }

    /// Number of armed breakpoints.
    pub fn len(&self) -> usize {
        self.bks.len()
    }

    /// Whether no breakpoint is armed.
    pub fn is_empty(&self) -> bool {
        self.bks.is_empty()
    }

    /// Breakpoints sorted by address.
    pub fn sorted(&self) -> Vec<&Breakpoint> {
        let mut bks = self.bks.values().collect::<Vec<_>>();
        bks.sort_unstable_by_key(|bk| bk.addr);
        bks
    }

    /// Whether the message-event breakpoint of `function` is armed.
    pub fn has_message_event(&self, function: FunctionId) -> bool {
        self.bks.values().any(
            |bk| matches!(bk.kind, BreakpointKind::MessageEvent { function: f, .. } if f == function),
        )
    }

    pub(crate) fn arm(
        &mut self,
        pid: sys::Pid,
        addr: u64,
        kind: BreakpointKind,
        skip_first_hit: bool,
    ) -> crate::Result<&Breakpoint> {
        let Entry::Vacant(v) = self.bks.entry(addr) else {
            return Err(crate::Error::BreakpointArmed(addr));
        };

        let mut orig_opcodes = [0u8; TRAP_OPCODES.len()];

        sys::mem::read_process_memory(pid, addr, &mut orig_opcodes)?;
        sys::mem::write_process_memory(pid, addr, &TRAP_OPCODES)?;

        tracing::debug!(addr = format_args!("{addr:#x}"), ?kind, skip_first_hit, "breakpoint armed");

        Ok(v.insert(Breakpoint {
            addr,
            kind,
            skip_first_hit,
            orig_opcodes,
        }))
    }

    /// Puts the original instruction back and forgets the breakpoint.
    pub(crate) fn disarm(&mut self, pid: sys::Pid, addr: u64) -> crate::Result<Option<Breakpoint>> {
        let Some(bk) = self.bks.remove(&addr) else {
            return Ok(None);
        };

        sys::mem::write_process_memory(pid, addr, &bk.orig_opcodes)?;

        tracing::debug!(addr = format_args!("{addr:#x}"), "breakpoint disarmed");

        Ok(Some(bk))
    }

    pub(crate) fn get_mut(&mut self, addr: u64) -> Option<&mut Breakpoint> {
        self.bks.get_mut(&addr)
    }

    /// Replaces the table with `captured`, once process memory has been
    /// rewritten from a checkpoint.
    ///
    /// Memory now holds whatever bytes were captured, so every address of
    /// both tables is checked: traps absent from `captured` are removed, and
    /// traps of `captured` missing from memory are written again.
    pub(crate) fn replace_after_restore(
        &mut self,
        pid: sys::Pid,
        captured: &BreakpointTable,
    ) -> crate::Result<()> {
        for (addr, bk) in &self.bks {
            if captured.bks.contains_key(addr) {
                continue;
            }

            if read_opcodes(pid, *addr)? == TRAP_OPCODES {
                sys::mem::write_process_memory(pid, *addr, &bk.orig_opcodes)?;
                tracing::debug!(addr = format_args!("{addr:#x}"), "stale trap removed");
            }
        }

        for (addr, bk) in &captured.bks {
            if read_opcodes(pid, *addr)? != TRAP_OPCODES {
                sys::mem::write_process_memory(pid, *addr, &TRAP_OPCODES)?;
                tracing::debug!(addr = format_args!("{addr:#x}"), kind = ?bk.kind, "trap re-armed");
            }
        }

        self.bks = captured.bks.clone();

        Ok(())
    }
}

fn read_opcodes(pid: sys::Pid, addr: u64) -> crate::Result<[u8; TRAP_OPCODES.len()]> {
    let mut opcodes = [0u8; TRAP_OPCODES.len()];
    sys::mem::read_process_memory(pid, addr, &mut opcodes)?;
    Ok(opcodes)
}

impl fmt::Display for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr)?;

        if let BreakpointKind::MessageEvent { op_name, .. } = &self.kind {
            write!(f, " ({op_name})")?;
        }

        if self.skip_first_hit {
            f.write_str(" [skip first hit]")?;
        }

        Ok(())
    }
}
