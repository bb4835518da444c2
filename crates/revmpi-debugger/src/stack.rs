use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use revmpi_symbol::{DebugModel, FunctionId};

use crate::process::ProcessContext;

const PTR_SIZE: u64 = std::mem::size_of::<u64>() as u64;

/// Frames larger than this are considered bogus.
const MAX_FRAME_SIZE: u64 = 1024;

/// Frame size assumed when the computed one is bogus.
const FALLBACK_FRAME_SIZE: u64 = 32;

/// Bound on the number of frames of a walk.
const MAX_FRAMES: usize = 256;

/// A frame of the call stack of the traced process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Function executing in this frame.
    pub function: FunctionId,

    /// Name of that function.
    pub name: String,

    /// Runtime instruction address (return address for outer frames).
    pub instr_addr: u64,

    /// Value of the base pointer in this frame.
    pub base_pointer: u64,

    /// Value of the stack pointer in this frame.
    pub stack_pointer: u64,
}

impl StackFrame {
    /// Canonical frame address, used as the frame base of local variables.
    pub fn cfa(&self) -> u64 {
        self.base_pointer.wrapping_add(2 * PTR_SIZE)
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (ip={:#x}, bp={:#x}, sp={:#x})",
            self.name, self.instr_addr, self.base_pointer, self.stack_pointer
        )
    }
}

/// Iterator over the frames of the traced process, innermost first.
///
/// Frames are found by following saved base pointers. The walk ends after
/// the entry function, on the first address outside any known function, or
/// on the first memory read failure (yielded as an error).
pub struct StackWalk<'a> {
    process: &'a ProcessContext,
    model: &'a DebugModel,
    entry_function: &'a str,
    ip: u64,
    bp: u64,
    sp: u64,
    depth: usize,
    done: bool,
}

/// Starts a stack walk at the current registers of the process.
pub fn walk<'a>(
    process: &'a ProcessContext,
    model: &'a DebugModel,
    entry_function: &'a str,
) -> crate::Result<StackWalk<'a>> {
    let regs = process.registers()?;

    Ok(StackWalk {
        process,
        model,
        entry_function,
        ip: regs.instr_addr(),
        bp: regs.base_pointer(),
        sp: regs.stack_pointer(),
        depth: 0,
        done: false,
    })
}

impl StackWalk<'_> {
    fn read_word(&self, addr: u64) -> crate::Result<u64> {
        let data = self.process.peek_memory(addr, PTR_SIZE as usize)?;
        Ok(LittleEndian::read_u64(&data))
    }

    fn step_to_caller(&mut self) -> crate::Result<()> {
        let frame_size = self.bp.wrapping_sub(self.sp).wrapping_add(PTR_SIZE);

        let frame_size = if self.bp < self.sp || frame_size > MAX_FRAME_SIZE {
            tracing::debug!(
                bp = format_args!("{:#x}", self.bp),
                sp = format_args!("{:#x}", self.sp),
                "implausible frame size"
            );
            FALLBACK_FRAME_SIZE
        } else {
            frame_size
        };

        let saved_bp = self.read_word(self.sp + frame_size - PTR_SIZE)?;
        let return_addr = self.read_word(self.sp + frame_size)?;

        self.ip = return_addr;
        self.bp = saved_bp;
        self.sp += frame_size + PTR_SIZE;

        Ok(())
    }
}

impl Iterator for StackWalk<'_> {
    type Item = crate::Result<StackFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let Some(function) = self.model.address_to_function(self.process.to_static(self.ip)) else {
            self.done = true;
            return None;
        };

        let frame = StackFrame {
            function: function.id,
            name: function.name.clone(),
            instr_addr: self.ip,
            base_pointer: self.bp,
            stack_pointer: self.sp,
        };

        self.depth += 1;

        if function.name == self.entry_function || self.depth >= MAX_FRAMES {
            self.done = true;
            return Some(Ok(frame));
        }

        if let Err(e) = self.step_to_caller() {
            self.done = true;
            return Some(Err(e));
        }

        Some(Ok(frame))
    }
}

/// Formats frames as `inner <- outer`.
pub fn format_frames(frames: &[StackFrame]) -> String {
    frames
        .iter()
        .map(|frame| frame.name.as_str())
        .collect::<Vec<_>>()
        .join(" <- ")
}
