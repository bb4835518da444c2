use std::ffi::c_void;
use std::fmt;
use std::mem;

use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace::regset::NT_PRSTATUS;
use nix::sys::ptrace::{self, RegisterSet};
use nix::unistd::Pid;

/// General-purpose registers of a stopped thread.
#[derive(Clone, Copy)]
pub struct Registers(libc::user_regs_struct);

pub fn get_thread_registers(pid: Pid) -> crate::sys::Result<Registers> {
    let mut data = mem::MaybeUninit::<libc::user_regs_struct>::uninit();

    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast(),
        iov_len: mem::size_of::<libc::user_regs_struct>(),
    };

    unsafe {
        Errno::result(libc::ptrace(
            ptrace::Request::PTRACE_GETREGSET as u32,
            pid.as_raw(),
            NT_PRSTATUS::VALUE as i32,
            &mut iov as *mut libc::iovec,
        ))
        .inspect_err(|e| tracing::error!(error = %e, "ptrace(PTRACE_GETREGSET)"))
        .map(|_| 0)?
    };

    Ok(Registers(unsafe { data.assume_init() }))
}

pub fn set_thread_registers(pid: Pid, regs: &Registers) -> crate::sys::Result<()> {
    let mut iov = libc::iovec {
        iov_base: &regs.0 as *const libc::user_regs_struct as *mut c_void,
        iov_len: mem::size_of::<libc::user_regs_struct>(),
    };

    unsafe {
        Errno::result(libc::ptrace(
            ptrace::Request::PTRACE_SETREGSET as u32,
            pid.as_raw(),
            NT_PRSTATUS::VALUE as i32,
            &mut iov as *mut libc::iovec,
        ))
        .inspect_err(|e| tracing::error!(error = %e, "ptrace(PTRACE_SETREGSET)"))
        .map(|_| 0)?
    };

    Ok(())
}

impl Registers {
    /// Instruction pointer.
    pub fn instr_addr(&self) -> u64 {
        self.0.rip
    }

    /// Moves the instruction pointer.
    pub fn set_instr_addr(&mut self, addr: u64) {
        self.0.rip = addr;
    }

    /// Stack pointer.
    pub fn stack_pointer(&self) -> u64 {
        self.0.rsp
    }

    /// Frame base pointer.
    pub fn base_pointer(&self) -> u64 {
        self.0.rbp
    }

    fn fields(&self) -> [(&'static str, u64); 27] {
        let r = &self.0;
        [
            ("rip", r.rip),
            ("rsp", r.rsp),
            ("rbp", r.rbp),
            ("rax", r.rax),
            ("rbx", r.rbx),
            ("rcx", r.rcx),
            ("rdx", r.rdx),
            ("rsi", r.rsi),
            ("rdi", r.rdi),
            ("r8", r.r8),
            ("r9", r.r9),
            ("r10", r.r10),
            ("r11", r.r11),
            ("r12", r.r12),
            ("r13", r.r13),
            ("r14", r.r14),
            ("r15", r.r15),
            ("orig_rax", r.orig_rax),
            ("eflags", r.eflags),
            ("cs", r.cs),
            ("ss", r.ss),
            ("ds", r.ds),
            ("es", r.es),
            ("fs", r.fs),
            ("gs", r.gs),
            ("fs_base", r.fs_base),
            ("gs_base", r.gs_base),
        ]
    }
}

impl PartialEq for Registers {
    fn eq(&self, other: &Self) -> bool {
        self.fields()
            .iter()
            .zip(other.fields())
            .all(|((_, a), (_, b))| *a == b)
    }
}

impl Eq for Registers {}

impl fmt::Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Registers");
        for (name, value) in self.fields() {
            s.field(name, &format_args!("{value:#x}"));
        }
        s.finish()
    }
}
