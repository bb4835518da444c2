use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use crate::breakpoint::{Breakpoint, BreakpointKind, BreakpointTable, MessageBreakpoint, TRAP_OPCODES};
use crate::sys::{self, MemoryMap, Pid, Registers, ThreadStop};

/// Bound on the resume/wait iterations of a single
/// [continue_execution](ProcessContext::continue_execution).
const MAX_WAIT_ATTEMPTS: usize = 100;

/// Exit code reported for a process killed by the debugger (`SIGKILL`).
const KILLED_EXIT_CODE: i32 = 128 + 9;

/// Execution state of a traced process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Stopped, and why.
    Stopped(StopReason),
    /// Resumed, waiting for the next stop.
    Running,
    /// The process is gone.
    Exited(i32),
}

/// Why a traced process is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Startup trap, nothing executed yet.
    Entry,
    /// Trap raised by a breakpoint or a single-step.
    Trap,
    /// A breakpoint was hit and its instruction put back.
    Breakpoint,
    /// A checkpoint was restored.
    Restored,
}

/// Outcome of [ProcessContext::continue_execution].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopEvent {
    /// The process stopped on a trap.
    Trap,
    /// The process exited with this code.
    Exited(i32),
}

/// A traced process, along with its breakpoints.
///
/// Every method must be called from the thread that called
/// [start](Self::start).
pub struct ProcessContext {
    pid: Pid,
    child: Child,
    target: PathBuf,
    state: ProcessState,
    breakpoints: BreakpointTable,
    load_bias: u64,
}

impl ProcessContext {
    /// Launches `path` under trace.
    ///
    /// The process is stopped on its startup trap when this function
    /// returns. If `is_pie` is set, static addresses are relocated by the
    /// base address of the first mapping of `path`.
    #[tracing::instrument(skip_all, fields(target = %path.as_ref().display()))]
    pub fn start(path: impl AsRef<Path>, args: &[String], is_pie: bool) -> crate::Result<Self> {
        let target = path
            .as_ref()
            .canonicalize()
            .map_err(|e| sys::Error::File(path.as_ref().to_owned(), e))?;

        let (pid, child) = sys::spawn_debuggee(Command::new(&target).args(args))?;

        let mut process = Self {
            pid,
            child,
            target,
            state: ProcessState::Stopped(StopReason::Entry),
            breakpoints: BreakpointTable::default(),
            load_bias: 0,
        };

        if is_pie {
            process.load_bias = process
                .target_mappings()?
                .first()
                .map(|map| map.range.start)
                .unwrap_or_default();
        }

        tracing::info!(
            pid = pid.as_raw(),
            load_bias = format_args!("{:#x}", process.load_bias),
            "process started"
        );

        Ok(process)
    }

    /// Process ID.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub(crate) fn pid(&self) -> Pid {
        self.pid
    }

    /// Canonical path of the traced executable.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Current execution state.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Whether the process is gone.
    pub fn is_exited(&self) -> bool {
        matches!(self.state, ProcessState::Exited(_))
    }

    /// Offset between runtime and static (debug information) addresses.
    pub fn load_bias(&self) -> u64 {
        self.load_bias
    }

    /// Relocates a static address.
    pub fn to_runtime(&self, static_addr: u64) -> u64 {
        static_addr.wrapping_add(self.load_bias)
    }

    /// Inverse of [to_runtime](Self::to_runtime).
    pub fn to_static(&self, runtime_addr: u64) -> u64 {
        runtime_addr.wrapping_sub(self.load_bias)
    }

    /// Armed breakpoints.
    pub fn breakpoints(&self) -> &BreakpointTable {
        &self.breakpoints
    }

    /// Arms a breakpoint at a runtime address.
    ///
    /// Fails with [BreakpointArmed](crate::Error::BreakpointArmed) if one is
    /// already armed there, leaving the table untouched.
    pub fn insert_breakpoint(&mut self, addr: u64, kind: BreakpointKind) -> crate::Result<&Breakpoint> {
        self.ensure_stopped()?;
        self.breakpoints.arm(self.pid, addr, kind, false)
    }

    /// Arms a user breakpoint whose first hit is ignored.
    pub fn insert_breakpoint_skipping_first_hit(&mut self, addr: u64) -> crate::Result<&Breakpoint> {
        self.ensure_stopped()?;
        self.breakpoints.arm(self.pid, addr, BreakpointKind::User, true)
    }

    /// Arms the message-event breakpoints that are not armed yet.
    pub fn arm_missing(&mut self, message_bks: &[MessageBreakpoint]) -> crate::Result<()> {
        self.ensure_stopped()?;

        for bk in message_bks {
            if self.breakpoints.has_message_event(bk.function) || self.breakpoints.get(bk.addr).is_some() {
                continue;
            }

            let kind = BreakpointKind::MessageEvent {
                function: bk.function,
                op_name: bk.op_name.clone(),
            };

            self.breakpoints.arm(self.pid, bk.addr, kind, false)?;
        }

        Ok(())
    }

    /// Clears the breakpoint the process is stopped on, if any.
    ///
    /// When the last trap was raised by a known breakpoint, its instruction
    /// is put back, the instruction pointer is rewound onto it and the
    /// breakpoint is forgotten. `None` means the stop was not caused by a
    /// breakpoint.
    pub fn restore_at_current_stop(&mut self) -> crate::Result<Option<Breakpoint>> {
        if self.state != ProcessState::Stopped(StopReason::Trap) {
            return Ok(None);
        }

        let mut regs = self.registers()?;
        let addr = regs
            .instr_addr()
            .wrapping_sub(TRAP_OPCODES.len() as u64);

        let Some(bk) = self.breakpoints.disarm(self.pid, addr)? else {
            tracing::trace!(ip = format_args!("{:#x}", regs.instr_addr()), "no breakpoint here");
            return Ok(None);
        };

        regs.set_instr_addr(addr);
        self.set_registers(&regs)?;

        self.state = ProcessState::Stopped(StopReason::Breakpoint);

        tracing::debug!(addr = format_args!("{addr:#x}"), kind = ?bk.kind, "caught at breakpoint");

        Ok(Some(bk))
    }

    /// Resumes the process (or steps one instruction) and waits for it to
    /// stop on a trap or exit.
    ///
    /// Other stops (signals, thread creation) are not debugger stops: the
    /// process is resumed again, and the signal is discarded.
    pub fn continue_execution(&mut self, single_step: bool) -> crate::Result<StopEvent> {
        self.ensure_stopped()?;

        let mut last_stop = String::new();

        for _ in 0..MAX_WAIT_ATTEMPTS {
            sys::resume_thread(self.pid, single_step)?;
            self.state = ProcessState::Running;

            match sys::wait_thread(self.pid)? {
                ThreadStop::Exited(code) => {
                    tracing::info!(code, "process exited");
                    self.state = ProcessState::Exited(code);
                    return Ok(StopEvent::Exited(code));
                }
                ThreadStop::Trap => {
                    self.state = ProcessState::Stopped(StopReason::Trap);
                    return Ok(StopEvent::Trap);
                }
                ThreadStop::Clone => {
                    sys::release_cloned_thread(self.pid)?;
                    last_stop = "PTRACE_EVENT_CLONE".to_owned();
                }
                ThreadStop::Other(stop) => {
                    tracing::debug!(stop, "ignoring stop");
                    last_stop = stop;
                }
            }
        }

        Err(crate::Error::WaitExhausted { signal: last_stop })
    }

    /// Resumes the process until it reaches one of `addrs`, and returns the
    /// address reached (`None` if the process exited).
    ///
    /// Temporary breakpoints are armed at `addrs` and disarmed before
    /// returning. Other breakpoints hit on the way are stepped over silently.
    /// A breakpoint already armed at the address reached is armed again, so
    /// that it is hit on the next resume.
    pub(crate) fn run_until(&mut self, addrs: &[u64]) -> crate::Result<Option<u64>> {
        self.ensure_stopped()?;

        let temporary = addrs
            .iter()
            .copied()
            .filter(|addr| self.breakpoints.get(*addr).is_none())
            .collect::<Vec<_>>();

        for &addr in &temporary {
            self.breakpoints.arm(self.pid, addr, BreakpointKind::User, false)?;
        }

        let reached = loop {
            if let StopEvent::Exited(_) = self.continue_execution(false)? {
                return Ok(None);
            }

            let Some(bk) = self.restore_at_current_stop()? else {
                continue;
            };

            if addrs.contains(&bk.addr) {
                if !temporary.contains(&bk.addr) {
                    self.rearm(&bk)?;
                }
                break bk.addr;
            }

            tracing::debug!(addr = format_args!("{:#x}", bk.addr), "breakpoint passed over");

            if let StopEvent::Exited(_) = self.continue_execution(true)? {
                return Ok(None);
            }

            self.rearm(&bk)?;
        };

        for &addr in temporary.iter().filter(|addr| **addr != reached) {
            self.breakpoints.disarm(self.pid, addr)?;
        }

        Ok(Some(reached))
    }

    /// Reads `len` bytes of the process memory.
    pub fn peek_memory(&self, addr: u64, len: usize) -> crate::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        sys::mem::read_process_memory(self.pid, addr, &mut buf)?;
        Ok(buf)
    }

    /// Writes bytes into the process memory.
    pub fn poke_memory(&self, addr: u64, data: &[u8]) -> crate::Result<()> {
        Ok(sys::mem::write_process_memory(self.pid, addr, data)?)
    }

    /// Reads the registers of the stopped process.
    pub fn registers(&self) -> crate::Result<Registers> {
        self.ensure_stopped()?;
        Ok(sys::regs::get_thread_registers(self.pid)?)
    }

    /// Writes the registers of the stopped process.
    pub fn set_registers(&self, regs: &Registers) -> crate::Result<()> {
        self.ensure_stopped()?;
        Ok(sys::regs::set_thread_registers(self.pid, regs)?)
    }

    /// Memory mappings of the process.
    pub fn memory_maps(&self) -> crate::Result<Vec<MemoryMap>> {
        Ok(sys::maps::read_memory_maps(self.pid)?)
    }

    /// Raw content of the memory map listing of the process.
    pub fn memory_maps_text(&self) -> crate::Result<String> {
        Ok(sys::maps::read_maps_text(self.pid)?)
    }

    /// Mappings backed by the traced executable.
    pub fn target_mappings(&self) -> crate::Result<Vec<MemoryMap>> {
        let target = self.target.to_string_lossy();

        Ok(self
            .memory_maps()?
            .into_iter()
            .filter(|map| map.ident.as_deref() == Some(&*target))
            .collect())
    }

    /// Sets registers and breakpoints from a checkpoint, once its memory has
    /// been written back.
    pub(crate) fn restore_state(&mut self, regs: &Registers, breakpoints: &BreakpointTable) -> crate::Result<()> {
        self.set_registers(regs)?;
        self.breakpoints.replace_after_restore(self.pid, breakpoints)?;
        self.state = ProcessState::Stopped(StopReason::Restored);
        Ok(())
    }

    /// Flags the breakpoint at the instruction pointer, if any, so that its
    /// next hit is ignored.
    pub(crate) fn skip_breakpoint_at_current_ip(&mut self) -> crate::Result<()> {
        let ip = self.registers()?.instr_addr();

        if let Some(bk) = self.breakpoints.get_mut(ip) {
            bk.skip_first_hit = true;
            tracing::debug!(addr = format_args!("{ip:#x}"), "first hit will be skipped");
        }

        Ok(())
    }

    /// Re-arms a breakpoint that was cleared by
    /// [restore_at_current_stop](Self::restore_at_current_stop).
    pub(crate) fn rearm(&mut self, bk: &Breakpoint) -> crate::Result<()> {
        self.ensure_stopped()?;
        self.breakpoints.arm(self.pid, bk.addr, bk.kind.clone(), false)?;
        Ok(())
    }

    /// Kills the process.
    pub fn kill(&mut self) {
        if !self.is_exited() {
            sys::kill_debuggee(self.pid);
            self.state = ProcessState::Exited(KILLED_EXIT_CODE);
        }
    }

    fn ensure_stopped(&self) -> crate::Result<()> {
        match self.state {
            ProcessState::Stopped(_) => Ok(()),
            ProcessState::Running => Err(crate::Error::NotStopped),
            ProcessState::Exited(code) => Err(crate::Error::ProcessExited(code)),
        }
    }
}

impl Drop for ProcessContext {
    fn drop(&mut self) {
        self.kill();
    }
}
