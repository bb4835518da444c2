mod error;
pub mod maps;
pub mod mem;
pub mod regs;

use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};

use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};

pub use nix::unistd::Pid;

pub use self::error::{Error, Result};
pub use self::maps::MemoryMap;
pub use self::regs::Registers;

/// Spawns a new child process.
///
/// # Note
///
/// The process is spawned in debug-mode, and is stopped on its startup trap
/// when this function returns. It must be called from the thread that will
/// issue every subsequent tracing request.
pub fn spawn_debuggee(command: &mut Command) -> crate::sys::Result<(Pid, Child)> {
    // On Linux, if a `pre_exec` closure is specified, `rust-std` will
    // spawn the process with `fork`+`exec`, otherwise `posix_spawn` is used.
    unsafe {
        command.pre_exec(|| ptrace::traceme().map_err(|e| io::Error::from_raw_os_error(e as i32)))
    };

    let child = command.spawn().map_err(crate::sys::Error::ChildExec)?;

    let pid = Pid::from_raw(child.id() as i32);

    wait_for_thread_ready(pid)?;

    Ok((pid, child))
}

fn wait_for_thread_ready(pid: Pid) -> crate::sys::Result<()> {
    let status = waitpid(pid, None)?;

    if !matches!(status, WaitStatus::Stopped(_, Signal::SIGTRAP)) {
        return Err(crate::sys::Error::BadChildWait(status));
    }

    ptrace::setoptions(pid, ptrace::Options::PTRACE_O_TRACECLONE)?;

    Ok(())
}

/// Resumes a stopped thread, without delivering any signal.
pub fn resume_thread(pid: Pid, single_step: bool) -> crate::sys::Result<()> {
    if single_step {
        ptrace::step(pid, None)?;
    } else {
        ptrace::cont(pid, None)?;
    }

    Ok(())
}

/// Classified state change of a traced thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadStop {
    /// The process is gone, with this exit code (`128 + signal` if killed).
    Exited(i32),
    /// Stopped by `SIGTRAP` (breakpoint or single-step).
    Trap,
    /// Stopped because the process created a thread.
    Clone,
    /// Stopped by any other signal or event.
    Other(String),
}

/// Blocks until the thread changes state.
pub fn wait_thread(pid: Pid) -> crate::sys::Result<ThreadStop> {
    let status = waitpid(pid, None)?;

    let stop = match status {
        WaitStatus::Exited(_, code) => ThreadStop::Exited(code),
        WaitStatus::Signaled(_, signal, _) => ThreadStop::Exited(128 + signal as i32),
        WaitStatus::Stopped(_, Signal::SIGTRAP) => ThreadStop::Trap,
        WaitStatus::PtraceEvent(_, _, event) if event == ptrace::Event::PTRACE_EVENT_CLONE as i32 => {
            ThreadStop::Clone
        }
        WaitStatus::Stopped(_, signal) => ThreadStop::Other(signal.to_string()),
        status => ThreadStop::Other(format!("{status:?}")),
    };

    Ok(stop)
}

/// Lets a thread created by the traced process (reported by a
/// `PTRACE_EVENT_CLONE` stop) run untraced.
pub fn release_cloned_thread(pid: Pid) -> crate::sys::Result<()> {
    let tid = Pid::from_raw(ptrace::getevent(pid)? as i32);

    waitpid(tid, Some(WaitPidFlag::__WALL))?;
    ptrace::detach(tid, None)?;

    tracing::debug!(tid = tid.as_raw(), "released cloned thread");

    Ok(())
}

/// Kills a traced process and reaps it.
pub fn kill_debuggee(pid: Pid) {
    match signal::kill(pid, Signal::SIGKILL) {
        Ok(()) => {
            while let Ok(status) = waitpid(pid, None) {
                if matches!(status, WaitStatus::Exited(..) | WaitStatus::Signaled(..)) {
                    break;
                }
            }
            tracing::debug!(pid = pid.as_raw(), "process killed");
        }
        Err(nix::errno::Errno::ESRCH) => (),
        Err(e) => tracing::error!(error = %e, pid = pid.as_raw(), "kill"),
    }
}

/// Whether a process with this ID exists.
pub fn process_exists(pid: Pid) -> bool {
    signal::kill(pid, None).is_ok()
}

/// Kills a process which is not traced by this debugger.
///
/// It is reaped by its own parent.
pub fn kill_untraced(pid: Pid) {
    match signal::kill(pid, Signal::SIGKILL) {
        Ok(()) => tracing::debug!(pid = pid.as_raw(), "untraced process killed"),
        Err(nix::errno::Errno::ESRCH) => (),
        Err(e) => tracing::warn!(error = %e, pid = pid.as_raw(), "kill"),
    }
}
