use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::libc::{iovec, process_vm_readv};
use nix::sys::ptrace;
use nix::unistd::Pid;

/// Reads memory from the process with the given ID.
pub fn read_process_memory(pid: Pid, addr: u64, buf: &mut [u8]) -> crate::sys::Result<()> {
    let local_iov = iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };

    let remote_iov = iovec {
        iov_base: addr as *mut _,
        iov_len: buf.len(),
    };

    let len = unsafe {
        Errno::result(process_vm_readv(
            pid.as_raw(),
            &local_iov as *const _,
            1,
            &remote_iov as *const _,
            1,
            0,
        ))
        .inspect_err(
            |e| tracing::error!(error = %e, addr = format_args!("{addr:#x}"), "process_vm_readv"),
        )
        .map(|len| len as usize)?
    };

    if len != buf.len() {
        Err(crate::sys::Error::PartialMemOp(len, buf.len()))
    } else {
        Ok(())
    }
}

/// Writes memory into the process with the given ID.
///
/// Writes go through `PTRACE_POKEDATA`, so read-only pages (code) can be
/// patched as well.
pub fn write_process_memory(pid: Pid, addr: u64, buf: &[u8]) -> crate::sys::Result<()> {
    let mut data_to_write = buf.chunks_exact(std::mem::size_of::<u64>());

    let mut write_addr = addr;

    for chunk in &mut data_to_write {
        let Ok(data) = chunk.try_into().map(i64::from_le_bytes) else {
            unreachable!("chunk should be 8 bytes long");
        };

        ptrace::write(pid, write_addr as *mut _, data)
            .inspect_err(|e| tracing::error!(error = %e, addr = format_args!("{write_addr:#x}"), "ptrace(PTRACE_POKE_DATA)"))?;

        write_addr += chunk.len() as u64;
    }

    let remainder = data_to_write.remainder();

    if !remainder.is_empty() {
        let mut old_data = ptrace::read(pid, write_addr as *mut _)
            .inspect_err(|e| tracing::error!(error = %e, addr = format_args!("{write_addr:#x}"), "ptrace(PTRACE_PEEK_DATA)"))?
            .to_le_bytes();

        for (old, new) in old_data.iter_mut().zip(remainder) {
            *old = *new;
        }

        let new_data = i64::from_le_bytes(old_data);

        ptrace::write(pid, write_addr as *mut _, new_data)
            .inspect_err(|e| tracing::error!(error = %e, addr = format_args!("{write_addr:#x}"), "ptrace(PTRACE_POKE_DATA)"))?;
    }

    Ok(())
}

/// Reads a whole memory range through `/proc/<pid>/mem`.
///
/// Unlike [read_process_memory], this works on any mapping of a traced
/// process regardless of its protection.
pub fn read_mem_file(pid: Pid, addr: u64, len: usize) -> crate::sys::Result<Vec<u8>> {
    let path = mem_file_path(pid);

    let file = OpenOptions::new()
        .read(true)
        .open(&path)
        .map_err(|e| crate::sys::Error::File(path.clone(), e))?;

    let mut data = vec![0u8; len];

    file.read_exact_at(&mut data, addr)
        .inspect_err(|e| tracing::error!(error = %e, addr = format_args!("{addr:#x}"), len, "read /proc/pid/mem"))
        .map_err(|e| crate::sys::Error::File(path, e))?;

    Ok(data)
}

/// Writes a whole memory range through `/proc/<pid>/mem`.
pub fn write_mem_file(pid: Pid, addr: u64, data: &[u8]) -> crate::sys::Result<()> {
    let path = mem_file_path(pid);

    let file = OpenOptions::new()
        .write(true)
        .open(&path)
        .map_err(|e| crate::sys::Error::File(path.clone(), e))?;

    file.write_all_at(data, addr)
        .inspect_err(|e| tracing::error!(error = %e, addr = format_args!("{addr:#x}"), len = data.len(), "write /proc/pid/mem"))
        .map_err(|e| crate::sys::Error::File(path, e))?;

    Ok(())
}

fn mem_file_path(pid: Pid) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/mem"))
}
