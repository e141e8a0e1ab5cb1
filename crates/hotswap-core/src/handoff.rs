//! Process handoff: pipe + fork + exec relay of the state snapshot.
//!
//! A swap duplicates the process. The relay child closes the read end of a
//! fresh pipe, writes the serialized snapshot to the write end and exits; the
//! parent closes the write end and execs the replacement binary in place,
//! passing the read fd and the relay's pid on argv. The replacement reads the
//! snapshot to end-of-stream, reaps the relay so no zombie survives, and
//! carries on as the next generation. The pid of the serving process is
//! stable across generations because the exec happens in place.
//!
//! The core restricts itself to a single thread for the duration of any
//! swap-eligible run, which keeps the fork well-defined.

use std::convert::Infallible;
use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::Path;

use thiserror::Error;

use crate::snapshot::StateSnapshot;

/// Sentinel flag marking a resumption invocation.
pub const RESUME_FLAG: &str = "--hotswapping";

/// Errors that can occur while attempting a handoff.
#[derive(Error, Debug)]
pub enum HandoffError {
    #[error("failed to serialize state snapshot: {0}")]
    Serialize(String),

    #[error("failed to create handoff pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error("failed to fork relay process: {0}")]
    Fork(#[source] io::Error),

    #[error("failed to exec {path}: {source}")]
    Exec { path: String, source: io::Error },

    #[error("executable path contains an interior null byte")]
    BadPath,
}

/// Inspect argv for the re-entry contract and resume from it if present.
///
/// A resumption invocation is exactly
/// `[exe, "--hotswapping", <read-fd>, <predecessor-pid>]`; any other argv is
/// an ordinary first run and yields `None`. The strict count keeps first-run
/// invocations from ever being misparsed as resumptions.
///
/// On a match the predecessor is always reaped, and a payload that cannot be
/// read or decoded resumes into the `Error` state instead of aborting - the
/// runtime turns that into a normal nonzero exit. `generation` is incremented
/// on whatever snapshot is returned.
pub fn resume_if_applicable(args: &[String]) -> Option<StateSnapshot> {
    if args.len() != 4 || args[1] != RESUME_FLAG {
        return None;
    }
    log::info!("coming up from swap");

    let parsed = args[2]
        .parse::<RawFd>()
        .ok()
        .zip(args[3].parse::<libc::pid_t>().ok());
    let mut snapshot = match parsed {
        Some((fd, pid)) => {
            let payload = read_pipe_to_end(fd);
            reap_predecessor(pid);
            let decoded = payload.and_then(|bytes| {
                bincode::deserialize(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            });
            match decoded {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    log::error!("unable to read state from previous generation: {}", e);
                    StateSnapshot::recovery_error()
                }
            }
        }
        None => {
            log::error!("malformed resumption arguments: {:?}", &args[2..]);
            StateSnapshot::recovery_error()
        }
    };
    snapshot.generation += 1;
    Some(snapshot)
}

/// Hand the snapshot to a fresh invocation of `executable`.
///
/// On success this never returns: the calling image is replaced via exec.
/// The snapshot is serialized before forking, so the relay child only moves
/// bytes. If the exec fails the relay is reaped and the error is returned;
/// the caller still owns an authoritative snapshot and may keep running as
/// the current generation.
pub fn handoff(executable: &Path, snapshot: &StateSnapshot) -> Result<Infallible, HandoffError> {
    let payload =
        bincode::serialize(snapshot).map_err(|e| HandoffError::Serialize(e.to_string()))?;
    let exe = CString::new(executable.as_os_str().as_bytes()).map_err(|_| HandoffError::BadPath)?;

    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(HandoffError::Pipe(io::Error::last_os_error()));
    }
    let (reader, writer) = (fds[0], fds[1]);

    log::info!("going down for swap");
    match unsafe { libc::fork() } {
        -1 => {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(reader);
                libc::close(writer);
            }
            Err(HandoffError::Fork(err))
        }
        0 => {
            // Relay child: push the snapshot through the pipe and vanish.
            // Post-fork, so no logger and no destructors; _exit only.
            unsafe {
                libc::close(reader);
                write_all_raw(writer, &payload);
                libc::close(writer);
                libc::_exit(0)
            }
        }
        relay_pid => {
            // Continuing side. Close the unused write end first: the
            // replacement must see end-of-stream once the relay finishes.
            unsafe { libc::close(writer) };
            exec_replacement(executable, &exe, reader, relay_pid)
        }
    }
}

fn exec_replacement(
    path: &Path,
    exe: &CString,
    reader: RawFd,
    relay_pid: libc::pid_t,
) -> Result<Infallible, HandoffError> {
    // The flag and the two formatted integers are the entire re-entry
    // contract; plain pipe fds are inherited across exec.
    let err = match resume_argv(reader, relay_pid) {
        Ok((flag, fd_arg, pid_arg)) => {
            let argv = [
                exe.as_ptr(),
                flag.as_ptr(),
                fd_arg.as_ptr(),
                pid_arg.as_ptr(),
                std::ptr::null(),
            ];
            unsafe { libc::execv(exe.as_ptr(), argv.as_ptr()) };

            // Exec only returns on failure.
            HandoffError::Exec {
                path: path.display().to_string(),
                source: io::Error::last_os_error(),
            }
        }
        Err(e) => e,
    };

    // Reap the relay before reporting so it cannot outlive this attempt as
    // a zombie.
    unsafe { libc::close(reader) };
    let mut status: libc::c_int = 0;
    unsafe { libc::waitpid(relay_pid, &mut status, 0) };
    Err(err)
}

fn resume_argv(
    reader: RawFd,
    relay_pid: libc::pid_t,
) -> Result<(CString, CString, CString), HandoffError> {
    let flag = CString::new(RESUME_FLAG).map_err(|_| HandoffError::BadPath)?;
    let fd_arg = CString::new(reader.to_string()).map_err(|_| HandoffError::BadPath)?;
    let pid_arg = CString::new(relay_pid.to_string()).map_err(|_| HandoffError::BadPath)?;
    Ok((flag, fd_arg, pid_arg))
}

fn read_pipe_to_end(fd: RawFd) -> io::Result<Vec<u8>> {
    // Taking ownership closes the fd when the File drops.
    let mut pipe = unsafe { File::from_raw_fd(fd) };
    let mut bytes = Vec::new();
    pipe.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Wait for the predecessor to fully exit. Best effort: a predecessor we
/// cannot wait on is logged, not fatal.
fn reap_predecessor(pid: libc::pid_t) {
    let mut status: libc::c_int = 0;
    let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
    if ret < 0 {
        log::warn!(
            "could not reap predecessor {}: {}",
            pid,
            io::Error::last_os_error()
        );
    } else {
        log::debug!("reaped predecessor {} (status {})", pid, status);
    }
}

/// Write the full payload to the relay pipe. Runs post-fork: on any
/// unrecoverable error the relay exits directly.
unsafe fn write_all_raw(fd: libc::c_int, bytes: &[u8]) {
    let mut remaining = bytes;
    while !remaining.is_empty() {
        let n = libc::write(
            fd,
            remaining.as_ptr() as *const libc::c_void,
            remaining.len(),
        );
        if n > 0 {
            remaining = &remaining[n as usize..];
        } else if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            continue;
        } else {
            libc::_exit(1);
        }
    }
}
