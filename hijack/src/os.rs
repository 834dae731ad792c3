/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The raw process primitives the interceptor is built on.
//!
//! Everything that creates, replaces or ends a process goes through [`Os`] so
//! the wrapper logic can be driven without actually forking or exec'ing.

use std::ffi::CStr;
use std::io::Read;
use std::os::unix::io::RawFd;

use libc::c_char;
use libc::c_int;
use libc::pid_t;
use nix::fcntl;
use nix::fcntl::FcntlArg;
use nix::fcntl::FdFlag;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd;
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use syscalls::Errno;

/// Maximum number of bytes captured from a short-lived process.
pub const CAPTURE_LIMIT: usize = 100_000;

pub trait Os: Send + Sync {
    /// Calls the real `fork`. Returns `0` in the child.
    fn fork(&self) -> Result<pid_t, Errno>;

    /// Calls the real `execvpe`. Only returns on failure.
    ///
    /// # Safety
    ///
    /// `argv` and `envp` must be NULL-terminated arrays of valid C strings.
    unsafe fn execvpe(
        &self,
        file: &CStr,
        argv: *const *const c_char,
        envp: *const *const c_char,
    ) -> Errno;

    /// Terminates the process without running `atexit` handlers.
    fn exit(&self, code: i32) -> !;

    fn close(&self, fd: RawFd) -> Result<(), Errno>;

    fn dup2(&self, oldfd: RawFd, newfd: RawFd) -> Result<RawFd, Errno>;

    fn open(&self, path: &CStr, flags: c_int) -> Result<RawFd, Errno>;

    /// Clears `FD_CLOEXEC` on `fd`. Closed descriptors are skipped.
    fn clear_cloexec(&self, fd: RawFd);

    fn getpid(&self) -> pid_t;

    fn setsid(&self) -> Result<pid_t, Errno>;

    fn chdir(&self, path: &CStr) -> Result<(), Errno>;

    /// Waits for `pid` to change state and returns the raw wait status.
    fn waitpid(&self, pid: pid_t) -> Result<c_int, Errno>;

    /// Runs `command` through the shell and returns at most [`CAPTURE_LIMIT`]
    /// bytes of its standard output.
    fn run_captured(&self, command: &CStr) -> Result<Vec<u8>, Errno>;

    fn write_stdout(&self, bytes: &[u8]) -> Result<(), Errno>;

    /// Seconds since the epoch.
    fn now(&self) -> u64;

    fn host_id(&self) -> u64;

    /// Short name of the running program.
    fn program_name(&self) -> String;
}

type ForkFn = unsafe extern "C" fn() -> pid_t;
type ExecvpeFn = unsafe extern "C" fn(
    *const c_char,
    *const *const c_char,
    *const *const c_char,
) -> c_int;

/// The next definitions of the functions we export ourselves. Anything we do
/// not override is called through `libc` directly.
struct Next {
    fork: ForkFn,
    execvpe: ExecvpeFn,
}

unsafe fn resolve_next(symbol: &CStr) -> Option<*mut libc::c_void> {
    let p = unsafe { libc::dlsym(libc::RTLD_NEXT, symbol.as_ptr()) };
    if p.is_null() { None } else { Some(p) }
}

static NEXT: Lazy<Next> = Lazy::new(|| unsafe {
    Next {
        fork: resolve_next(c"fork")
            .map_or(libc::fork as ForkFn, |p| core::mem::transmute(p)),
        execvpe: resolve_next(c"execvpe")
            .map_or(libc::execvpe as ExecvpeFn, |p| core::mem::transmute(p)),
    }
});

fn from_nix(err: nix::errno::Errno) -> Errno {
    Errno::new(err as i32)
}

/// The real operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealOs;

impl Os for RealOs {
    fn fork(&self) -> Result<pid_t, Errno> {
        Errno::result(unsafe { (NEXT.fork)() })
    }

    unsafe fn execvpe(
        &self,
        file: &CStr,
        argv: *const *const c_char,
        envp: *const *const c_char,
    ) -> Errno {
        unsafe { (NEXT.execvpe)(file.as_ptr(), argv, envp) };
        Errno::last()
    }

    fn exit(&self, code: i32) -> ! {
        unsafe { libc::_exit(code) }
    }

    fn close(&self, fd: RawFd) -> Result<(), Errno> {
        unistd::close(fd).map_err(from_nix)
    }

    fn dup2(&self, oldfd: RawFd, newfd: RawFd) -> Result<RawFd, Errno> {
        unistd::dup2(oldfd, newfd).map_err(from_nix)
    }

    fn open(&self, path: &CStr, flags: c_int) -> Result<RawFd, Errno> {
        fcntl::open(path, OFlag::from_bits_truncate(flags), Mode::empty()).map_err(from_nix)
    }

    fn clear_cloexec(&self, fd: RawFd) {
        let Ok(flags) = fcntl::fcntl(fd, FcntlArg::F_GETFD) else {
            return;
        };
        let mut flags = FdFlag::from_bits_truncate(flags);
        if flags.contains(FdFlag::FD_CLOEXEC) {
            flags.remove(FdFlag::FD_CLOEXEC);
            let _ = fcntl::fcntl(fd, FcntlArg::F_SETFD(flags));
        }
    }

    fn getpid(&self) -> pid_t {
        unistd::getpid().as_raw()
    }

    fn setsid(&self) -> Result<pid_t, Errno> {
        unistd::setsid().map(Pid::as_raw).map_err(from_nix)
    }

    fn chdir(&self, path: &CStr) -> Result<(), Errno> {
        unistd::chdir(path).map_err(from_nix)
    }

    // `nix::sys::wait::waitpid` decodes the status, while `system` has to
    // return it raw.
    fn waitpid(&self, pid: pid_t) -> Result<c_int, Errno> {
        let mut status = 0;
        loop {
            match Errno::result(unsafe { libc::waitpid(pid, &mut status, 0) }) {
                Ok(_) => return Ok(status),
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn run_captured(&self, command: &CStr) -> Result<Vec<u8>, Errno> {
        let stream = unsafe { libc::popen(command.as_ptr(), c"r".as_ptr()) };
        if stream.is_null() {
            return Err(Errno::last());
        }

        let mut output = Vec::new();
        let mut reader = PipeReader(stream).take(CAPTURE_LIMIT as u64);
        let res = reader.read_to_end(&mut output);
        unsafe { libc::pclose(stream) };

        res.map_err(|err| err.raw_os_error().map_or(Errno::EIO, Errno::new))?;
        Ok(output)
    }

    fn write_stdout(&self, mut bytes: &[u8]) -> Result<(), Errno> {
        while !bytes.is_empty() {
            let n = unsafe {
                libc::write(
                    libc::STDOUT_FILENO,
                    bytes.as_ptr() as *const libc::c_void,
                    bytes.len(),
                )
            };
            match Errno::result(n) {
                Ok(n) => bytes = &bytes[n as usize..],
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn now(&self) -> u64 {
        unsafe { libc::time(core::ptr::null_mut()) as u64 }
    }

    fn host_id(&self) -> u64 {
        unsafe { libc::gethostid() as u64 }
    }

    fn program_name(&self) -> String {
        std::env::args_os()
            .next()
            .and_then(|arg0| {
                std::path::Path::new(&arg0)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| String::from("unknown"))
    }
}

/// Reads from a `popen` stream. The stream is closed by the owner.
struct PipeReader(*mut libc::FILE);

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = unsafe { libc::fread(buf.as_mut_ptr() as *mut libc::c_void, 1, buf.len(), self.0) };
        if n == 0 && unsafe { libc::ferror(self.0) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(n)
    }
}
