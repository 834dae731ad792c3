/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The libc functions overridden by the preloaded library.
//!
//! Each one forwards to the process-wide [`Interceptor`] and reports failure
//! the way libc does, with `-1` and `errno`. The symbols are not exported in
//! test builds so the test harness keeps the real ones.

use std::ffi::CStr;

use lazy_static::lazy_static;
use libc::c_char;
use libc::c_int;
use libc::pid_t;
use syscalls::Errno;

use crate::config::Config;
use crate::env::ProcessEnv;
use crate::env::SystemEnv;
use crate::error::Error;
use crate::error::set_errno;
use crate::interceptor::Interceptor;
use crate::os::RealOs;
use crate::runtime;
use crate::runtime::DefaultRuntime;
use crate::runtime::WorkerState;

/// The interceptor every exported wrapper goes through.
pub type GlobalInterceptor = Interceptor<RealOs, DefaultRuntime, SystemEnv>;

lazy_static! {
    static ref GLOBAL: GlobalInterceptor = {
        let config = Config::from_env();
        let runtime = DefaultRuntime::new(config.coord_sock.clone());
        Interceptor::new(RealOs, runtime, SystemEnv, config)
    };
}

/// Returns the process-wide interceptor, so plugins can subscribe to its
/// events and the checkpoint trigger can take its lock.
pub fn global() -> &'static GlobalInterceptor {
    &GLOBAL
}

fn fail(err: Error) -> c_int {
    set_errno(err.errno());
    -1
}

unsafe extern "C" fn atfork_child() {
    GLOBAL.on_fork_child();
}

/// Sets the library up in a freshly loaded process image.
pub fn initialize() {
    GLOBAL.on_load();

    // Registered before anybody else's handlers, so ours is the first child
    // handler to run.
    let ret = unsafe { libc::pthread_atfork(None, None, Some(atfork_child)) };
    if ret != 0 {
        tracing::error!("pthread_atfork failed: {}", Errno::new(ret));
    }

    runtime::set_worker_state(WorkerState::Running);
}

/// Lets the checkpoint thread publish what it is doing.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub extern "C" fn hijack_set_worker_state(state: u8) {
    runtime::set_worker_state(WorkerState::from_u8(state).unwrap_or(WorkerState::Unknown));
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub extern "C" fn fork() -> pid_t {
    GLOBAL.fork().unwrap_or_else(fail)
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub extern "C" fn vfork() -> pid_t {
    GLOBAL.vfork().unwrap_or_else(fail)
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub extern "C" fn daemon(nochdir: c_int, noclose: c_int) -> c_int {
    match GLOBAL.daemon(nochdir != 0, noclose != 0) {
        Ok(()) => 0,
        Err(err) => fail(err),
    }
}

/// # Safety
///
/// `line` must be NULL or a valid C string.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn system(line: *const c_char) -> c_int {
    let line = (!line.is_null()).then(|| unsafe { CStr::from_ptr(line) });
    GLOBAL.system(line).unwrap_or_else(fail)
}

/// # Safety
///
/// `path` must be a valid C string. `argv` and `envp` must be NULL or
/// NULL-terminated arrays of valid C strings.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn execve(
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    if path.is_null() {
        set_errno(Errno::EFAULT);
        return -1;
    }
    fail(unsafe { GLOBAL.execve(CStr::from_ptr(path), argv, envp) })
}

/// # Safety
///
/// See [`execve`].
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn execv(path: *const c_char, argv: *const *const c_char) -> c_int {
    unsafe { execve(path, argv, GLOBAL.env.environ()) }
}

/// # Safety
///
/// See [`execve`].
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn execvpe(
    file: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    if file.is_null() {
        set_errno(Errno::EFAULT);
        return -1;
    }
    fail(unsafe { GLOBAL.execvpe(CStr::from_ptr(file), argv, envp) })
}

/// # Safety
///
/// See [`execve`].
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn execvp(file: *const c_char, argv: *const *const c_char) -> c_int {
    unsafe { execvpe(file, argv, GLOBAL.env.environ()) }
}

/// A descriptor cannot be given libraries to preload, so this refuses
/// rather than let the program escape checkpointing.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub extern "C" fn fexecve(
    _fd: c_int,
    _argv: *const *const c_char,
    _envp: *const *const c_char,
) -> c_int {
    set_errno(Errno::ENOSYS);
    -1
}

#[cfg(feature = "variadic")]
mod variadic {
    use super::*;
    use crate::args::collect_variadic_argv;
    use crate::error::Context;

    /// # Safety
    ///
    /// The arguments must be valid C strings, terminated by a NULL.
    #[cfg_attr(not(test), unsafe(no_mangle))]
    pub unsafe extern "C" fn execl(path: *const c_char, arg: *const c_char, mut args: ...) -> c_int {
        match collect_variadic_argv(arg, || unsafe { args.arg::<*const c_char>() }) {
            Ok(argv) => unsafe { execv(path, argv.as_ptr()) },
            Err(errno) => fail(Error::new(errno, Context::Args)),
        }
    }

    /// # Safety
    ///
    /// See [`execl`].
    #[cfg_attr(not(test), unsafe(no_mangle))]
    pub unsafe extern "C" fn execlp(file: *const c_char, arg: *const c_char, mut args: ...) -> c_int {
        match collect_variadic_argv(arg, || unsafe { args.arg::<*const c_char>() }) {
            Ok(argv) => unsafe { execvp(file, argv.as_ptr()) },
            Err(errno) => fail(Error::new(errno, Context::Args)),
        }
    }

    /// # Safety
    ///
    /// See [`execl`]. The environment follows the terminating NULL.
    #[cfg_attr(not(test), unsafe(no_mangle))]
    pub unsafe extern "C" fn execle(path: *const c_char, arg: *const c_char, mut args: ...) -> c_int {
        let argv = match collect_variadic_argv(arg, || unsafe { args.arg::<*const c_char>() }) {
            Ok(argv) => argv,
            Err(errno) => return fail(Error::new(errno, Context::Args)),
        };
        unsafe {
            let envp = args.arg::<*const *const c_char>();
            execve(path, argv.as_ptr(), envp)
        }
    }
}

#[cfg(feature = "variadic")]
pub use variadic::*;
