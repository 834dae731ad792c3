/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The `exec` family.
//!
//! An intercepted exec runs in three steps. First the entry checks decide
//! whether the call is ours to handle at all. Then, with the execution lock
//! held, the arguments are copied, the identity is put in the lifeboat and
//! subscribers get to see (and rewrite) the exec. Finally the prepared exec
//! is classified again and carried out. Whenever the real exec returns, every
//! change made to this process is rolled back before the error is returned.

use std::borrow::Cow;
use std::ffi::CStr;
use std::ffi::CString;
use std::ffi::OsStr;
use std::mem::ManuallyDrop;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::path::PathBuf;

use libc::c_char;
use nix::sys::resource::Resource;
use nix::sys::resource::getrlimit;
use nix::sys::resource::setrlimit;
use syscalls::Errno;

use crate::args::BoundedArgs;
use crate::args::MAX_EXTRA_ARGS;
use crate::args::MAX_EXTRA_ENV;
use crate::config::PROTECTED_FD_END;
use crate::config::PROTECTED_FD_START;
use crate::config::PROTECTED_LIFEBOAT_FD;
use crate::dispatch;
use crate::dispatch::ExecCase;
use crate::dispatch::Stage;
use crate::dispatch::Target;
use crate::elf;
use crate::env;
use crate::env::LD_PRELOAD;
use crate::env::ORIG_STACK_LIMIT;
use crate::env::PATH;
use crate::env::PreloadSnapshot;
use crate::env::ProcessEnv;
use crate::env::SCREENDIR;
use crate::error::AddContext;
use crate::error::Context;
use crate::error::Error;
use crate::event::Event;
use crate::event::PreExec;
use crate::interceptor::Interceptor;
use crate::lifeboat::Lifeboat;
use crate::os::Os;
use crate::paths;
use crate::runtime::Runtime;

/// Prefix of the virtual pty slave names handed out to applications.
pub const VIRT_PTS_PREFIX: &[u8] = b"/dev/pts/v";

/// The vectors actually passed to the exec primitive. They are only freed if
/// the exec returns; on success the address space is gone anyway.
struct ExecPatch {
    file: CString,
    argv: BoundedArgs,
    envp: BoundedArgs,
}

fn to_cstring(path: &Path) -> Option<CString> {
    CString::new(path.as_os_str().as_bytes()).ok()
}

/// Sets `key` in an environment block, replacing an existing entry.
fn set_entry(envp: &mut BoundedArgs, key: &str, value: &[u8]) {
    let mut entry = Vec::with_capacity(key.len() + 1 + value.len());
    entry.extend_from_slice(key.as_bytes());
    entry.push(b'=');
    entry.extend_from_slice(value);
    let Ok(entry) = CString::new(entry) else {
        return;
    };

    let pos = envp
        .iter()
        .position(|e| env::split_entry(e.to_bytes()).0 == key.as_bytes());
    match pos {
        Some(i) => envp.set(i, entry),
        None => envp.push(entry),
    }
}

/// The command line a short-lived program is run with through the shell.
fn shell_command(filename: &CStr, argv: &BoundedArgs) -> CString {
    let mut command = filename.to_bytes().to_vec();
    for arg in argv.iter().skip(1) {
        command.push(b' ');
        command.extend_from_slice(arg.to_bytes());
    }
    // Built from C strings, so there is no interior NUL.
    CString::new(command).unwrap_or_default()
}

impl<O, R, E> Interceptor<O, R, E>
where
    O: Os,
    R: Runtime,
    E: ProcessEnv,
{
    /// Replaces the process image, searching `PATH` for names without a
    /// slash. Only returns on failure, with this process left as it was.
    ///
    /// # Safety
    ///
    /// `argv` and `envp` must each be NULL or a NULL-terminated array of
    /// valid C strings.
    pub unsafe fn execvpe(
        &self,
        file: &CStr,
        argv: *const *const c_char,
        envp: *const *const c_char,
    ) -> Error {
        let entry = Target {
            path: file.to_bytes(),
            stage: Stage::Entry,
            ckpt_in_progress: self.ckpt_in_progress(),
            privileged: false,
        };

        let case = dispatch::classify(&entry);
        if case.is_unlocked() {
            return unsafe { self.exec_unlocked(case, file, argv, envp) };
        }

        let guard = self.guard.acquire_exclusive();

        let mut filename = file.to_owned();
        let mut argv = unsafe { BoundedArgs::copy_from_raw(argv, MAX_EXTRA_ARGS) };
        let mut envp = unsafe { BoundedArgs::copy_from_raw(envp, MAX_EXTRA_ENV) };

        let lifeboat = match Lifeboat::launch(
            &self.os,
            &self.config.tmpdir,
            &self.current_identity(),
            PROTECTED_LIFEBOAT_FD,
        ) {
            Ok(lifeboat) => lifeboat,
            Err(err) => {
                tracing::error!("not exec'ing {:?}: {}", filename, err);
                return err;
            }
        };

        self.hooks.notify(&mut Event::PreExec(PreExec {
            filename: &mut filename,
            argv: &mut argv,
            envp: &mut envp,
            serialization_fd: lifeboat.fd(),
        }));

        let resolved = paths::resolve_program(
            OsStr::from_bytes(filename.to_bytes()),
            self.env.var(PATH).as_deref(),
        );
        let privileged = resolved.as_deref().is_some_and(paths::is_privileged);

        let case = dispatch::classify(&Target {
            path: filename.to_bytes(),
            stage: Stage::Prepared,
            ckpt_in_progress: false,
            privileged,
        });
        tracing::debug!("exec {:?} ({:?})", filename, case);

        let err = match case {
            ExecCase::ShortLivedCapture => match self.capture(&filename, &mut argv) {
                Ok(output) => {
                    // This process now stands in for the finished program and
                    // may be checkpointed again.
                    drop(guard);
                    if let Err(err) = self.os.write_stdout(&output) {
                        tracing::warn!("failed to forward output of {:?}: {}", filename, err);
                    }
                    self.os.exit(0);
                }
                Err(err) => err,
            },
            ExecCase::PrivilegedRewrite | ExecCase::FullIntercept => {
                unsafe { self.exec_intercepted(filename, argv, envp, resolved, privileged) }
            }
            // Everything else is executed as is.
            _ => Error::new(
                unsafe { self.os.execvpe(&filename, argv.as_ptr(), envp.as_ptr()) },
                Context::Exec,
            ),
        };

        lifeboat.close(&self.os);
        drop(guard);

        tracing::warn!("exec of {:?} failed: {}", file, err);
        err
    }

    /// Like [`Interceptor::execvpe`], without the `PATH` search.
    ///
    /// # Safety
    ///
    /// See [`Interceptor::execvpe`].
    pub unsafe fn execve(
        &self,
        path: &CStr,
        argv: *const *const c_char,
        envp: *const *const c_char,
    ) -> Error {
        // A name with a slash in it is never looked up.
        let path: Cow<CStr> = if path.to_bytes().contains(&b'/') {
            Cow::Borrowed(path)
        } else {
            let mut relative = b"./".to_vec();
            relative.extend_from_slice(path.to_bytes());
            match CString::new(relative) {
                Ok(relative) => Cow::Owned(relative),
                Err(_) => return Error::new(Errno::EINVAL, Context::Exec),
            }
        };

        unsafe { self.execvpe(&path, argv, envp) }
    }

    /// Handles the cases decided before the execution lock is taken.
    unsafe fn exec_unlocked(
        &self,
        case: ExecCase,
        file: &CStr,
        argv: *const *const c_char,
        envp: *const *const c_char,
    ) -> Error {
        match case {
            ExecCase::BypassSelfTool => {
                panic!(
                    "{} must not be run under checkpoint control",
                    file.to_string_lossy()
                );
            }
            ExecCase::SpecialRelaunch => unsafe { self.relaunch(file, argv, envp) },
            _ => Error::new(unsafe { self.os.execvpe(file, argv, envp) }, Context::Exec),
        }
    }

    /// Detaches the relay tool from the process tree: the parent exits right
    /// away and the child runs the tool unmodified, without a coordinator
    /// connection.
    unsafe fn relaunch(
        &self,
        file: &CStr,
        argv: *const *const c_char,
        envp: *const *const c_char,
    ) -> Error {
        self.coordinator.close(&self.os);

        match self.os.fork() {
            Ok(0) => Error::new(unsafe { self.os.execvpe(file, argv, envp) }, Context::Exec),
            Ok(_) => self.os.exit(0),
            Err(errno) => {
                tracing::error!("failed to detach {:?}: {}", file, errno);
                Error::new(errno, Context::Fork)
            }
        }
    }

    /// Runs a program that cannot have libraries injected to completion and
    /// returns its output. Fails without side effects.
    fn capture(&self, filename: &CStr, argv: &mut BoundedArgs) -> Result<Vec<u8>, Error> {
        let snapshot = PreloadSnapshot::take(&self.env);
        // The loader refuses to run the program with anything preloaded.
        self.env.remove_var(LD_PRELOAD);

        if filename.to_bytes().ends_with(b"/utempter") {
            for i in 0..argv.len() {
                if !argv.get(i).to_bytes().starts_with(VIRT_PTS_PREFIX) {
                    continue;
                }
                if let Some(real) = self.runtime.real_pty_name(argv.get(i)) {
                    tracing::trace!("{:?} is really {:?}", argv.get(i), real);
                    argv.set(i, real);
                }
            }
        }

        let command = shell_command(filename, argv);
        tracing::debug!("capturing {:?}", command);

        let res = self.os.run_captured(&command).context(Context::Capture);
        if res.is_err() {
            snapshot.restore(&self.env);
        }
        res
    }

    /// Builds the program and arguments a privileged target is run with. The
    /// loader can not preload into a setuid program, so the program is run
    /// through its loader instead, without the elevated privileges.
    fn privileged_invocation(
        &self,
        resolved: &Path,
        argv: &BoundedArgs,
    ) -> Result<(CString, BoundedArgs), Error> {
        let no_interpreter = || Error::new(Errno::ENOEXEC, Context::Privileged);

        let interp = elf::interpreter(resolved)
            .map_err(|_| no_interpreter())?
            .ok_or_else(no_interpreter)?;
        let interp = to_cstring(&interp).ok_or_else(no_interpreter)?;
        let program = to_cstring(resolved).ok_or_else(no_interpreter)?;

        let mut patched = BoundedArgs::with_capacity(argv.len() + 1 + MAX_EXTRA_ARGS);
        patched.push(interp.clone());
        patched.push(program);
        patched.extend(argv.iter().skip(1).map(CStr::to_owned));

        Ok((interp, patched))
    }

    fn use_private_screen_dir(&self, envp: &mut BoundedArgs) {
        let dir = self.config.tmpdir.join("uscreens");
        if let Err(err) = std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)
        {
            tracing::warn!("failed to create {}: {}", dir.display(), err);
        }
        set_entry(envp, SCREENDIR, dir.as_os_str().as_bytes());
    }

    /// Restores the stack limit the launcher found before it raised it for
    /// itself.
    fn restore_stack_limit(&self) {
        let Some(value) = self.env.var(ORIG_STACK_LIMIT) else {
            return;
        };
        let Some(soft) = value.to_str().and_then(|v| v.parse::<u64>().ok()) else {
            tracing::warn!("ignoring malformed {}={:?}", ORIG_STACK_LIMIT, value);
            return;
        };

        let res = getrlimit(Resource::RLIMIT_STACK)
            .and_then(|(_, hard)| setrlimit(Resource::RLIMIT_STACK, soft, hard))
            .context(Context::Limits);
        if let Err(err) = res {
            tracing::warn!("{}", err);
        }
    }

    /// Performs the exec with the injection libraries and reserved settings
    /// propagated into the new image.
    unsafe fn exec_intercepted(
        &self,
        filename: CString,
        argv: BoundedArgs,
        mut envp: BoundedArgs,
        resolved: Option<PathBuf>,
        privileged: bool,
    ) -> Error {
        let target = resolved.unwrap_or_else(|| PathBuf::from(OsStr::from_bytes(filename.to_bytes())));

        let (file, argv) = if privileged {
            if paths::basename(target.as_os_str().as_bytes()) == b"screen" {
                self.use_private_screen_dir(&mut envp);
            }
            match self.privileged_invocation(&target, &argv) {
                Ok(invocation) => invocation,
                Err(err) => {
                    tracing::error!("cannot run {} unprivileged: {}", target.display(), err);
                    return err;
                }
            }
        } else {
            (filename, argv)
        };
        tracing::debug!("will exec {:?} for {}", file, target.display());

        self.restore_stack_limit();

        for fd in PROTECTED_FD_START..PROTECTED_FD_END {
            self.os.clear_cloexec(fd);
        }

        let snapshot = PreloadSnapshot::take(&self.env);
        let envp = env::patch_user_env(&envp, &target, &self.env, &self.config.install_paths());

        let patch = ManuallyDrop::new(ExecPatch { file, argv, envp });
        let errno = unsafe {
            self.os
                .execvpe(&patch.file, patch.argv.as_ptr(), patch.envp.as_ptr())
        };

        drop(ManuallyDrop::into_inner(patch));
        snapshot.restore(&self.env);

        Error::new(errno, Context::Exec)
    }
}
