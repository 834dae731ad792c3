/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! `system(3)`, built on the intercepted fork and exec so that the shell and
//! the command it runs join the checkpointed process tree.

use std::ffi::CStr;

use libc::c_int;
use nix::sys::signal::SaFlags;
use nix::sys::signal::SigAction;
use nix::sys::signal::SigHandler;
use nix::sys::signal::SigSet;
use nix::sys::signal::SigmaskHow;
use nix::sys::signal::Signal;
use nix::sys::signal::sigaction;
use nix::sys::signal::sigprocmask;

use crate::env::ProcessEnv;
use crate::error::AddContext;
use crate::error::Context;
use crate::error::Error;
use crate::interceptor::Interceptor;
use crate::os::Os;
use crate::runtime::Runtime;

/// Exit status of a child that could not run the shell.
const EXIT_NO_SHELL: i32 = 127;

/// Signal dispositions changed while waiting for the shell.
struct SavedSignals {
    int: SigAction,
    quit: SigAction,
    mask: SigSet,
}

impl SavedSignals {
    /// Ignores `SIGINT` and `SIGQUIT` and blocks `SIGCHLD`.
    fn install() -> Result<Self, Error> {
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());

        let int = unsafe { sigaction(Signal::SIGINT, &ignore) }.context(Context::System)?;
        let quit = match unsafe { sigaction(Signal::SIGQUIT, &ignore) } {
            Ok(quit) => quit,
            Err(err) => {
                let _ = unsafe { sigaction(Signal::SIGINT, &int) };
                return Err(err).context(Context::System);
            }
        };

        let mut block = SigSet::empty();
        block.add(Signal::SIGCHLD);
        let mut mask = SigSet::empty();
        if let Err(err) = sigprocmask(SigmaskHow::SIG_BLOCK, Some(&block), Some(&mut mask)) {
            let _ = unsafe { sigaction(Signal::SIGINT, &int) };
            let _ = unsafe { sigaction(Signal::SIGQUIT, &quit) };
            return Err(err).context(Context::System);
        }

        Ok(Self { int, quit, mask })
    }

    fn restore(&self) {
        unsafe {
            let _ = sigaction(Signal::SIGINT, &self.int);
            let _ = sigaction(Signal::SIGQUIT, &self.quit);
        }
        let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.mask), None);
    }
}

impl<O, R, E> Interceptor<O, R, E>
where
    O: Os,
    R: Runtime,
    E: ProcessEnv,
{
    /// Runs `line` with `/bin/sh -c` and returns its raw wait status. Without
    /// a command line, reports whether a shell is available at all.
    pub fn system(&self, line: Option<&CStr>) -> Result<c_int, Error> {
        let Some(line) = line else {
            return Ok((self.system(Some(c"exit 0"))? == 0) as c_int);
        };

        let saved = SavedSignals::install()?;

        let pid = match self.fork() {
            Ok(pid) => pid,
            Err(err) => {
                saved.restore();
                return Err(err);
            }
        };

        if pid == 0 {
            saved.restore();
            let argv = [c"sh".as_ptr(), c"-c".as_ptr(), line.as_ptr(), core::ptr::null()];
            let err = unsafe { self.execvpe(c"/bin/sh", argv.as_ptr(), self.env.environ()) };
            tracing::error!("failed to run {:?}: {}", line, err);
            self.os.exit(EXIT_NO_SHELL);
        }

        let status = self.os.waitpid(pid).context(Context::System);
        saved.restore();
        status
    }
}

#[cfg(test)]
mod tests {
    use syscalls::Errno;

    use super::*;
    use crate::env::HIJACK_LIBS;
    use crate::env::LD_PRELOAD;
    use crate::testing::Call;
    use crate::testing::ForkOutcome;
    use crate::testing::MockEnv;
    use crate::testing::MockOs;
    use crate::testing::MockRuntime;
    use crate::testing::UNIT_TEST_LOCK;
    use crate::testing::expect_exit;
    use crate::testing::expect_replaced;
    use crate::testing::interceptor;

    fn sigint_handler() -> SigHandler {
        let probe = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        let old = unsafe { sigaction(Signal::SIGINT, &probe) }.unwrap();
        unsafe { sigaction(Signal::SIGINT, &old) }.unwrap();
        old.handler()
    }

    #[test]
    fn parent_waits_for_shell() {
        let _lock = UNIT_TEST_LOCK.lock();
        let os = MockOs::new();
        os.push_fork(ForkOutcome::Parent(64));
        os.set_wait_status(3 << 8);
        let hijack = interceptor(os, MockRuntime::new(), MockEnv::new(&[]));
        let before = sigint_handler();

        assert_eq!(hijack.system(Some(c"exit 3")), Ok(3 << 8));
        assert!(hijack.os.calls().contains(&Call::Waitpid(64)));
        assert_eq!(sigint_handler(), before);
        assert!(!hijack.guard().is_locked());
    }

    #[test]
    fn child_runs_the_shell() {
        let _lock = UNIT_TEST_LOCK.lock();
        let os = MockOs::new();
        os.push_fork(ForkOutcome::Child(65));
        let env = MockEnv::new(&[(HIJACK_LIBS, "libhijack.so"), ("HOME", "/root")]);
        let hijack = interceptor(os, MockRuntime::new(), env);
        let before = sigint_handler();

        expect_replaced(|| hijack.system(Some(c"echo hi")));

        let exec = hijack
            .os
            .calls()
            .into_iter()
            .find(|c| matches!(c, Call::Exec { .. }))
            .unwrap();
        let Call::Exec { file, argv, envp } = exec else {
            unreachable!()
        };
        assert_eq!(file, "/bin/sh");
        assert_eq!(argv, ["sh", "-c", "echo hi"]);
        assert!(envp.contains(&String::from("HOME=/root")));
        assert!(envp.contains(&format!("{}=libhijack.so", LD_PRELOAD)));
        assert_eq!(sigint_handler(), before);
    }

    #[test]
    fn child_exits_127_without_shell() {
        let _lock = UNIT_TEST_LOCK.lock();
        let os = MockOs::new();
        os.push_fork(ForkOutcome::Child(66));
        os.fail_exec(Errno::ENOENT);
        let hijack = interceptor(os, MockRuntime::new(), MockEnv::new(&[]));

        assert_eq!(expect_exit(|| hijack.system(Some(c"true"))), 127);
    }

    #[test]
    fn null_line_probes_for_shell() {
        let _lock = UNIT_TEST_LOCK.lock();
        let os = MockOs::new();
        os.push_fork(ForkOutcome::Parent(67));
        os.set_wait_status(0);
        let hijack = interceptor(os, MockRuntime::new(), MockEnv::new(&[]));
        assert_eq!(hijack.system(None), Ok(1));

        let os = MockOs::new();
        os.push_fork(ForkOutcome::Parent(68));
        os.set_wait_status(127 << 8);
        let hijack = interceptor(os, MockRuntime::new(), MockEnv::new(&[]));
        assert_eq!(hijack.system(None), Ok(0));
    }

    #[test]
    fn fork_failure_restores_signals() {
        let _lock = UNIT_TEST_LOCK.lock();
        let os = MockOs::new();
        os.push_fork(ForkOutcome::Fail(Errno::ENOMEM));
        let hijack = interceptor(os, MockRuntime::new(), MockEnv::new(&[]));
        let before = sigint_handler();

        assert_eq!(
            hijack.system(Some(c"true")),
            Err(Error::new(Errno::ENOMEM, Context::Fork))
        );
        assert_eq!(sigint_handler(), before);
        assert!(!hijack.os.calls().iter().any(|c| matches!(c, Call::Waitpid(_))));
    }
}
